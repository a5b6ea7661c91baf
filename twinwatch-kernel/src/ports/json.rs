/**
 * STOCKAGE ALERTES JSON - Implémentation fichier de AlertStore
 *
 * RÔLE :
 * Conserve toutes les alertes (ouvertes et archivées) dans un fichier JSON,
 * rechargé au démarrage du kernel.
 *
 * FONCTIONNEMENT :
 * - Cache mémoire + réécriture complète du fichier à chaque modification
 * - Appelé uniquement depuis le worker write-behind (spawn_blocking)
 */

use super::{AlertStatusUpdate, AlertStore, PortError};
use crate::models::Alert;
use parking_lot::Mutex;
use std::fs;
use std::path::PathBuf;
use tracing::info;

pub struct JsonAlertStore {
    storage_path: PathBuf,
    cache: Mutex<Vec<Alert>>,
}

impl JsonAlertStore {
    /// Ouvre (ou crée) le fichier de stockage
    pub fn new<P: Into<PathBuf>>(storage_path: P) -> Result<Self, PortError> {
        let path = storage_path.into();
        let store = Self { storage_path: path.clone(), cache: Mutex::new(Vec::new()) };
        store.load_from_disk()?;
        info!(path = ?path, alerts = store.cache.lock().len(), "alert store initialized");
        Ok(store)
    }

    fn load_from_disk(&self) -> Result<(), PortError> {
        if !self.storage_path.exists() {
            if let Some(parent) = self.storage_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.storage_path, "[]")?;
        }
        let content = fs::read_to_string(&self.storage_path)?;
        let alerts: Vec<Alert> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content)?
        };
        *self.cache.lock() = alerts;
        Ok(())
    }

    fn save_to_disk(&self, alerts: &[Alert]) -> Result<(), PortError> {
        let json = serde_json::to_string_pretty(alerts)?;
        fs::write(&self.storage_path, json)?;
        Ok(())
    }
}

impl AlertStore for JsonAlertStore {
    fn persist(&self, alert: &Alert) -> Result<(), PortError> {
        let mut cache = self.cache.lock();
        match cache.iter_mut().find(|a| a.id == alert.id) {
            Some(existing) => *existing = alert.clone(),
            None => cache.push(alert.clone()),
        }
        self.save_to_disk(&cache)
    }

    fn update_persisted(&self, update: &AlertStatusUpdate) -> Result<(), PortError> {
        let mut cache = self.cache.lock();
        let alert = cache
            .iter_mut()
            .find(|a| a.id == update.alert_id)
            .ok_or_else(|| PortError::NotFound(update.alert_id.clone()))?;
        alert.status = update.status;
        alert.reason = update.reason.clone();
        alert.resolved_by_id = update.resolved_by_id.clone();
        alert.resolved_at = update.resolved_at;
        self.save_to_disk(&cache)
    }

    fn load(&self) -> Result<Vec<Alert>, PortError> {
        Ok(self.cache.lock().clone())
    }
}
