/**
 * PORTS COLLABORATEURS - Contrats vers le registre machines et le stockage des alertes
 *
 * RÔLE :
 * Le moteur ne connaît ni base de données ni API d'administration : il passe par
 * deux traits, implémentés ici par un registre issu de la config YAML et un
 * stockage JSON sur disque.
 *
 * FONCTIONNEMENT :
 * - MachineRegistry : seuils, statut, assignations (lecture) + set_status (écriture)
 * - AlertStore : persist / update_persisted / load
 * - Les écritures passent par le worker write-behind (writer.rs) : jamais sous un
 *   verrou du moteur, échecs loggés sans rollback de l'état mémoire
 *
 * UTILITÉ DANS TWINWATCH :
 * ✅ Remplacement transparent (SQL, API admin) sans toucher au moteur
 * ✅ Tests : implémentations en mémoire triviales
 */

pub mod json;
pub mod registry;
pub mod writer;

use crate::models::{Alert, AlertStatus, Machine, MachineStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

pub use json::JsonAlertStore;
pub use registry::ConfigRegistry;
pub use writer::{spawn_write_behind, WriteBehind};

/// Erreurs possibles côté collaborateurs
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Registre des machines (propriété du collaborateur d'administration)
pub trait MachineRegistry: Send + Sync {
    fn machine(&self, machine_id: &str) -> Result<Machine, PortError>;

    fn thresholds(&self, machine_id: &str) -> Result<HashMap<String, f64>, PortError> {
        self.machine(machine_id).map(|m| m.thresholds)
    }

    fn status(&self, machine_id: &str) -> Result<MachineStatus, PortError> {
        self.machine(machine_id).map(|m| m.status)
    }

    fn set_status(&self, machine_id: &str, status: MachineStatus) -> Result<(), PortError>;

    fn list(&self) -> Vec<Machine>;

    /// Machines qu'un utilisateur non-admin peut observer
    fn assigned_machines(&self, user_id: &str) -> HashSet<String> {
        self.list()
            .into_iter()
            .filter(|m| m.assigned_to.iter().any(|u| u == user_id))
            .map(|m| m.id)
            .collect()
    }
}

/// Changement de statut d'une alerte déjà persistée
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatusUpdate {
    pub alert_id: String,
    pub status: AlertStatus,
    pub reason: Option<String>,
    pub resolved_by_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl From<&Alert> for AlertStatusUpdate {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id.clone(),
            status: alert.status,
            reason: alert.reason.clone(),
            resolved_by_id: alert.resolved_by_id.clone(),
            resolved_at: alert.resolved_at,
        }
    }
}

/// Persistance durable des alertes
pub trait AlertStore: Send + Sync {
    fn persist(&self, alert: &Alert) -> Result<(), PortError>;

    fn update_persisted(&self, update: &AlertStatusUpdate) -> Result<(), PortError>;

    fn load(&self) -> Result<Vec<Alert>, PortError>;
}
