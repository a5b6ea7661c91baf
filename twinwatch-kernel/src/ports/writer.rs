/**
 * WRITE-BEHIND - Persistance asynchrone hors du chemin critique
 *
 * RÔLE :
 * Le moteur pousse ses écritures (alertes, statuts machine) dans un canal borné
 * (try_send, jamais d'attente) ; ce worker les applique dans l'ordre via spawn_blocking.
 *
 * FONCTIONNEMENT :
 * - Un échec est loggé, jamais réessayé ici, jamais remonté au moteur
 * - File pleine (stockage bloqué) : le moteur abandonne l'écriture avec un warning
 * - L'ordre du canal garantit persist(alert) avant update_persisted(alert)
 */

use super::{AlertStatusUpdate, AlertStore, MachineRegistry};
use crate::models::{Alert, MachineStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub enum WriteBehind {
    PersistAlert(Alert),
    UpdateAlert(AlertStatusUpdate),
    SetStatus { machine_id: String, status: MachineStatus },
}

/// Démarre le worker ; il s'arrête quand tous les émetteurs sont fermés
pub fn spawn_write_behind(
    mut rx: mpsc::Receiver<WriteBehind>,
    registry: Arc<dyn MachineRegistry>,
    store: Arc<dyn AlertStore>,
) -> JoinHandle<()> {
    task::spawn(async move {
        while let Some(op) = rx.recv().await {
            let registry = registry.clone();
            let store = store.clone();
            let label = match &op {
                WriteBehind::PersistAlert(a) => format!("persist alert {}", a.id),
                WriteBehind::UpdateAlert(u) => format!("update alert {}", u.alert_id),
                WriteBehind::SetStatus { machine_id, status } => format!("set {machine_id} {status:?}"),
            };

            let result = task::spawn_blocking(move || match op {
                WriteBehind::PersistAlert(alert) => store.persist(&alert),
                WriteBehind::UpdateAlert(update) => store.update_persisted(&update),
                WriteBehind::SetStatus { machine_id, status } => registry.set_status(&machine_id, status),
            })
            .await;

            match result {
                Ok(Ok(())) => debug!("write-behind: {label}"),
                Ok(Err(e)) => error!("write-behind failed ({label}): {e}"),
                Err(e) => error!("write-behind task panicked ({label}): {e}"),
            }
        }
        info!("write-behind worker stopped");
    })
}
