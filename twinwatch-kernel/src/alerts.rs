/**
 * CYCLE DE VIE DES ALERTES - Ouverture, résolution, marquage non résolu
 *
 * RÔLE :
 * Machine à états des alertes : PENDING → RESOLVED | UNRESOLVED.
 * Les deux états finaux sont terminaux pour l'instance ; un nouvel IN_BAND
 * crée une nouvelle alerte, jamais une réouverture.
 *
 * FONCTIONNEMENT :
 * - Un "carnet" par machine (verrou dédié) : alertes + index des PENDING par paramètre
 * - `open` est un check-then-act sous le verrou du carnet : au plus une alerte
 *   PENDING par (machine, paramètre), un doublon renvoie l'id existant
 * - `resolve` / `mark_unresolved` exigent PENDING, sinon InvalidState avec le
 *   statut courant pour que l'UI se rafraîchisse
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Traçabilité : qui a résolu, quand, pourquoi
 * 🎯 Liste paginée pour le dashboard (meta.pending inclus)
 */

use crate::models::{Alert, AlertStatus, AlertType, ParameterSpec};
use crate::state::{new_state, Shared};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(String),
    #[error("alert {id} is {current:?}, only PENDING alerts can change status")]
    InvalidState { id: String, current: AlertStatus },
    #[error("a non-empty reason is required to mark an alert unresolved")]
    EmptyReason,
}

/// Demande d'ouverture émise lors d'un passage en IN_BAND
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub machine_id: String,
    pub parameter_key: String,
    pub alert_type: AlertType,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened(Alert),
    /// Une alerte PENDING existe déjà pour ce paramètre : son id
    Suppressed(String),
}

impl OpenOutcome {
    pub fn alert_id(&self) -> &str {
        match self {
            OpenOutcome::Opened(alert) => &alert.id,
            OpenOutcome::Suppressed(id) => id,
        }
    }
}

/// ERROR au-delà de `threshold × error_ratio`, WARNING sinon
pub fn severity(value: f64, threshold: f64, error_ratio: f64) -> AlertType {
    if value >= threshold * error_ratio {
        AlertType::Error
    } else {
        AlertType::Warning
    }
}

pub fn breach_message(machine_name: &str, spec: &ParameterSpec, value: f64, threshold: f64) -> String {
    let unit = if spec.unit.is_empty() { String::new() } else { format!(" {}", spec.unit) };
    format!(
        "{} at {:.2}{unit} reached threshold {:.2}{unit} on {machine_name}",
        spec.label, value, threshold
    )
}

/// Taille de page maximale servie, quelle que soit la demande
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertQuery {
    /// None = toutes les machines (admin)
    pub machine_ids: Option<HashSet<String>>,
    pub status: Option<AlertStatus>,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPage {
    pub data: Vec<Alert>,
    pub meta: PageMeta,
}

#[derive(Default)]
struct AlertBook {
    alerts: Vec<Alert>,
    open: HashMap<String, String>,   // parameter_key -> alert id PENDING
}

impl AlertBook {
    fn transition(
        &mut self,
        alert_id: &str,
        apply: impl FnOnce(&mut Alert),
    ) -> Result<Alert, AlertError> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| AlertError::NotFound(alert_id.to_string()))?;
        if alert.status != AlertStatus::Pending {
            return Err(AlertError::InvalidState { id: alert.id.clone(), current: alert.status });
        }
        apply(alert);
        let updated = alert.clone();
        if self.open.get(&updated.parameter_key) == Some(&updated.id) {
            self.open.remove(&updated.parameter_key);
        }
        Ok(updated)
    }
}

#[derive(Default)]
pub struct AlertLifecycle {
    books: RwLock<HashMap<String, Shared<AlertBook>>>,
    index: RwLock<HashMap<String, String>>,   // alert id -> machine id
}

impl AlertLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, machine_id: &str) -> Shared<AlertBook> {
        if let Some(book) = self.books.read().get(machine_id) {
            return book.clone();
        }
        self.books
            .write()
            .entry(machine_id.to_string())
            .or_insert_with(|| new_state(AlertBook::default()))
            .clone()
    }

    fn book_of(&self, alert_id: &str) -> Result<Shared<AlertBook>, AlertError> {
        let machine_id = self
            .index
            .read()
            .get(alert_id)
            .cloned()
            .ok_or_else(|| AlertError::NotFound(alert_id.to_string()))?;
        Ok(self.book(&machine_id))
    }

    /// Ouvre une alerte PENDING, ou renvoie l'id de celle déjà ouverte
    pub fn open(&self, request: AlertRequest) -> OpenOutcome {
        let book = self.book(&request.machine_id);
        let mut book = book.lock();

        if let Some(existing) = book.open.get(&request.parameter_key) {
            debug!(
                machine_id = %request.machine_id,
                parameter = %request.parameter_key,
                alert_id = %existing,
                "DuplicateAlertSuppressed"
            );
            return OpenOutcome::Suppressed(existing.clone());
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            machine_id: request.machine_id,
            parameter_key: request.parameter_key,
            alert_type: request.alert_type,
            message: request.message,
            status: AlertStatus::Pending,
            resolved_by_id: None,
            resolved_at: None,
            reason: None,
            created_at: OffsetDateTime::now_utc(),
        };
        book.open.insert(alert.parameter_key.clone(), alert.id.clone());
        book.alerts.push(alert.clone());
        self.index.write().insert(alert.id.clone(), alert.machine_id.clone());
        OpenOutcome::Opened(alert)
    }

    pub fn resolve(&self, alert_id: &str, resolving_user_id: &str) -> Result<Alert, AlertError> {
        let book = self.book_of(alert_id)?;
        let mut book = book.lock();
        book.transition(alert_id, |alert| {
            alert.status = AlertStatus::Resolved;
            alert.resolved_by_id = Some(resolving_user_id.to_string());
            alert.resolved_at = Some(OffsetDateTime::now_utc());
        })
    }

    pub fn mark_unresolved(
        &self,
        alert_id: &str,
        resolving_user_id: &str,
        reason: &str,
    ) -> Result<Alert, AlertError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AlertError::EmptyReason);
        }
        let book = self.book_of(alert_id)?;
        let mut book = book.lock();
        book.transition(alert_id, |alert| {
            alert.status = AlertStatus::Unresolved;
            alert.resolved_by_id = Some(resolving_user_id.to_string());
            alert.resolved_at = Some(OffsetDateTime::now_utc());
            alert.reason = Some(reason.to_string());
        })
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        let book = self.book_of(alert_id).ok()?;
        let book = book.lock();
        book.alerts.iter().find(|a| a.id == alert_id).cloned()
    }

    /// Id de l'alerte PENDING pour (machine, paramètre), s'il y en a une
    pub fn pending_for(&self, machine_id: &str, parameter_key: &str) -> Option<String> {
        let book = self.books.read().get(machine_id).cloned()?;
        let book = book.lock();
        book.open.get(parameter_key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        let books: Vec<_> = self.books.read().values().cloned().collect();
        books.iter().map(|b| b.lock().open.len()).sum()
    }

    /// Liste paginée (page à partir de 1), plus récentes d'abord
    pub fn list(&self, query: &AlertQuery) -> AlertPage {
        let books: Vec<_> = {
            let books = self.books.read();
            books
                .iter()
                .filter(|(machine_id, _)| {
                    query.machine_ids.as_ref().map_or(true, |ids| ids.contains(*machine_id))
                })
                .map(|(_, book)| book.clone())
                .collect()
        };

        let mut pending = 0;
        let mut matching = Vec::new();
        for book in books {
            let book = book.lock();
            pending += book.open.len();
            matching.extend(
                book.alerts
                    .iter()
                    .filter(|a| query.status.map_or(true, |s| a.status == s))
                    .cloned(),
            );
        }
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
        let page = query.page.max(1);
        let total = matching.len();
        let offset = (page - 1).saturating_mul(page_size);
        let data = matching.into_iter().skip(offset).take(page_size).collect();

        AlertPage {
            data,
            meta: PageMeta { page, page_size, total, total_pages: total.div_ceil(page_size), pending },
        }
    }

    /// Recharge des alertes persistées (démarrage). Les PENDING reconstruisent l'index
    /// des alertes ouvertes pour que la suppression des doublons survive au redémarrage.
    pub fn load(&self, mut alerts: Vec<Alert>) -> usize {
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let count = alerts.len();
        for alert in alerts {
            let book = self.book(&alert.machine_id);
            let mut book = book.lock();
            if book.alerts.iter().any(|a| a.id == alert.id) {
                continue;
            }
            if alert.status == AlertStatus::Pending {
                if let Some(existing) = book.open.get(&alert.parameter_key) {
                    warn!(
                        alert_id = %alert.id,
                        existing = %existing,
                        "second PENDING alert for the same parameter in store, keeping the first open"
                    );
                } else {
                    book.open.insert(alert.parameter_key.clone(), alert.id.clone());
                }
            }
            self.index.write().insert(alert.id.clone(), alert.machine_id.clone());
            book.alerts.push(alert);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(machine: &str, key: &str) -> AlertRequest {
        AlertRequest {
            machine_id: machine.into(),
            parameter_key: key.into(),
            alert_type: AlertType::Warning,
            message: format!("{key} high"),
        }
    }

    fn opened(outcome: OpenOutcome) -> Alert {
        match outcome {
            OpenOutcome::Opened(alert) => alert,
            other => panic!("expected Opened, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_open_is_suppressed() {
        let alerts = AlertLifecycle::new();
        let first = opened(alerts.open(request("m1", "temperature")));
        let again = alerts.open(request("m1", "temperature"));
        assert_eq!(again, OpenOutcome::Suppressed(first.id.clone()));

        // autre paramètre ou autre machine : ouverture normale
        assert!(matches!(alerts.open(request("m1", "vibration")), OpenOutcome::Opened(_)));
        assert!(matches!(alerts.open(request("m2", "temperature")), OpenOutcome::Opened(_)));
        assert_eq!(alerts.pending_count(), 3);
    }

    #[test]
    fn test_resolve_twice_fails_with_invalid_state() {
        let alerts = AlertLifecycle::new();
        let alert = opened(alerts.open(request("m1", "temperature")));

        let resolved = alerts.resolve(&alert.id, "u1").unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert_eq!(resolved.resolved_by_id.as_deref(), Some("u1"));
        assert!(resolved.resolved_at.is_some());

        let err = alerts.resolve(&alert.id, "u2").unwrap_err();
        assert_eq!(err, AlertError::InvalidState { id: alert.id.clone(), current: AlertStatus::Resolved });
        let err = alerts.mark_unresolved(&alert.id, "u2", "sensor fault").unwrap_err();
        assert!(matches!(err, AlertError::InvalidState { current: AlertStatus::Resolved, .. }));
    }

    #[test]
    fn test_new_alert_after_terminal_state() {
        let alerts = AlertLifecycle::new();
        let first = opened(alerts.open(request("m1", "temperature")));
        alerts.resolve(&first.id, "u1").unwrap();
        assert_eq!(alerts.pending_for("m1", "temperature"), None);

        let second = opened(alerts.open(request("m1", "temperature")));
        assert_ne!(first.id, second.id);
        assert_eq!(alerts.get(&first.id).map(|a| a.status), Some(AlertStatus::Resolved));
    }

    #[test]
    fn test_mark_unresolved_requires_reason() {
        let alerts = AlertLifecycle::new();
        let alert = opened(alerts.open(request("m1", "temperature")));
        assert_eq!(alerts.mark_unresolved(&alert.id, "u1", "   "), Err(AlertError::EmptyReason));

        let updated = alerts.mark_unresolved(&alert.id, "u1", " valve stuck ").unwrap();
        assert_eq!(updated.status, AlertStatus::Unresolved);
        assert_eq!(updated.reason.as_deref(), Some("valve stuck"));
        assert!(updated.resolved_at.is_some());
    }

    #[test]
    fn test_unknown_alert() {
        let alerts = AlertLifecycle::new();
        assert_eq!(alerts.resolve("nope", "u1"), Err(AlertError::NotFound("nope".into())));
    }

    #[test]
    fn test_concurrent_open_keeps_one_pending() {
        let alerts = Arc::new(AlertLifecycle::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alerts = alerts.clone();
                std::thread::spawn(move || {
                    (0..50).filter(|_| matches!(alerts.open(request("m1", "temperature")), OpenOutcome::Opened(_))).count()
                })
            })
            .collect();
        let opened: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(opened, 1);
        assert_eq!(alerts.pending_count(), 1);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let alerts = AlertLifecycle::new();
        let mut ids = Vec::new();
        for key in ["temperature", "vibration", "power"] {
            ids.push(opened(alerts.open(request("m1", key))).id);
        }
        opened(alerts.open(request("m2", "temperature")));
        alerts.resolve(&ids[0], "u1").unwrap();

        let page = alerts.list(&AlertQuery {
            machine_ids: Some(HashSet::from(["m1".to_string()])),
            status: None,
            page: 1,
            page_size: 2,
        });
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.meta, PageMeta { page: 1, page_size: 2, total: 3, total_pages: 2, pending: 2 });

        let pending = alerts.list(&AlertQuery { status: Some(AlertStatus::Pending), page: 1, page_size: 10, ..Default::default() });
        assert_eq!(pending.meta.total, 3);
        assert!(pending.data.iter().all(|a| a.status == AlertStatus::Pending));

        let beyond = alerts.list(&AlertQuery { page: 9, page_size: 10, ..Default::default() });
        assert!(beyond.data.is_empty());
        assert_eq!(beyond.meta.total, 4);
    }

    #[test]
    fn test_list_clamps_oversized_paging() {
        let alerts = AlertLifecycle::new();
        for key in ["temperature", "vibration"] {
            opened(alerts.open(request("m1", key)));
        }

        let huge = alerts.list(&AlertQuery { page: 3, page_size: usize::MAX, ..Default::default() });
        assert!(huge.data.is_empty());
        assert_eq!(huge.meta.page_size, MAX_PAGE_SIZE);
        assert_eq!(huge.meta.total_pages, 1);

        let last = alerts.list(&AlertQuery { page: usize::MAX, page_size: usize::MAX, ..Default::default() });
        assert!(last.data.is_empty());
        assert_eq!(last.meta.total, 2);

        let first = alerts.list(&AlertQuery { page: 1, page_size: usize::MAX, ..Default::default() });
        assert_eq!(first.data.len(), 2);
    }

    #[test]
    fn test_load_rebuilds_open_index() {
        let source = AlertLifecycle::new();
        let pending = opened(source.open(request("m1", "temperature")));
        let done = opened(source.open(request("m1", "vibration")));
        source.resolve(&done.id, "u1").unwrap();
        let stored = source.list(&AlertQuery { page: 1, page_size: 100, ..Default::default() }).data;

        let restored = AlertLifecycle::new();
        assert_eq!(restored.load(stored), 2);
        assert_eq!(restored.open(request("m1", "temperature")), OpenOutcome::Suppressed(pending.id));
        assert!(matches!(restored.open(request("m1", "vibration")), OpenOutcome::Opened(_)));
    }

    #[test]
    fn test_severity_and_message() {
        assert_eq!(severity(105.0, 100.0, 1.10), AlertType::Warning);
        assert_eq!(severity(111.0, 100.0, 1.10), AlertType::Error);
        assert_eq!(severity(119.0, 100.0, 1.20), AlertType::Warning);
        assert_eq!(severity(121.0, 100.0, 1.20), AlertType::Error);
        let spec = ParameterSpec { key: "temperature", label: "Temp", unit: "°C" };
        assert_eq!(
            breach_message("Lathe 1", &spec, 101.0, 100.0),
            "Temp at 101.00 °C reached threshold 100.00 °C on Lathe 1"
        );
    }
}
