/**
 * ALERT INBOX - Cache local des alertes côté opérateur
 *
 * RÔLE :
 * Liste ordonnée (plus récentes d'abord) des alertes visibles par l'opérateur,
 * avec un drapeau `seen` purement local et le compteur d'alertes PENDING.
 *
 * FONCTIONNEMENT :
 * - ingest_initial : remplace la liste, tout est considéré déjà vu, puis rejoue
 *   les alertes live reçues pendant le chargement
 * - ingest_live : avant le chargement initial, l'alerte est mise en attente ;
 *   ensuite nouvelle alerte en tête (non vue), un id déjà connu est mis à jour
 *   sur place, sans doublon ni perte du drapeau seen
 * - Un statut terminal n'est jamais ramené à PENDING par un événement en retard
 * - update_status : transition locale, resolved_at = maintenant pour les statuts terminaux
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Badge "non lues" et compteur PENDING sans aller-retour kernel
 * 🎯 Possédé par la session console, jeté à la déconnexion
 */

use time::OffsetDateTime;
use twinwatch_kernel::models::{Alert, AlertStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub alert: Alert,
    pub seen: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertCounts {
    pub pending: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

#[derive(Debug, Default)]
pub struct AlertInbox {
    entries: Vec<InboxEntry>,
    pending: usize,
    initialized: bool,
    /// Alertes live arrivées avant le chargement initial
    buffered: Vec<Alert>,
}

impl AlertInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chargement initial : déjà passé en revue, donc tout est vu. Les alertes
    /// live mises en attente sont ensuite rejouées ; renvoie combien étaient nouvelles.
    pub fn ingest_initial(&mut self, mut alerts: Vec<Alert>) -> usize {
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts.dedup_by(|a, b| a.id == b.id);
        self.entries = alerts.into_iter().map(|alert| InboxEntry { alert, seen: true }).collect();
        self.pending = self.entries.iter().filter(|e| e.alert.status == AlertStatus::Pending).count();
        self.initialized = true;

        let buffered = std::mem::take(&mut self.buffered);
        buffered.into_iter().filter(|alert| self.ingest_live(alert.clone())).count()
    }

    /// Alerte reçue en direct. Renvoie true si elle est nouvelle (toujours false
    /// avant le chargement initial : elle est mise en attente).
    pub fn ingest_live(&mut self, alert: Alert) -> bool {
        if !self.initialized {
            self.buffered.push(alert);
            return false;
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.alert.id == alert.id) {
            if entry.alert.status.is_terminal() && !alert.status.is_terminal() {
                return false;
            }
            let was_pending = entry.alert.status == AlertStatus::Pending;
            let is_pending = alert.status == AlertStatus::Pending;
            entry.alert = alert;
            self.adjust_pending(was_pending, is_pending);
            return false;
        }

        if alert.status == AlertStatus::Pending {
            self.pending += 1;
        }
        self.entries.insert(0, InboxEntry { alert, seen: false });
        true
    }

    /// Transition locale. Renvoie false si l'alerte est inconnue.
    pub fn update_status(&mut self, alert_id: &str, status: AlertStatus, reason: Option<String>) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.alert.id == alert_id) else {
            return false;
        };
        let was_pending = entry.alert.status == AlertStatus::Pending;
        entry.alert.status = status;
        if status.is_terminal() {
            entry.alert.resolved_at = Some(OffsetDateTime::now_utc());
        }
        if reason.is_some() {
            entry.alert.reason = reason;
        }
        self.adjust_pending(was_pending, status == AlertStatus::Pending);
        true
    }

    fn adjust_pending(&mut self, was_pending: bool, is_pending: bool) {
        match (was_pending, is_pending) {
            (true, false) => self.pending = self.pending.saturating_sub(1),
            (false, true) => self.pending += 1,
            _ => {}
        }
    }

    pub fn mark_all_seen(&mut self) {
        for entry in &mut self.entries {
            entry.seen = true;
        }
    }

    pub fn mark_one_seen(&mut self, alert_id: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.alert.id == alert_id) {
            Some(entry) => {
                entry.seen = true;
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
    }

    pub fn counts(&self) -> AlertCounts {
        self.entries.iter().fold(AlertCounts::default(), |mut c, e| {
            match e.alert.status {
                AlertStatus::Pending => c.pending += 1,
                AlertStatus::Resolved => c.resolved += 1,
                AlertStatus::Unresolved => c.unresolved += 1,
            }
            c
        })
    }

    pub fn unseen_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.seen).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn get(&self, alert_id: &str) -> Option<&InboxEntry> {
        self.entries.iter().find(|e| e.alert.id == alert_id)
    }

    /// Les n entrées les plus récentes
    pub fn recent(&self, n: usize) -> &[InboxEntry] {
        &self.entries[..n.min(self.entries.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use twinwatch_kernel::models::AlertType;

    fn alert(id: &str, status: AlertStatus, age_secs: i64) -> Alert {
        Alert {
            id: id.into(),
            machine_id: "cnc-1".into(),
            parameter_key: "temperature".into(),
            alert_type: AlertType::Warning,
            message: "temperature reached threshold".into(),
            status,
            resolved_by_id: None,
            resolved_at: None,
            reason: None,
            created_at: OffsetDateTime::now_utc() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_initial_load_is_seen_and_sorted() {
        let mut inbox = AlertInbox::new();
        assert!(!inbox.is_initialized());
        inbox.ingest_initial(vec![
            alert("old", AlertStatus::Resolved, 300),
            alert("new", AlertStatus::Pending, 10),
            alert("mid", AlertStatus::Pending, 100),
        ]);

        assert!(inbox.is_initialized());
        assert_eq!(inbox.pending_count(), 2);
        assert_eq!(inbox.unseen_count(), 0);
        let ids: Vec<_> = inbox.recent(10).iter().map(|e| e.alert.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);
    }

    #[test]
    fn test_live_alert_is_prepended_unseen() {
        let mut inbox = AlertInbox::new();
        inbox.ingest_initial(vec![alert("a", AlertStatus::Pending, 60)]);

        assert!(inbox.ingest_live(alert("b", AlertStatus::Pending, 0)));
        assert_eq!(inbox.recent(1)[0].alert.id, "b");
        assert!(!inbox.recent(1)[0].seen);
        assert_eq!(inbox.pending_count(), 2);
        assert_eq!(inbox.unseen_count(), 1);
    }

    #[test]
    fn test_duplicate_live_id_updates_in_place() {
        let mut inbox = AlertInbox::new();
        inbox.ingest_initial(vec![alert("a", AlertStatus::Pending, 60), alert("b", AlertStatus::Pending, 120)]);

        let mut resolved = alert("b", AlertStatus::Resolved, 120);
        resolved.resolved_by_id = Some("eng".into());
        assert!(!inbox.ingest_live(resolved));

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.recent(2)[1].alert.id, "b");
        assert!(inbox.recent(2)[1].seen);
        assert_eq!(inbox.get("b").unwrap().alert.status, AlertStatus::Resolved);
        assert_eq!(inbox.pending_count(), 1);
    }

    #[test]
    fn test_live_alerts_before_initial_load_are_replayed() {
        let mut inbox = AlertInbox::new();
        assert!(!inbox.ingest_live(alert("early", AlertStatus::Pending, 5)));
        assert!(!inbox.ingest_live(alert("both", AlertStatus::Pending, 30)));
        assert_eq!(inbox.len(), 0);
        assert_eq!(inbox.buffered_count(), 2);

        // "both" figure aussi dans la page initiale, déjà résolue
        let replayed = inbox.ingest_initial(vec![alert("both", AlertStatus::Resolved, 30), alert("old", AlertStatus::Pending, 90)]);
        assert_eq!(replayed, 1);
        assert_eq!(inbox.buffered_count(), 0);
        assert_eq!(inbox.len(), 3);
        assert_eq!(inbox.get("both").unwrap().alert.status, AlertStatus::Resolved);
        assert!(!inbox.get("early").unwrap().seen);
        assert_eq!(inbox.pending_count(), 2);
    }

    #[test]
    fn test_update_status_adjusts_pending() {
        let mut inbox = AlertInbox::new();
        inbox.ingest_initial(vec![alert("a", AlertStatus::Pending, 60)]);

        assert!(inbox.update_status("a", AlertStatus::Unresolved, Some("sensor fault".into())));
        let entry = inbox.get("a").unwrap();
        assert_eq!(entry.alert.reason.as_deref(), Some("sensor fault"));
        assert!(entry.alert.resolved_at.is_some());
        assert_eq!(inbox.pending_count(), 0);

        // la raison existante survit à une mise à jour sans raison
        assert!(inbox.update_status("a", AlertStatus::Resolved, None));
        assert_eq!(inbox.get("a").unwrap().alert.reason.as_deref(), Some("sensor fault"));
        assert_eq!(inbox.pending_count(), 0);

        assert!(!inbox.update_status("missing", AlertStatus::Resolved, None));
        assert_eq!(inbox.counts(), AlertCounts { pending: 0, resolved: 1, unresolved: 0 });
    }

    #[test]
    fn test_seen_bookkeeping() {
        let mut inbox = AlertInbox::new();
        inbox.ingest_initial(vec![]);
        inbox.ingest_live(alert("a", AlertStatus::Pending, 2));
        inbox.ingest_live(alert("b", AlertStatus::Pending, 1));
        assert_eq!(inbox.unseen_count(), 2);

        assert!(inbox.mark_one_seen("a"));
        assert!(!inbox.mark_one_seen("zzz"));
        assert_eq!(inbox.unseen_count(), 1);

        inbox.mark_all_seen();
        assert_eq!(inbox.unseen_count(), 0);
        assert_eq!(inbox.pending_count(), 2);
    }
}
