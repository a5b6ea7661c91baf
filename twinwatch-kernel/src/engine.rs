/**
 * MOTEUR TWINWATCH - Façade : télémétrie → phases → alertes → abonnés
 *
 * RÔLE :
 * Point d'entrée unique exposé aux transports (MQTT, HTTP, WebSocket).
 * Orchestre sessions machine, cycle de vie des alertes et routeur d'abonnements.
 *
 * FONCTIONNEMENT :
 * - Un verrou par machine : deux ticks d'une même machine sont sérialisés,
 *   des machines différentes avancent en parallèle
 * - Le registre (seuils) est lu AVANT de prendre le verrou de session
 * - Sous le verrou : classification, ouverture d'alerte (check-then-act),
 *   publication non bloquante vers les files des abonnés
 * - Les écritures collaborateurs partent dans le canal write-behind, hors verrou
 * - Flux `notifications()` : onMachineUpdate / onAlertChanged pour les consommateurs internes
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Un seul endroit où les invariants (phase, alerte unique, isolation) sont tenus
 * 🎯 Transports interchangeables : ils ne font que traduire vers ces méthodes
 */

use crate::alerts::{breach_message, severity, AlertError, AlertLifecycle, AlertPage, AlertQuery, AlertRequest, OpenOutcome};
use crate::models::{Alert, ParameterReading, Role};
use crate::phase::Bands;
use crate::ports::{AlertStatusUpdate, MachineRegistry, PortError, WriteBehind};
use crate::router::{DeliveryReceiver, Identity, MachineEvent, PublishReport, RouterError, SubscriptionRouter};
use crate::session::{MachineSession, MachineStatusChanged, MachineUpdate, ReadingError, SessionSettings, SessionSnapshot};
use crate::state::{new_state, Shared};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown machine: {0}")]
    UnknownMachine(String),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Alert(#[from] AlertError),
    #[error("machine registry: {0}")]
    Registry(PortError),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub bands: Bands,
    pub session: SessionSettings,
    pub error_ratio: f64,
    pub idle_after: Duration,
    /// Écritures en attente au-delà desquelles le write-behind rejette
    pub write_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bands: Bands::default(),
            session: SessionSettings::default(),
            error_ratio: 1.10,
            idle_after: Duration::from_secs(60),
            write_queue_capacity: 1024,
        }
    }
}

/// Flux interne onMachineUpdate / onAlertChanged
#[derive(Debug, Clone)]
pub enum EngineNotification {
    MachineUpdate(MachineUpdate),
    StatusChanged(MachineStatusChanged),
    AlertChanged(Alert),
}

/// Bilan d'un tick
#[derive(Debug)]
pub struct TickReport {
    pub update: MachineUpdate,
    pub opened: Vec<Alert>,
    pub suppressed: Vec<String>,
    pub rejected: Vec<ReadingError>,
    pub delivered: PublishReport,
}

pub struct TwinEngine {
    registry: Arc<dyn MachineRegistry>,
    alerts: AlertLifecycle,
    router: SubscriptionRouter,
    sessions: RwLock<HashMap<String, Shared<MachineSession>>>,
    settings: EngineSettings,
    write_behind: mpsc::Sender<WriteBehind>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl TwinEngine {
    /// Construit le moteur. Le récepteur renvoyé alimente `ports::spawn_write_behind`.
    pub fn new(
        registry: Arc<dyn MachineRegistry>,
        router: SubscriptionRouter,
        settings: EngineSettings,
    ) -> (Self, mpsc::Receiver<WriteBehind>) {
        let (write_behind, rx) = mpsc::channel(settings.write_queue_capacity.max(1));
        let (notifications, _) = broadcast::channel(256);
        let engine = Self {
            registry,
            alerts: AlertLifecycle::new(),
            router,
            sessions: RwLock::new(HashMap::new()),
            settings,
            write_behind,
            notifications,
        };
        (engine, rx)
    }

    pub fn registry(&self) -> &Arc<dyn MachineRegistry> {
        &self.registry
    }

    pub fn notifications(&self) -> broadcast::Receiver<EngineNotification> {
        self.notifications.subscribe()
    }

    /// Recharge les alertes persistées avant d'accepter de la télémétrie
    pub fn load_alerts(&self, alerts: Vec<Alert>) -> usize {
        self.alerts.load(alerts)
    }

    /// Ne bloque jamais : file pleine ou worker arrêté, l'écriture est abandonnée
    fn defer(&self, op: WriteBehind) {
        match self.write_behind.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op)) => warn!("write-behind queue full, dropping {op:?}"),
            Err(TrySendError::Closed(_)) => warn!("write-behind worker gone, dropping collaborator write"),
        }
    }

    fn notify(&self, notification: EngineNotification) {
        // aucun abonné interne : rien à faire
        let _ = self.notifications.send(notification);
    }

    fn session(&self, machine_id: &str, make: impl FnOnce() -> MachineSession) -> Shared<MachineSession> {
        if let Some(session) = self.sessions.read().get(machine_id) {
            return session.clone();
        }
        self.sessions
            .write()
            .entry(machine_id.to_string())
            .or_insert_with(|| new_state(make()))
            .clone()
    }

    /// Point d'entrée télémétrie : un lot de lectures pour une machine
    pub fn on_telemetry_batch(&self, machine_id: &str, readings: &[ParameterReading]) -> Result<TickReport, EngineError> {
        let machine = self.registry.machine(machine_id).map_err(|e| match e {
            PortError::NotFound(_) => EngineError::UnknownMachine(machine_id.to_string()),
            other => EngineError::Registry(other),
        })?;

        let session = self.session(machine_id, || {
            MachineSession::new(machine_id, machine.machine_type, machine.status, self.settings.session)
        });
        let mut session = session.lock();

        let outcome = session.apply_batch(readings, &machine.thresholds, &self.settings.bands, Instant::now());
        for e in &outcome.rejected {
            warn!(machine_id, "reading dropped: {e}");
        }

        let mut delivered = self.router.publish(MachineEvent::Update(outcome.update.clone()));
        self.notify(EngineNotification::MachineUpdate(outcome.update.clone()));

        if let Some(change) = outcome.status_change {
            info!(machine_id, status = ?change.status, streaming = change.streaming, "machine status changed");
            self.publish_status(change);
        }

        let mut opened = Vec::new();
        let mut suppressed = Vec::new();
        for breach in &outcome.breaches {
            let message = match machine.machine_type.parameter(&breach.key) {
                Some(spec) => breach_message(&machine.name, spec, breach.value, breach.threshold),
                None => format!("{} reached threshold {} on {}", breach.key, breach.threshold, machine.name),
            };
            let request = AlertRequest {
                machine_id: machine_id.to_string(),
                parameter_key: breach.key.clone(),
                alert_type: severity(breach.value, breach.threshold, self.settings.error_ratio),
                message,
            };
            match self.alerts.open(request) {
                OpenOutcome::Opened(alert) => {
                    info!(machine_id, alert_id = %alert.id, parameter = %alert.parameter_key, "alert opened");
                    self.defer(WriteBehind::PersistAlert(alert.clone()));
                    let report = self.router.publish(MachineEvent::Alert(alert.clone()));
                    delivered.delivered += report.delivered;
                    delivered.evicted += report.evicted;
                    delivered.failed += report.failed;
                    self.notify(EngineNotification::AlertChanged(alert.clone()));
                    opened.push(alert);
                }
                OpenOutcome::Suppressed(id) => suppressed.push(id),
            }
        }
        drop(session);

        Ok(TickReport { update: outcome.update, opened, suppressed, rejected: outcome.rejected, delivered })
    }

    fn publish_status(&self, change: MachineStatusChanged) {
        self.defer(WriteBehind::SetStatus { machine_id: change.machine_id.clone(), status: change.status });
        self.router.publish(MachineEvent::Status(change.clone()));
        self.notify(EngineNotification::StatusChanged(change));
    }

    fn alert_changed(&self, alert: Alert) -> Alert {
        self.defer(WriteBehind::UpdateAlert(AlertStatusUpdate::from(&alert)));
        self.router.publish(MachineEvent::Alert(alert.clone()));
        self.notify(EngineNotification::AlertChanged(alert.clone()));
        alert
    }

    pub fn resolve(&self, alert_id: &str, resolving_user_id: &str) -> Result<Alert, EngineError> {
        let alert = self.alerts.resolve(alert_id, resolving_user_id)?;
        info!(alert_id, user_id = resolving_user_id, "alert resolved");
        Ok(self.alert_changed(alert))
    }

    pub fn mark_unresolved(&self, alert_id: &str, resolving_user_id: &str, reason: &str) -> Result<Alert, EngineError> {
        let alert = self.alerts.mark_unresolved(alert_id, resolving_user_id, reason)?;
        info!(alert_id, user_id = resolving_user_id, "alert marked unresolved");
        Ok(self.alert_changed(alert))
    }

    pub fn alert(&self, alert_id: &str) -> Option<Alert> {
        self.alerts.get(alert_id)
    }

    /// Liste paginée ; un non-admin ne voit que ses machines assignées
    pub fn list_alerts(&self, user_id: &str, role: Role, mut query: AlertQuery) -> AlertPage {
        if !role.is_admin() {
            let assigned = self.registry.assigned_machines(user_id);
            query.machine_ids = Some(match query.machine_ids.take() {
                Some(wanted) => wanted.intersection(&assigned).cloned().collect(),
                None => assigned,
            });
        }
        self.alerts.list(&query)
    }

    /// Ouvre une connexion d'observation pour un utilisateur déjà authentifié
    pub fn connect(&self, connection_id: &str, user_id: &str, role: Role) -> DeliveryReceiver {
        let machine_ids = if role.is_admin() { Default::default() } else { self.registry.assigned_machines(user_id) };
        self.router.connect(connection_id, Identity { user_id: user_id.to_string(), role, machine_ids })
    }

    pub fn subscribe(&self, connection_id: &str, machine_id: &str, is_admin: bool) -> Result<bool, EngineError> {
        match self.router.subscribe(connection_id, machine_id, is_admin) {
            Ok(added) => Ok(added),
            Err(e) => {
                warn!(connection_id, machine_id, "subscription rejected: {e}");
                Err(e.into())
            }
        }
    }

    pub fn unsubscribe_all(&self, connection_id: &str) -> bool {
        self.router.unsubscribe_all(connection_id)
    }

    /// Passe en IDLE les machines silencieuses et retire les connexions fermées ;
    /// renvoie les changements de statut publiés
    pub fn sweep_idle(&self, now: Instant) -> Vec<MachineStatusChanged> {
        let pruned = self.router.prune_closed();
        if pruned > 0 {
            debug!("{pruned} closed connection(s) pruned");
        }

        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut changes = Vec::new();
        for session in sessions {
            let mut session = session.lock();
            if let Some(change) = session.check_idle(now, self.settings.idle_after) {
                debug!(machine_id = %change.machine_id, "machine went idle");
                self.publish_status(change.clone());
                changes.push(change);
            }
        }
        changes
    }

    pub fn session_snapshot(&self, machine_id: &str) -> Option<SessionSnapshot> {
        let session = self.sessions.read().get(machine_id).cloned()?;
        let snapshot = session.lock().snapshot();
        Some(snapshot)
    }

    pub fn machines_tracked(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn pending_alerts(&self) -> usize {
        self.alerts.pending_count()
    }

    pub fn connection_count(&self) -> usize {
        self.router.connection_count()
    }

    pub fn dropped_deliveries(&self) -> u64 {
        self.router.dropped_deliveries()
    }

    /// Démarre le balayage périodique des machines inactives
    pub fn spawn_idle_monitor(engine: Arc<Self>, every: Duration) -> JoinHandle<()> {
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let changes = engine.sweep_idle(Instant::now());
                if !changes.is_empty() {
                    info!("{} machine(s) marked idle", changes.len());
                }
            }
        })
    }
}
