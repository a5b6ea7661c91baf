/**
 * CONSOLE SESSION - Session opérateur : identité, inbox, abonnements
 *
 * RÔLE :
 * Objet explicitement construit au démarrage et jeté à la déconnexion ;
 * il possède l'inbox d'alertes et la connexion d'observation côté kernel.
 *
 * FONCTIONNEMENT :
 * - initialize() : connect → subscribe → alertes initiales → ingest_initial ;
 *   la session n'est "prête" qu'après cette séquence. Abonnée avant le
 *   chargement, elle ne rate aucune alerte ouverte entre-temps : l'inbox
 *   garde les alertes live reçues pendant le chargement et les rejoue ensuite
 * - on_envelope() : les événements machine_alert alimentent l'inbox
 * - resolve() / unresolve() : appliquent la réponse du kernel, ou son statut
 *   réel quand la transition est refusée
 */

use crate::bridge::{BridgeError, KernelBridge};
use crate::inbox::AlertInbox;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use tracing::{debug, info};
use twinwatch_kernel::contracts::{EventEnvelope, SessionCommand, SESSION_COMMAND};
use twinwatch_kernel::models::{Alert, Role};
use twinwatch_kernel::router::MachineEvent;

#[derive(Debug, Clone)]
pub struct Operator {
    pub user_id: String,
    pub role: Role,
    /// Machines demandées ; ignoré pour un admin (abonnement global)
    pub machines: Vec<String>,
}

pub struct ConsoleSession {
    pub connection_id: String,
    pub operator: Operator,
    client: AsyncClient,
    bridge: KernelBridge,
    inbox: Mutex<AlertInbox>,
}

impl ConsoleSession {
    pub fn new(connection_id: String, operator: Operator, client: AsyncClient, bridge: KernelBridge) -> Self {
        Self { connection_id, operator, client, bridge, inbox: Mutex::new(AlertInbox::new()) }
    }

    pub fn bridge(&self) -> &KernelBridge {
        &self.bridge
    }

    pub fn inbox(&self) -> parking_lot::MutexGuard<'_, AlertInbox> {
        self.inbox.lock()
    }

    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.send(SessionCommand::Connect {
            connection_id: self.connection_id.clone(),
            user_id: self.operator.user_id.clone(),
            role: self.operator.role,
        })
        .await?;

        for command in self.subscriptions() {
            self.send(command).await?;
        }

        let alerts = self.bridge.fetch_alerts(&self.operator.user_id, self.operator.role).await?;
        let count = alerts.len();
        let mut inbox = self.inbox.lock();
        let replayed = inbox.ingest_initial(alerts);
        info!(
            "[console] loaded {count} alerts, {replayed} new while loading ({} pending)",
            inbox.pending_count()
        );
        Ok(())
    }

    fn subscriptions(&self) -> Vec<SessionCommand> {
        if self.operator.role.is_admin() {
            return vec![SessionCommand::Subscribe {
                connection_id: self.connection_id.clone(),
                machine_id: String::new(),
                is_admin: true,
            }];
        }
        self.operator
            .machines
            .iter()
            .map(|machine_id| SessionCommand::Subscribe {
                connection_id: self.connection_id.clone(),
                machine_id: machine_id.clone(),
                is_admin: false,
            })
            .collect()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), BridgeError> {
        let payload = serde_json::to_string(&command)?;
        self.client.publish(SESSION_COMMAND, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    /// Événement reçu sur le topic de la connexion. Renvoie l'alerte si elle est nouvelle.
    pub fn on_envelope(&self, envelope: EventEnvelope) -> Result<Option<Alert>, serde_json::Error> {
        match envelope.into_event()? {
            MachineEvent::Alert(alert) => {
                let fresh = self.inbox.lock().ingest_live(alert.clone());
                Ok(fresh.then_some(alert))
            }
            MachineEvent::Update(update) => {
                debug!(machine_id = %update.machine_id, "{} metric(s)", update.metrics.len());
                Ok(None)
            }
            MachineEvent::Status(status) => {
                info!(machine_id = %status.machine_id, "status {:?} (streaming: {})", status.status, status.streaming);
                Ok(None)
            }
        }
    }

    pub async fn resolve(&self, alert_id: &str) -> Result<Alert, BridgeError> {
        let result = self.bridge.resolve(alert_id, &self.operator.user_id).await;
        self.apply(alert_id, result)
    }

    pub async fn unresolve(&self, alert_id: &str, reason: &str) -> Result<Alert, BridgeError> {
        let result = self.bridge.unresolve(alert_id, &self.operator.user_id, reason).await;
        self.apply(alert_id, result)
    }

    fn apply(&self, alert_id: &str, result: Result<Alert, BridgeError>) -> Result<Alert, BridgeError> {
        let mut inbox = self.inbox.lock();
        match &result {
            Ok(alert) => {
                inbox.update_status(&alert.id, alert.status, alert.reason.clone());
            }
            Err(BridgeError::Refused { current_status: Some(current), .. }) => {
                inbox.update_status(alert_id, *current, None);
            }
            Err(_) => {}
        }
        result
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.send(SessionCommand::Disconnect { connection_id: self.connection_id.clone() }).await
    }
}
