/**
 * KERNEL BRIDGE - Requêtes alertes console → kernel via MQTT
 *
 * RÔLE :
 * Transforme le couple topic commande / topic réponse en appels
 * requête-réponse asynchrones, corrélés par request_id.
 *
 * FONCTIONNEMENT :
 * - request() enregistre un oneshot sous le request_id puis publie la commande
 * - Chaque commande porte le connection_id : le kernel répond sur le topic
 *   réponse propre à cette console (response_topic())
 * - handle_response() (appelé par la boucle MQTT) réveille l'appelant
 * - Sans réponse dans le délai, l'entrée est retirée et l'appel échoue
 *
 * UTILITÉ DANS TWINWATCH :
 * 🎯 Chargement initial des alertes avant que la session soit "prête"
 * 🎯 Résolution / non-résolution avec le statut réel en cas de refus
 */

use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use twinwatch_kernel::alerts::{AlertPage, AlertQuery};
use twinwatch_kernel::contracts::{alert_response_topic, AlertCommand, AlertResponse, ALERT_COMMAND};
use twinwatch_kernel::models::{Alert, AlertStatus, Role};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("kernel did not answer within {0:?}")]
    Timeout(Duration),
    #[error("response channel closed")]
    Closed,
    #[error("mqtt publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
    #[error("invalid payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{action} refused: {error}")]
    Refused { action: String, error: String, current_status: Option<AlertStatus> },
}

pub struct KernelBridge {
    mqtt_client: AsyncClient,
    connection_id: String,
    /// request_id -> sender pour la réponse
    pending_requests: Arc<Mutex<HashMap<String, oneshot::Sender<AlertResponse>>>>,
    reply_timeout: Duration,
}

impl KernelBridge {
    pub fn new(mqtt_client: AsyncClient, connection_id: impl Into<String>) -> Self {
        Self {
            mqtt_client,
            connection_id: connection_id.into(),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            reply_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Seul topic réponse auquel la console s'abonne
    pub fn response_topic(&self) -> String {
        alert_response_topic(&self.connection_id)
    }

    /// Réponse reçue sur le topic réponse. Renvoie false si personne ne l'attendait.
    pub fn handle_response(&self, response: AlertResponse) -> bool {
        let request_id = response.request_id().to_string();
        match self.pending_requests.lock().remove(&request_id) {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!("[bridge] caller for {request_id} gave up before the answer");
                }
                true
            }
            None => {
                // arrivée après le timeout
                debug!("[bridge] ignoring response for unknown request {request_id}");
                false
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending_requests.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn in_flight_ids(&self) -> Vec<String> {
        self.pending_requests.lock().keys().cloned().collect()
    }

    pub async fn request(&self, command: AlertCommand) -> Result<AlertResponse, BridgeError> {
        let request_id = command.request_id().to_string();
        let payload = serde_json::to_string(&command)?;

        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.mqtt_client.publish(ALERT_COMMAND, QoS::AtLeastOnce, false, payload).await {
            self.pending_requests.lock().remove(&request_id);
            return Err(e.into());
        }

        match timeout(self.reply_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending_requests.lock().remove(&request_id);
                Err(BridgeError::Closed)
            }
            Err(_) => {
                self.pending_requests.lock().remove(&request_id);
                warn!("[bridge] {} {} timed out", command.action(), request_id);
                Err(BridgeError::Timeout(self.reply_timeout))
            }
        }
    }

    async fn request_data(&self, command: AlertCommand) -> Result<serde_json::Value, BridgeError> {
        match self.request(command).await? {
            AlertResponse::Success { data, .. } => Ok(data),
            AlertResponse::Error { action, error, current_status, .. } => {
                Err(BridgeError::Refused { action, error, current_status })
            }
        }
    }

    /// Toutes les alertes visibles par l'utilisateur, page par page
    pub async fn fetch_alerts(&self, user_id: &str, role: Role) -> Result<Vec<Alert>, BridgeError> {
        let mut alerts = Vec::new();
        let mut page = 1;
        loop {
            let command = AlertCommand::List {
                connection_id: self.connection_id.clone(),
                request_id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                role,
                query: AlertQuery { page, page_size: 100, ..Default::default() },
            };
            let result: AlertPage = serde_json::from_value(self.request_data(command).await?)?;
            alerts.extend(result.data);
            if page >= result.meta.total_pages {
                return Ok(alerts);
            }
            page += 1;
        }
    }

    pub async fn resolve(&self, alert_id: &str, user_id: &str) -> Result<Alert, BridgeError> {
        let command = AlertCommand::Resolve {
            connection_id: self.connection_id.clone(),
            request_id: Uuid::new_v4().to_string(),
            alert_id: alert_id.to_string(),
            user_id: user_id.to_string(),
        };
        Ok(serde_json::from_value(self.request_data(command).await?)?)
    }

    pub async fn unresolve(&self, alert_id: &str, user_id: &str, reason: &str) -> Result<Alert, BridgeError> {
        let command = AlertCommand::Unresolve {
            connection_id: self.connection_id.clone(),
            request_id: Uuid::new_v4().to_string(),
            alert_id: alert_id.to_string(),
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        };
        Ok(serde_json::from_value(self.request_data(command).await?)?)
    }
}
