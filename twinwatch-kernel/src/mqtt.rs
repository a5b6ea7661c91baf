/**
 * LISTENER MQTT - Ingestion télémétrie + sessions d'observation + commandes alertes
 *
 * RÔLE :
 * Traduit les messages MQTT en appels au moteur et republie ses événements.
 *
 * FONCTIONNEMENT :
 * - twinwatch/machines/+/telemetry@v1 → on_telemetry_batch
 * - twinwatch/sessions/command@v1 → connect / subscribe / disconnect (+ ack)
 * - Chaque connexion a sa tâche de forward (file bornée → topic events@v1),
 *   une connexion lente ne bloque ni l'eventloop ni les autres
 * - twinwatch/alerts/command@v1 → list / resolve / unresolve, réponse corrélée
 *   par request_id sur twinwatch/alerts/{connection_id}/response@v1 (jamais un
 *   topic partagé : une page admin ne fuit pas vers une autre console)
 * - Les publications depuis la boucle sont spawnées : l'eventloop n'attend jamais
 */

use crate::config::MqttConf;
use crate::contracts::{
    self, AlertCommand, AlertResponse, EventEnvelope, SessionAck, SessionCommand, TelemetryBatch,
};
use crate::engine::{EngineError, TwinEngine};
use crate::alerts::AlertError;
use crate::health::HealthTracker;
use crate::router::DeliveryReceiver;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub fn spawn_mqtt_listener(engine: Arc<TwinEngine>, cfg: MqttConf, health: HealthTracker) -> JoinHandle<()> {
    task::spawn(async move {
        let mut opts = MqttOptions::new("twinwatch-kernel", &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("connected to MQTT broker {}:{}", cfg.host, cfg.port);
                    health.mark_mqtt_connected();
                    subscribe_topics(&client);
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    dispatch(&engine, &client, &p.topic, &p.payload);
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT erreur: {e:?}");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn subscribe_topics(client: &AsyncClient) {
    for topic in [contracts::TELEMETRY_WILDCARD, contracts::SESSION_COMMAND, contracts::ALERT_COMMAND] {
        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
            error!("subscribe MQTT {topic} failed: {e:?}");
        }
    }
}

fn dispatch(engine: &TwinEngine, client: &AsyncClient, topic: &str, payload: &[u8]) {
    if let Some(machine_id) = contracts::machine_from_telemetry_topic(topic) {
        handle_telemetry(engine, machine_id, payload);
    } else if topic == contracts::SESSION_COMMAND {
        match serde_json::from_slice::<SessionCommand>(payload) {
            Ok(cmd) => {
                let connection_id = cmd.connection_id().to_string();
                let (ack, receiver) = handle_session_command(engine, cmd);
                if let Some(receiver) = receiver {
                    spawn_forwarder(client.clone(), connection_id.clone(), receiver);
                }
                if let Some(ack) = ack {
                    publish_json(client, contracts::session_ack_topic(&connection_id), &ack);
                }
            }
            Err(e) => warn!("session command JSON invalide: {e}"),
        }
    } else if topic == contracts::ALERT_COMMAND {
        if let Some((reply_topic, response)) = route_alert_command(engine, payload) {
            publish_json(client, reply_topic, &response);
        }
    }
}

fn handle_telemetry(engine: &TwinEngine, machine_id: &str, payload: &[u8]) {
    let batch = match serde_json::from_slice::<TelemetryBatch>(payload) {
        Ok(batch) => batch,
        Err(e) => {
            warn!(machine_id, "telemetry JSON invalide: {e}");
            return;
        }
    };
    if let Some(declared) = batch.machine_id.as_deref() {
        if declared != machine_id {
            warn!(machine_id, declared, "telemetry machine id does not match topic, batch dropped");
            return;
        }
    }
    match engine.on_telemetry_batch(machine_id, &batch.readings) {
        Ok(report) => debug!(
            machine_id,
            metrics = report.update.metrics.len(),
            opened = report.opened.len(),
            delivered = report.delivered.delivered,
            "telemetry tick"
        ),
        Err(e) => warn!(machine_id, "telemetry rejected: {e}"),
    }
}

/// Applique une commande de session. Renvoie l'ack à publier (aucun pour disconnect)
/// et, pour connect, la file de la nouvelle connexion.
pub fn handle_session_command(
    engine: &TwinEngine,
    cmd: SessionCommand,
) -> (Option<SessionAck>, Option<DeliveryReceiver>) {
    match cmd {
        SessionCommand::Connect { connection_id, user_id, role } => {
            let receiver = engine.connect(&connection_id, &user_id, role);
            info!(connection_id = %connection_id, user_id = %user_id, "session connected");
            let ack = SessionAck::Accepted { action: "connect".into(), machine_id: None };
            (Some(ack), Some(receiver))
        }
        SessionCommand::Subscribe { connection_id, machine_id, is_admin } => {
            let ack = match engine.subscribe(&connection_id, &machine_id, is_admin) {
                Ok(_) => SessionAck::Accepted { action: "subscribe".into(), machine_id: Some(machine_id) },
                Err(e) => SessionAck::Rejected {
                    action: "subscribe".into(),
                    machine_id: Some(machine_id),
                    reason: e.to_string(),
                },
            };
            (Some(ack), None)
        }
        SessionCommand::Disconnect { connection_id } => {
            engine.unsubscribe_all(&connection_id);
            info!(connection_id = %connection_id, "session disconnected");
            (None, None)
        }
    }
}

/// Commande alertes brute → (topic de réponse du demandeur, réponse).
/// None quand aucune réponse n'est adressable (JSON invalide, connection_id inutilisable).
pub fn route_alert_command(engine: &TwinEngine, payload: &[u8]) -> Option<(String, AlertResponse)> {
    let cmd = match serde_json::from_slice::<AlertCommand>(payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("alert command JSON invalide, ignorée: {e}");
            return None;
        }
    };
    if !contracts::is_valid_connection_id(cmd.connection_id()) {
        warn!(connection_id = %cmd.connection_id(), "alert command without a usable reply topic, ignored");
        return None;
    }
    let reply_topic = contracts::alert_response_topic(cmd.connection_id());
    Some((reply_topic, handle_alert_command(engine, cmd)))
}

pub fn handle_alert_command(engine: &TwinEngine, cmd: AlertCommand) -> AlertResponse {
    let request_id = cmd.request_id().to_string();
    let action = cmd.action().to_string();

    let result = match cmd {
        AlertCommand::List { user_id, role, query, .. } => {
            serde_json::to_value(engine.list_alerts(&user_id, role, query)).map_err(|e| (e.to_string(), None))
        }
        AlertCommand::Resolve { alert_id, user_id, .. } => to_data(engine.resolve(&alert_id, &user_id)),
        AlertCommand::Unresolve { alert_id, user_id, reason, .. } => {
            to_data(engine.mark_unresolved(&alert_id, &user_id, &reason))
        }
    };

    match result {
        Ok(data) => AlertResponse::Success { request_id, action, data },
        Err((error, current_status)) => AlertResponse::Error { request_id, action, error, current_status },
    }
}

fn to_data<T: Serialize>(
    result: Result<T, EngineError>,
) -> Result<serde_json::Value, (String, Option<crate::models::AlertStatus>)> {
    match result {
        Ok(value) => serde_json::to_value(value).map_err(|e| (e.to_string(), None)),
        Err(EngineError::Alert(e @ AlertError::InvalidState { current, .. })) => Err((e.to_string(), Some(current))),
        Err(e) => Err((e.to_string(), None)),
    }
}

fn spawn_forwarder(client: AsyncClient, connection_id: String, mut receiver: DeliveryReceiver) {
    task::spawn(async move {
        let topic = contracts::session_events_topic(&connection_id);
        while let Some(event) = receiver.recv().await {
            let payload = match EventEnvelope::from_event(&event).and_then(|env| serde_json::to_vec(&env)) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(connection_id = %connection_id, "event serialization failed: {e}");
                    continue;
                }
            };
            if let Err(e) = client.publish(topic.as_str(), QoS::AtMostOnce, false, payload).await {
                // livraison best-effort : on abandonne cette connexion, pas les autres
                warn!(connection_id = %connection_id, "forward failed: {e:?}");
                break;
            }
        }
        debug!(connection_id = %connection_id, "forwarder stopped");
    });
}

fn publish_json<T: Serialize>(client: &AsyncClient, topic: String, message: &T) {
    let payload = match serde_json::to_vec(message) {
        Ok(payload) => payload,
        Err(e) => {
            error!("serialization failed for {topic}: {e}");
            return;
        }
    };
    let client = client.clone();
    task::spawn(async move {
        if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
            error!("failed to publish on {topic}: {e:?}");
        }
    });
}
