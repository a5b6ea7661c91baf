/**
 * TWINWATCH CONSOLE - Client opérateur des alertes machine
 *
 * RÔLE :
 * Console qui tient à jour les alertes d'un opérateur (chargement initial +
 * flux temps réel) et permet de les résoudre ou de les marquer non résolues.
 *
 * FONCTIONNEMENT :
 * - Connexion MQTT, abonnement au topic réponse de CETTE console + événements de la session
 * - Last will = disconnect : une console tuée ou coupée du réseau libère quand
 *   même sa connexion côté kernel
 * - Initialisation explicite : session kernel → abonnements → alertes initiales → prête
 * - Commandes stdin : list, resolve <id>, unresolve <id> <raison>, seen [id], pending
 * - Ctrl-C : disconnect côté kernel, l'inbox est jetée avec la session
 *
 * CONFIGURATION (.env) :
 * TWINWATCH_USER, TWINWATCH_ROLE (ADMIN|ENGINEER|MAINTENANCE),
 * TWINWATCH_MACHINES (liste séparée par des virgules), TWINWATCH_MQTT_HOST/PORT
 */

mod bridge;
mod inbox;
mod session;

use crate::bridge::KernelBridge;
use crate::session::{ConsoleSession, Operator};
use anyhow::{bail, Context};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use twinwatch_kernel::contracts::{
    session_ack_topic, session_events_topic, AlertResponse, EventEnvelope, SessionCommand, SESSION_COMMAND,
};
use twinwatch_kernel::models::Role;
use uuid::Uuid;

fn parse_role(raw: &str) -> anyhow::Result<Role> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_uppercase()))
        .with_context(|| format!("unknown role {raw:?}"))
}

fn operator_from_env() -> anyhow::Result<Operator> {
    let user_id = std::env::var("TWINWATCH_USER").unwrap_or_else(|_| "operator".into());
    let role = parse_role(&std::env::var("TWINWATCH_ROLE").unwrap_or_else(|_| "ENGINEER".into()))?;
    let machines: Vec<String> = std::env::var("TWINWATCH_MACHINES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if machines.is_empty() && !role.is_admin() {
        warn!("[console] TWINWATCH_MACHINES is empty, no live events will be received");
    }
    Ok(Operator { user_id, role, machines })
}

/// Options MQTT de la console ; le broker publie le disconnect si la console disparaît
fn mqtt_options(connection_id: &str, host: &str, port: u16) -> anyhow::Result<MqttOptions> {
    let will = serde_json::to_vec(&SessionCommand::Disconnect { connection_id: connection_id.to_string() })?;
    let mut opts = MqttOptions::new(connection_id, host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_last_will(LastWill::new(SESSION_COMMAND, will, QoS::AtLeastOnce, false));
    Ok(opts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twinwatch_console=info")))
        .init();

    let operator = operator_from_env()?;
    let connection_id = format!("console-{}", Uuid::new_v4());
    let host = std::env::var("TWINWATCH_MQTT_HOST").unwrap_or_else(|_| "localhost".into());
    let port: u16 = std::env::var("TWINWATCH_MQTT_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(1883);

    let opts = mqtt_options(&connection_id, &host, port)?;
    let (client, mut eventloop) = AsyncClient::new(opts, 32);

    let session = Arc::new(ConsoleSession::new(
        connection_id.clone(),
        operator,
        client.clone(),
        KernelBridge::new(client.clone(), connection_id.clone()),
    ));

    // prêt à envoyer des requêtes une fois les abonnements confirmés
    let subscribed = Arc::new(Notify::new());
    let events_topic = session_events_topic(&connection_id);
    let ack_topic = session_ack_topic(&connection_id);
    let response_topic = session.bridge().response_topic();

    {
        let session = session.clone();
        let subscribed = subscribed.clone();
        let client = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        for topic in [response_topic.as_str(), events_topic.as_str(), ack_topic.as_str()] {
                            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                                error!("[console] subscribe {topic} failed: {e:?}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::SubAck(_))) => subscribed.notify_one(),
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        if p.topic == response_topic {
                            match serde_json::from_slice::<AlertResponse>(&p.payload) {
                                Ok(response) => {
                                    session.bridge().handle_response(response);
                                }
                                Err(e) => warn!("[console] bad alert response: {e}"),
                            }
                        } else if p.topic == events_topic {
                            let event = serde_json::from_slice::<EventEnvelope>(&p.payload)
                                .and_then(|envelope| session.on_envelope(envelope));
                            match event {
                                Ok(Some(alert)) => info!(
                                    "[console] NEW {:?} alert {} on {}: {} ({} pending)",
                                    alert.alert_type,
                                    alert.id,
                                    alert.machine_id,
                                    alert.message,
                                    session.inbox().pending_count()
                                ),
                                Ok(None) => {}
                                Err(e) => warn!("[console] bad event: {e}"),
                            }
                        } else if p.topic == ack_topic {
                            info!("[console] kernel: {}", String::from_utf8_lossy(&p.payload));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("[console] MQTT error: {e:?}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    if timeout(Duration::from_secs(10), subscribed.notified()).await.is_err() {
        bail!("MQTT broker did not confirm subscriptions");
    }

    session.initialize().await.context("console initialisation")?;
    info!("[console] ready as {} ({:?})", session.operator.user_id, session.operator.role);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => run_command(&session, &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        error!("[console] stdin: {e}");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = session.disconnect().await {
        warn!("[console] disconnect failed: {e}");
    }
    // laisse l'eventloop envoyer la commande, puis départ propre (pas de last will)
    sleep(Duration::from_millis(300)).await;
    if let Err(e) = client.disconnect().await {
        warn!("[console] MQTT disconnect failed: {e}");
    }
    sleep(Duration::from_millis(100)).await;
    info!("[console] session closed");
    Ok(())
}

async fn run_command(session: &ConsoleSession, line: &str) {
    let mut parts = line.trim().splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("list"), _, _) => {
            let inbox = session.inbox();
            for entry in inbox.recent(20) {
                let a = &entry.alert;
                println!(
                    "{} {:<10} {:?} {} {}",
                    if entry.seen { ' ' } else { '*' },
                    format!("{:?}", a.status),
                    a.alert_type,
                    a.id,
                    a.message
                );
            }
            let counts = inbox.counts();
            println!(
                "{} pending, {} resolved, {} unresolved, {} unseen",
                counts.pending,
                counts.resolved,
                counts.unresolved,
                inbox.unseen_count()
            );
        }
        (Some("pending"), _, _) => println!("{} pending", session.inbox().pending_count()),
        (Some("seen"), Some(id), _) => {
            if !session.inbox().mark_one_seen(id) {
                println!("unknown alert {id}");
            }
        }
        (Some("seen"), None, _) => session.inbox().mark_all_seen(),
        (Some("resolve"), Some(id), _) => match session.resolve(id).await {
            Ok(alert) => println!("{} is now {:?}", alert.id, alert.status),
            Err(e) => println!("resolve failed: {e}"),
        },
        (Some("unresolve"), Some(id), Some(reason)) => match session.unresolve(id, reason).await {
            Ok(alert) => println!("{} is now {:?}", alert.id, alert.status),
            Err(e) => println!("unresolve failed: {e}"),
        },
        (Some(""), _, _) | (None, _, _) => {}
        _ => println!("commands: list | pending | seen [id] | resolve <id> | unresolve <id> <reason>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("admin").unwrap(), Role::Admin);
        assert_eq!(parse_role(" MAINTENANCE ").unwrap(), Role::Maintenance);
        assert!(parse_role("root").is_err());
    }

    #[test]
    fn test_last_will_disconnects_this_console() {
        let opts = mqtt_options("console-42", "localhost", 1883).unwrap();
        let will = opts.last_will().expect("last will configured");
        assert_eq!(will.topic, SESSION_COMMAND);
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(!will.retain);

        let command: SessionCommand = serde_json::from_slice(&will.message).unwrap();
        assert!(matches!(command, SessionCommand::Disconnect { ref connection_id } if connection_id == "console-42"));
        assert_eq!(opts.client_id(), "console-42");
    }
}
