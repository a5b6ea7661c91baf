//! Contrats MQTT TwinWatch : topics versionnés (`@v1`) et messages échangés
//! entre kernel, console et simulateur.

use crate::alerts::AlertQuery;
use crate::models::{AlertStatus, ParameterReading, Role};
use crate::router::{EventKind, MachineEvent};
use serde::{Deserialize, Serialize};

pub const TELEMETRY_WILDCARD: &str = "twinwatch/machines/+/telemetry@v1";
pub const SESSION_COMMAND: &str = "twinwatch/sessions/command@v1";
pub const ALERT_COMMAND: &str = "twinwatch/alerts/command@v1";
pub const KERNEL_HEALTH: &str = "twinwatch/kernel/health@v1";

pub fn telemetry_topic(machine_id: &str) -> String {
    format!("twinwatch/machines/{machine_id}/telemetry@v1")
}

pub fn session_events_topic(connection_id: &str) -> String {
    format!("twinwatch/sessions/{connection_id}/events@v1")
}

pub fn session_ack_topic(connection_id: &str) -> String {
    format!("twinwatch/sessions/{connection_id}/ack@v1")
}

/// Réponses alertes : un topic par connexion, jamais partagé entre consoles
pub fn alert_response_topic(connection_id: &str) -> String {
    format!("twinwatch/alerts/{connection_id}/response@v1")
}

/// Un id de connexion sert de segment de topic : ni vide, ni séparateur, ni joker
pub fn is_valid_connection_id(connection_id: &str) -> bool {
    !connection_id.is_empty() && !connection_id.contains(['/', '+', '#'])
}

/// "twinwatch/machines/press-01/telemetry@v1" -> Some("press-01")
pub fn machine_from_telemetry_topic(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix("twinwatch/machines/")?.strip_suffix("/telemetry@v1")?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Lot de télémétrie publié par une machine (ou le simulateur)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub readings: Vec<ParameterReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum SessionCommand {
    #[serde(rename = "connect")]
    Connect { connection_id: String, user_id: String, role: Role },
    #[serde(rename = "subscribe")]
    Subscribe {
        connection_id: String,
        #[serde(default)]
        machine_id: String,
        #[serde(default)]
        is_admin: bool,
    },
    #[serde(rename = "disconnect")]
    Disconnect { connection_id: String },
}

impl SessionCommand {
    pub fn connection_id(&self) -> &str {
        match self {
            SessionCommand::Connect { connection_id, .. }
            | SessionCommand::Subscribe { connection_id, .. }
            | SessionCommand::Disconnect { connection_id } => connection_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionAck {
    #[serde(rename = "accepted")]
    Accepted { action: String, machine_id: Option<String> },
    #[serde(rename = "rejected")]
    Rejected { action: String, machine_id: Option<String>, reason: String },
}

/// Commandes alertes (requête/réponse corrélées par request_id). La réponse part
/// sur `alert_response_topic(connection_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum AlertCommand {
    #[serde(rename = "list")]
    List {
        connection_id: String,
        request_id: String,
        user_id: String,
        role: Role,
        #[serde(default)]
        query: AlertQuery,
    },
    #[serde(rename = "resolve")]
    Resolve { connection_id: String, request_id: String, alert_id: String, user_id: String },
    #[serde(rename = "unresolve")]
    Unresolve { connection_id: String, request_id: String, alert_id: String, user_id: String, reason: String },
}

impl AlertCommand {
    pub fn connection_id(&self) -> &str {
        match self {
            AlertCommand::List { connection_id, .. }
            | AlertCommand::Resolve { connection_id, .. }
            | AlertCommand::Unresolve { connection_id, .. } => connection_id,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            AlertCommand::List { request_id, .. }
            | AlertCommand::Resolve { request_id, .. }
            | AlertCommand::Unresolve { request_id, .. } => request_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            AlertCommand::List { .. } => "list",
            AlertCommand::Resolve { .. } => "resolve",
            AlertCommand::Unresolve { .. } => "unresolve",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AlertResponse {
    #[serde(rename = "success")]
    Success { request_id: String, action: String, data: serde_json::Value },
    #[serde(rename = "error")]
    Error {
        request_id: String,
        action: String,
        error: String,
        /// Statut réel quand la transition est refusée, pour rafraîchir l'UI
        #[serde(default)]
        current_status: Option<AlertStatus>,
    },
}

impl AlertResponse {
    pub fn request_id(&self) -> &str {
        match self {
            AlertResponse::Success { request_id, .. } | AlertResponse::Error { request_id, .. } => request_id,
        }
    }
}

/// Enveloppe livrée aux abonnés : `{topic: machineId, type, payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn from_event(event: &MachineEvent) -> Result<Self, serde_json::Error> {
        let payload = match event {
            MachineEvent::Update(u) => serde_json::to_value(u)?,
            MachineEvent::Status(s) => serde_json::to_value(s)?,
            MachineEvent::Alert(a) => serde_json::to_value(a)?,
        };
        Ok(Self { topic: event.machine_id().to_string(), kind: event.kind(), payload })
    }

    pub fn into_event(self) -> Result<MachineEvent, serde_json::Error> {
        Ok(match self.kind {
            EventKind::MachineUpdate => MachineEvent::Update(serde_json::from_value(self.payload)?),
            EventKind::MachineStatus => MachineEvent::Status(serde_json::from_value(self.payload)?),
            EventKind::MachineAlert => MachineEvent::Alert(serde_json::from_value(self.payload)?),
        })
    }
}
