/**
 * API REST TWINWATCH - Serveur HTTP + WebSocket du kernel
 *
 * RÔLE :
 * Interface du dashboard : inspection des machines et des sessions, liste et
 * résolution des alertes, flux temps réel par WebSocket.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key (sauf /health)
 * - Routes : /health, /system/health, /machines, /alerts, /ws
 * - Résolution refusée → 409 avec le statut courant, pour que l'UI se
 *   rafraîchisse au lieu de réessayer à l'aveugle
 * - /ws : le client envoie {"type":"subscribe_machine","machineId","isAdmin"} ;
 *   la fermeture du socket désabonne la connexion de toutes ses machines
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - L'identité (userId, role) est fournie par l'appelant, déjà authentifiée
 */

use crate::alerts::{AlertError, AlertPage, AlertQuery};
use crate::contracts::{EventEnvelope, SessionAck, TelemetryBatch};
use crate::engine::{EngineError, TwinEngine};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Alert, AlertStatus, Machine, Role};
use crate::session::{MachineUpdate, SessionSnapshot};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TwinEngine>,
    pub health_tracker: HealthTracker,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("TWINWATCH_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("SECURITY: TWINWATCH_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/machines", get(list_machines))
        .route("/machines/{id}/session", get(get_session))
        .route("/machines/{id}/telemetry", post(post_telemetry))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/status", post(update_alert_status))
        .route("/ws", get(ws_upgrade))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::UnknownMachine(_) | EngineError::Alert(AlertError::NotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Alert(AlertError::InvalidState { current, .. }) => {
            return (StatusCode::CONFLICT, Json(json!({ "error": e.to_string(), "currentStatus": current })));
        }
        EngineError::Alert(AlertError::EmptyReason) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Router(_) => StatusCode::FORBIDDEN,
        EngineError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

// GET /system/health (état du moteur)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.engine))
}

// GET /machines
async fn list_machines(State(app): State<AppState>) -> Json<Vec<Machine>> {
    Json(app.engine.registry().list())
}

// GET /machines/{id}/session (phases courantes + historique)
async fn get_session(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, StatusCode> {
    app.engine.session_snapshot(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
struct TelemetryAccepted {
    update: MachineUpdate,
    opened: Vec<String>,
    rejected: Vec<String>,
}

// POST /machines/{id}/telemetry (ingestion alternative au MQTT)
async fn post_telemetry(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(batch): Json<TelemetryBatch>,
) -> Result<Json<TelemetryAccepted>, ApiError> {
    if batch.machine_id.as_deref().is_some_and(|declared| declared != id) {
        return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "machineId does not match path" }))));
    }
    let report = app.engine.on_telemetry_batch(&id, &batch.readings).map_err(engine_error)?;
    Ok(Json(TelemetryAccepted {
        update: report.update,
        opened: report.opened.into_iter().map(|a| a.id).collect(),
        rejected: report.rejected.iter().map(|e| e.to_string()).collect(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertListParams {
    user_id: String,
    role: Role,
    machine_id: Option<String>,
    status: Option<AlertStatus>,
    page: Option<usize>,
    page_size: Option<usize>,
}

// GET /alerts?userId=..&role=..&machineId=..&status=..&page=..&pageSize=..
async fn list_alerts(State(app): State<AppState>, Query(params): Query<AlertListParams>) -> Json<AlertPage> {
    let query = AlertQuery {
        machine_ids: params.machine_id.map(|m| HashSet::from([m])),
        status: params.status,
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(10),
    };
    Json(app.engine.list_alerts(&params.user_id, params.role, query))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateBody {
    status: AlertStatus,
    user_id: String,
    reason: Option<String>,
}

// POST /alerts/{id}/status
async fn update_alert_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateBody>,
) -> Result<Json<Alert>, ApiError> {
    let result = match body.status {
        AlertStatus::Resolved => app.engine.resolve(&id, &body.user_id),
        AlertStatus::Unresolved => {
            app.engine.mark_unresolved(&id, &body.user_id, body.reason.as_deref().unwrap_or_default())
        }
        AlertStatus::Pending => {
            return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": "alerts cannot be reopened" }))));
        }
    };
    result.map(Json).map_err(engine_error)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityParams {
    user_id: String,
    role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientMessage {
    SubscribeMachine {
        #[serde(rename = "machineId", default)]
        machine_id: String,
        #[serde(rename = "isAdmin", default)]
        is_admin: bool,
    },
}

// GET /ws?userId=..&role=..
async fn ws_upgrade(
    State(app): State<AppState>,
    Query(identity): Query<IdentityParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(app.engine, identity, socket))
}

async fn handle_socket(engine: Arc<TwinEngine>, identity: IdentityParams, socket: WebSocket) {
    let connection_id = format!("ws-{}", Uuid::new_v4());
    let mut events = engine.connect(&connection_id, &identity.user_id, identity.role);
    info!(connection_id = %connection_id, user_id = %identity.user_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<SessionAck>();

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match EventEnvelope::from_event(&event).and_then(|env| serde_json::to_string(&env)) {
                        Ok(text) => text,
                        Err(e) => { warn!("event serialization failed: {e}"); continue; }
                    }
                }
                ack = ack_rx.recv() => {
                    let Some(ack) = ack else { break };
                    match serde_json::to_string(&ack) {
                        Ok(text) => text,
                        Err(_) => continue,
                    }
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<WsClientMessage>(text.as_str()) {
            Ok(WsClientMessage::SubscribeMachine { machine_id, is_admin }) => {
                let ack = match engine.subscribe(&connection_id, &machine_id, is_admin) {
                    Ok(_) => SessionAck::Accepted { action: "subscribe".into(), machine_id: Some(machine_id) },
                    Err(e) => SessionAck::Rejected {
                        action: "subscribe".into(),
                        machine_id: Some(machine_id),
                        reason: e.to_string(),
                    },
                };
                let _ = ack_tx.send(ack);
            }
            Err(e) => debug!(connection_id = %connection_id, "ignored websocket message: {e}"),
        }
    }

    engine.unsubscribe_all(&connection_id);
    send_task.abort();
    info!(connection_id = %connection_id, "websocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::models::{Machine, MachineStatus, MachineType, ParameterReading};
    use crate::ports::ConfigRegistry;
    use crate::router::{OverflowPolicy, SubscriptionRouter};
    use std::collections::HashMap;

    fn app() -> AppState {
        let registry = Arc::new(ConfigRegistry::new([Machine {
            id: "cnc-1".into(),
            name: "Mill".into(),
            model_name: "VF2".into(),
            machine_type: MachineType::Cnc,
            status: MachineStatus::Active,
            thresholds: HashMap::from([("temperature".to_string(), 70.0)]),
            assigned_to: vec!["eng".into()],
        }]));
        let (engine, _rx) = TwinEngine::new(
            registry,
            SubscriptionRouter::new(8, OverflowPolicy::DropOldest),
            EngineSettings::default(),
        );
        AppState { engine: Arc::new(engine), health_tracker: HealthTracker::new() }
    }

    fn open_alert(app: &AppState) -> String {
        let report = app.engine.on_telemetry_batch("cnc-1", &[ParameterReading::new("temperature", 75.0)]).unwrap();
        report.opened[0].id.clone()
    }

    fn body(status: AlertStatus, reason: Option<&str>) -> Json<StatusUpdateBody> {
        Json(StatusUpdateBody { status, user_id: "eng".into(), reason: reason.map(String::from) })
    }

    #[tokio::test]
    async fn test_resolve_then_conflict() {
        let app = app();
        let id = open_alert(&app);

        let Json(alert) = update_alert_status(State(app.clone()), Path(id.clone()), body(AlertStatus::Resolved, None))
            .await
            .unwrap();
        assert_eq!(alert.status, AlertStatus::Resolved);

        let (code, Json(err)) = update_alert_status(State(app.clone()), Path(id), body(AlertStatus::Resolved, None))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(err["currentStatus"], "RESOLVED");
    }

    #[tokio::test]
    async fn test_unresolve_requires_reason() {
        let app = app();
        let id = open_alert(&app);
        let (code, _) = update_alert_status(State(app.clone()), Path(id.clone()), body(AlertStatus::Unresolved, None))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);

        let (code, _) = update_alert_status(State(app.clone()), Path("missing".into()), body(AlertStatus::Resolved, None))
            .await
            .unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);

        let Json(alert) = update_alert_status(State(app), Path(id), body(AlertStatus::Unresolved, Some("bad sensor")))
            .await
            .unwrap();
        assert_eq!(alert.reason.as_deref(), Some("bad sensor"));
    }

    #[tokio::test]
    async fn test_post_telemetry_and_session() {
        let app = app();
        let batch = TelemetryBatch { machine_id: None, readings: vec![ParameterReading::new("temperature", 64.0)] };
        let Json(accepted) = post_telemetry(State(app.clone()), Path("cnc-1".into()), Json(batch)).await.unwrap();
        assert!(accepted.opened.is_empty());

        let Json(snapshot) = get_session(State(app.clone()), Path("cnc-1".into())).await.unwrap();
        assert_eq!(snapshot.parameters["temperature"].history.len(), 1);
        assert_eq!(get_session(State(app.clone()), Path("nope".into())).await.unwrap_err(), StatusCode::NOT_FOUND);

        let unknown = TelemetryBatch { machine_id: None, readings: vec![] };
        let (code, _) = post_telemetry(State(app), Path("nope".into()), Json(unknown)).await.unwrap_err();
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_ws_subscribe_message_shape() {
        let msg: WsClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_machine","machineId":"cnc-1","isAdmin":false}"#).unwrap();
        let WsClientMessage::SubscribeMachine { machine_id, is_admin } = msg;
        assert_eq!(machine_id, "cnc-1");
        assert!(!is_admin);
    }
}
