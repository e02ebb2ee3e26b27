//! HTTP + WebSocket surface
//!
//! Thin axum layer over the orchestrator and the session event hub.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::error::OrchestrationError;
use crate::events::{AgentEvent, ClientMessage, EventSink};
use crate::hub::SessionEventHub;
use crate::models::{ApprovalDecision, CommandRequest, ExecuteResponse};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecuteRequest {
    pub command: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub budget_limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalDecisionRequest {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub edited_args: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn failure(err: OrchestrationError) -> ApiResult {
    let status = match &err {
        OrchestrationError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestrationError::InvalidState(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, status = %status, "Request failed");
    (status, Json(ApiResponse::error(err.public_message())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<SessionEventHub>,
}

/// =============================
/// Helpers
/// =============================

/// Client-chosen session keys that are not UUIDs map to a stable UUID.
fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

fn session_key(value: Option<&str>) -> Option<Uuid> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v)))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiResult> {
    Uuid::parse_str(raw).map_err(|_| {
        failure(OrchestrationError::Validation(format!("invalid {} id", what)))
    })
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Synchronous Execute
/// =============================

async fn execute(State(state): State<ApiState>, Json(req): Json<ExecuteRequest>) -> ApiResult {
    info!(command = %req.command, "Received execute request");

    let session_id = session_key(req.session_id.as_deref()).unwrap_or_else(Uuid::new_v4);
    let Some(claim) = state.hub.claim_session(session_id) else {
        warn!(%session_id, "Execute rejected: session already has an active execution");
        return failure(OrchestrationError::InvalidState(format!(
            "session {} already has an active execution",
            session_id
        )));
    };

    let request = CommandRequest {
        command: req.command,
        session_id: Some(session_id),
        user_id: req.user_id,
        budget_limit: req.budget_limit,
        ..Default::default()
    };
    let result = state
        .orchestrator
        .run(request, EventSink::disabled(), CancellationToken::new())
        .await;
    drop(claim);

    (StatusCode::OK, Json(ApiResponse::success(ExecuteResponse::from(&result))))
}

/// =============================
/// Read Endpoints
/// =============================

async fn get_execution(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let id = match parse_id(&id, "execution") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.orchestrator.execution_log(id).await {
        Ok(Some(log)) => (StatusCode::OK, Json(ApiResponse::success(log))),
        Ok(None) => failure(OrchestrationError::NotFound(format!("execution {}", id))),
        Err(err) => failure(err),
    }
}

async fn get_session_memory(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let Some(session_id) = session_key(Some(&id)) else {
        return failure(OrchestrationError::Validation("invalid session id".to_string()));
    };
    match state.orchestrator.session_memory(session_id).await {
        Ok(entries) => (StatusCode::OK, Json(ApiResponse::success(entries))),
        Err(err) => failure(err),
    }
}

/// =============================
/// Approval Decisions
/// =============================

/// Pending requests for a session. A synchronous execute that parked on
/// approval is found here by the same session id it was started with.
async fn get_session_approvals(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let Some(session_id) = session_key(Some(&id)) else {
        return failure(OrchestrationError::Validation("invalid session id".to_string()));
    };
    match state.orchestrator.approvals().pending_for_session(session_id).await {
        Ok(pending) => (StatusCode::OK, Json(ApiResponse::success(pending))),
        Err(err) => failure(err),
    }
}

async fn decide_approval(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ApprovalDecisionRequest>,
) -> ApiResult {
    let id = match parse_id(&id, "approval request") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state
        .orchestrator
        .approvals()
        .resolve(id, req.decision, req.edited_args)
        .await
    {
        Ok(request) => (StatusCode::OK, Json(ApiResponse::success(request))),
        Err(err) => failure(err),
    }
}

/// =============================
/// WebSocket
/// =============================

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(params): Query<WsParams>,
) -> Response {
    let session_id = session_key(params.session_id.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: ApiState, session_id: Option<Uuid>) {
    let connection = state.hub.connect(session_id).await;
    let session_id = connection.session_id;
    let connection_id = connection.connection_id;
    let (inbox, mut events) = connection.into_parts();
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<AgentEvent>();

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(event) = reply_rx.recv() => event,
                else => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event_type = event.event_type(), error = %err, "Failed to serialize event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        if inbox.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%session_id, error = %err, "Malformed client message");
                        let _ = reply_tx.send(AgentEvent::Error {
                            session_id,
                            execution_id: None,
                            error: "Malformed message".to_string(),
                            error_type: "validation_error".to_string(),
                        });
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.disconnect(session_id, connection_id).await;
}

/// =============================
/// Router
/// =============================

pub fn create_router(hub: Arc<SessionEventHub>) -> Router {
    let state = ApiState {
        orchestrator: hub.orchestrator().clone(),
        hub,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/agent/execute", post(execute))
        .route("/api/agent/executions/:id", get(get_execution))
        .route("/api/agent/sessions/:id/memory", get(get_session_memory))
        .route("/api/agent/sessions/:id/approvals", get(get_session_approvals))
        .route("/api/agent/approvals/:id", post(decide_approval))
        .route("/ws/agent", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    hub: Arc<SessionEventHub>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(hub.clone());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("WebSocket: ws://127.0.0.1:{}/ws/agent", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    hub.shutdown().await;
    Ok(())
}
