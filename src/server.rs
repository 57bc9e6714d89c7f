// ABOUTME: Provisioning HTTP/WebSocket API over axum: queue and membership
// ABOUTME: management, room registration and transfer, bridge login QR relay

use anyhow::{Context, Result};
use futures_util::SinkExt;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chatdesk_core::{
    AcdError, Assignment, DistributionEngine, MembershipState, QueuePolicy, RoomPhase,
};
use futures_util::StreamExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::bridge::registry::BridgeRegistry;
use crate::bridge::LoginEvent;

#[derive(Clone)]
struct ApiState {
    engine: Arc<DistributionEngine>,
    registry: Arc<BridgeRegistry>,
    api_key: Option<String>,
}

/// Start the provisioning server. Blocks for the lifetime of the process.
pub async fn serve(
    host: &str,
    port: u16,
    api_key: Option<String>,
    engine: Arc<DistributionEngine>,
    registry: Arc<BridgeRegistry>,
) -> Result<()> {
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to initialize Prometheus metrics")?;

    let state = ApiState {
        engine,
        registry,
        api_key,
    };

    let api_routes = Router::new()
        .route("/v1/queue", post(create_queue).get(list_queues))
        .route("/v1/queue/{queue_id}/members", post(add_member))
        .route(
            "/v1/queue/{queue_id}/members/{agent_id}/state",
            put(set_member_state),
        )
        .route("/v1/queue/{queue_id}/agents", get(list_active_agents))
        .route("/v1/room", post(register_room))
        .route("/v1/room/{room_id}/transfer", post(transfer_room))
        .route("/v1/room/{room_id}/close", post(close_room))
        .route("/v1/room/{room_id}/phase", get(get_phase))
        .route("/v1/login", get(login_ws))
        .with_state(Arc::new(state));

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(metrics_handle));

    let app = Router::new()
        .merge(api_routes)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", host, port);
    tracing::info!(addr = %addr, "Starting provisioning server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

// ----------------------------------------------------------------------
// Error surface
// ----------------------------------------------------------------------

struct ApiError(AcdError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AcdError::NotFound { .. } | AcdError::NotMember { .. } => StatusCode::NOT_FOUND,
            AcdError::DuplicateName(_)
            | AcdError::AlreadyRegistered(_)
            | AcdError::AgentAtCapacity { .. }
            | AcdError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AcdError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AcdError::UnknownCommand(_) | AcdError::Usage(_) => StatusCode::BAD_REQUEST,
            AcdError::BridgeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AcdError::SideEffectFailed { .. } => StatusCode::BAD_GATEWAY,
            AcdError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.0.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn check_api_key(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "missing or invalid API key".to_string(),
            }),
        )
            .into_response())
    }
}

// ----------------------------------------------------------------------
// Queue and membership endpoints
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateQueueRequest {
    name: String,
    description: Option<String>,
    policy: Option<QueuePolicy>,
}

async fn create_queue(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<CreateQueueRequest>,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let queue = state
        .engine
        .queues()
        .create_queue(
            &req.name,
            req.description.as_deref(),
            req.policy.unwrap_or(QueuePolicy::LeastRecentlyAssigned),
        )
        .map_err(|e| ApiError(e).into_response())?;
    Ok((StatusCode::CREATED, Json(queue)).into_response())
}

async fn list_queues(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let queues = state
        .engine
        .queues()
        .list_queues()
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(queues).into_response())
}

#[derive(Deserialize)]
struct AddMemberRequest {
    agent_id: String,
}

async fn add_member(
    State(state): State<Arc<ApiState>>,
    Path(queue_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let membership = state
        .engine
        .queues()
        .add_member(&queue_id, &req.agent_id)
        .map_err(|e| ApiError(e).into_response())?;
    state.engine.on_agent_available(&queue_id).await;
    Ok((StatusCode::CREATED, Json(membership)).into_response())
}

#[derive(Deserialize)]
struct SetMemberStateRequest {
    state: MembershipState,
    reason: Option<String>,
}

async fn set_member_state(
    State(state): State<Arc<ApiState>>,
    Path((queue_id, agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<SetMemberStateRequest>,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let membership = state
        .engine
        .queues()
        .set_member_state(&queue_id, &agent_id, req.state, req.reason.as_deref())
        .map_err(|e| ApiError(e).into_response())?;
    if req.state == MembershipState::Active {
        state.engine.on_agent_available(&queue_id).await;
    }
    Ok(Json(membership).into_response())
}

async fn list_active_agents(
    State(state): State<Arc<ApiState>>,
    Path(queue_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let agents = state
        .engine
        .queues()
        .list_active_agents(&queue_id)
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(agents).into_response())
}

// ----------------------------------------------------------------------
// Room endpoints
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRoomRequest {
    room_id: String,
    line_id: String,
    queue_id: String,
    customer: Option<String>,
}

#[derive(Serialize)]
struct RoomStatusResponse {
    room_id: String,
    phase: String,
    assignment: Option<Assignment>,
}

async fn register_room(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRoomRequest>,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    state
        .engine
        .rooms()
        .register_customer_room(
            &req.room_id,
            &req.line_id,
            &req.queue_id,
            req.customer.as_deref(),
        )
        .map_err(|e| ApiError(e).into_response())?;
    let assignment = state
        .engine
        .distribute(&req.room_id)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    let phase = state
        .engine
        .rooms()
        .get_phase(&req.room_id)
        .map_err(|e| ApiError(e).into_response())?;
    Ok((
        StatusCode::CREATED,
        Json(RoomStatusResponse {
            room_id: req.room_id,
            phase: phase.to_string(),
            assignment,
        }),
    )
        .into_response())
}

#[derive(Deserialize)]
struct TransferRequest {
    queue_id: String,
    #[serde(default = "default_api_actor")]
    by: String,
}

fn default_api_actor() -> String {
    "provisioning-api".to_string()
}

async fn transfer_room(
    State(state): State<Arc<ApiState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TransferRequest>,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let assignment = state
        .engine
        .transfer_room(&room_id, &req.queue_id, &req.by)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    let phase = state
        .engine
        .rooms()
        .get_phase(&room_id)
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(RoomStatusResponse {
        room_id,
        phase: phase.to_string(),
        assignment,
    })
    .into_response())
}

#[derive(Deserialize)]
struct CloseRequest {
    #[serde(default = "default_close_reason")]
    reason: String,
}

fn default_close_reason() -> String {
    "resolved".to_string()
}

async fn close_room(
    State(state): State<Arc<ApiState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CloseRequest>>,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let reason = body
        .map(|Json(req)| req.reason)
        .unwrap_or_else(default_close_reason);
    state
        .engine
        .close_room(&room_id, &reason)
        .await
        .map_err(|e| ApiError(e).into_response())?;
    let assignment = state
        .engine
        .rooms()
        .current_assignment(&room_id)
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(RoomStatusResponse {
        room_id,
        phase: RoomPhase::Closed.to_string(),
        assignment,
    })
    .into_response())
}

#[derive(Serialize)]
struct PhaseResponse {
    room_id: String,
    phase: RoomPhase,
}

async fn get_phase(
    State(state): State<Arc<ApiState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    check_api_key(&state, &headers)?;
    let phase = state
        .engine
        .rooms()
        .get_phase(&room_id)
        .map_err(|e| ApiError(e).into_response())?;
    Ok(Json(PhaseResponse { room_id, phase }).into_response())
}

// ----------------------------------------------------------------------
// Bridge login relay
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginQuery {
    line: String,
    agent: String,
    api_key: Option<String>,
}

/// WebSocket relay of a bridge's device-link flow: each QR code and the
/// final outcome are forwarded as JSON text frames.
async fn login_ws(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LoginQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Browsers cannot set headers on WS upgrades, so the key rides in the
    // query string here.
    if let Some(expected) = &state.api_key {
        if query.api_key.as_deref() != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "missing or invalid API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    ws.on_upgrade(move |socket| relay_login(socket, state, query.line, query.agent))
}

async fn relay_login(mut socket: WebSocket, state: Arc<ApiState>, line: String, agent: String) {
    let adapter = match state.registry.get(&line) {
        Ok(adapter) => adapter,
        Err(e) => {
            let _ = send_failure(&mut socket, &e.to_string()).await;
            return;
        }
    };
    let mut stream = match adapter.login(&agent).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = send_failure(&mut socket, &e.to_string()).await;
            return;
        }
    };
    while let Some(event) = stream.next().await {
        let frame = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "login event serialization failed");
                break;
            }
        };
        if socket.send(Message::Text(frame.into())).await.is_err() {
            tracing::debug!(line, agent, "login relay client went away");
            return;
        }
        if matches!(event, LoginEvent::Success { .. } | LoginEvent::Failure { .. }) {
            break;
        }
    }
    let _ = socket.close().await;
}

async fn send_failure(socket: &mut WebSocket, reason: &str) -> Result<(), axum::Error> {
    let frame = serde_json::json!({ "type": "failure", "reason": reason }).to_string();
    socket.send(Message::Text(frame.into())).await
}
