//! HTTP API endpoints for the operator UI.
//!
//! Session control and broadcasts. The same operations are available as
//! WebSocket messages.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::auth::{self, OperatorAuth};
use crate::broadcast::BroadcastError;
use crate::protocol::BroadcastRequest;
use crate::state::{AppState, BroadcastAccepted, BroadcastStatus};
use crate::types::SessionSnapshot;
use crate::ws;

/// JSON error body
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub msg: String,
}

impl IntoResponse for BroadcastError {
    fn into_response(self) -> Response {
        let status = match &self {
            BroadcastError::Validation(_) => StatusCode::BAD_REQUEST,
            BroadcastError::AlreadyRunning { .. } | BroadcastError::NotReady { .. } => {
                StatusCode::CONFLICT
            }
        };
        let body = ApiError {
            code: self.code().to_string(),
            msg: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub session: &'static str,
    pub broadcasting: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// GET /
pub async fn root() -> &'static str {
    "Server running"
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        session: state.session_state().state.name(),
        broadcasting: state.dispatcher.is_active(),
    })
}

/// GET /api/session
pub async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.session_state())
}

/// POST /api/session/connect
///
/// Starts pairing, or skips a pending reconnect. No-op while connected.
pub async fn connect_session(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.connect().await)
}

/// POST /api/session/disconnect
pub async fn disconnect_session(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.disconnect().await)
}

/// Start a broadcast.
///
/// POST /api/broadcast
///
/// Returns 202 with the job id; progress is streamed over `/ws` and
/// available from `GET /api/broadcast`.
pub async fn start_broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Result<(StatusCode, Json<BroadcastAccepted>), BroadcastError> {
    match state.start_broadcast(&request) {
        Ok(accepted) => Ok((StatusCode::ACCEPTED, Json(accepted))),
        Err(e) => {
            tracing::warn!("Broadcast request rejected: {}", e);
            Err(e)
        }
    }
}

/// GET /api/broadcast
pub async fn get_broadcast(State(state): State<Arc<AppState>>) -> Json<BroadcastStatus> {
    Json(state.broadcast_status())
}

/// POST /api/broadcast/cancel
pub async fn cancel_broadcast(State(state): State<Arc<AppState>>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.cancel_broadcast(),
    })
}

/// Full application router. Control routes (REST and WebSocket) sit behind
/// operator auth; `/`, `/health` and static files do not.
pub fn router(state: Arc<AppState>, operator_auth: Arc<OperatorAuth>) -> Router {
    let control_routes = Router::new()
        .route("/api/session", get(get_session))
        .route("/api/session/connect", post(connect_session))
        .route("/api/session/disconnect", post(disconnect_session))
        .route("/api/broadcast", get(get_broadcast).post(start_broadcast))
        .route("/api/broadcast/cancel", post(cancel_broadcast))
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            operator_auth,
            auth::operator_auth_middleware,
        ));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(control_routes)
        .fallback_service(ServeDir::new("static"))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
