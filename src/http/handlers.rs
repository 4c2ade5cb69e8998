use super::state::AppState;
use crate::error::LiveError;
use crate::session::{SessionSnapshot, SessionStats, Toggle};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,

    /// Running session statistics, or the final ones after a disconnect
    pub stats: Option<SessionStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_status(error: &LiveError) -> StatusCode {
    match error {
        LiveError::Device { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LiveError::Transport { .. } | LiveError::NotConnected => StatusCode::BAD_GATEWAY,
        LiveError::InvalidState { .. } => StatusCode::CONFLICT,
        LiveError::Config { .. } | LiveError::Decode { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: LiveError) -> Response {
    (
        error_status(&error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn status_response(snapshot: SessionSnapshot, stats: Option<SessionStats>) -> Response {
    (StatusCode::OK, Json(StatusResponse { snapshot, stats })).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /live/status
/// Current phase and flags; stats are omitted while a connect is in flight
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state
        .controller
        .try_lock()
        .ok()
        .and_then(|controller| controller.stats());
    status_response(state.snapshot(), stats)
}

/// POST /live/connect
/// Open a live session with fresh devices
pub async fn connect(State(state): State<AppState>) -> impl IntoResponse {
    info!("Connect requested over HTTP");
    let mut controller = state.controller.lock().await;

    match controller.connect().await {
        Ok(()) => status_response(controller.snapshot(), controller.stats()),
        Err(e) => {
            error!("Failed to connect: {}", e);
            error_response(e)
        }
    }
}

/// POST /live/disconnect
/// Tear the session down; a no-op when idle
pub async fn disconnect(State(state): State<AppState>) -> impl IntoResponse {
    info!("Disconnect requested over HTTP");
    let mut controller = state.controller.lock().await;
    let stats = controller.disconnect().await;
    status_response(controller.snapshot(), stats)
}

/// POST /live/toggle
/// The UI's single action: connect when idle, otherwise disconnect
pub async fn toggle(State(state): State<AppState>) -> impl IntoResponse {
    let mut controller = state.controller.lock().await;

    match controller.toggle().await {
        Ok(Toggle::Connected) => status_response(controller.snapshot(), controller.stats()),
        Ok(Toggle::Disconnected(stats)) => status_response(controller.snapshot(), Some(stats)),
        Err(e) => {
            error!("Failed to connect: {}", e);
            error_response(e)
        }
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
