//! HTTP API server for the UI collaborator
//!
//! This module exposes the single "toggle connect" action and the two
//! observable booleans over a local REST API:
//! - GET /health - Health check
//! - GET /live/status - Current phase, connected, speaking and stats
//! - POST /live/connect - Open a live session
//! - POST /live/disconnect - Tear the session down
//! - POST /live/toggle - Connect when idle, otherwise disconnect

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, StatusResponse};
pub use routes::create_router;
pub use state::AppState;
