//! Axum Router Configuration

use crate::{state::AppState, ws::ws_handler};
use axum::{Router, routing::get};
use std::sync::Arc;

async fn health() -> &'static str {
    "ok"
}

/// Creates the main Axum router for the relay.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{channel}", get(ws_handler))
        .route("/health", get(health))
        .with_state(app_state)
}
