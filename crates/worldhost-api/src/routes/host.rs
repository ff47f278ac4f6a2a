//! Host-wide routes.
//!
//! Routes:
//! - GET  /startup-config   - Startup parameters that would recreate every running session
//! - POST /shutdown         - Stop accepting starts and begin draining the host

use axum::{Json, Router, extract::State, http::StatusCode, routing::{get, post}};
use std::sync::Arc;

use worldhost_common::models::StartupParameters;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/startup-config", get(startup_config))
        .route("/shutdown", post(shutdown))
}

async fn startup_config(State(state): State<Arc<AppState>>) -> Json<Vec<StartupParameters>> {
    Json(state.manager.startup_config_to_restore().await)
}

async fn shutdown(State(state): State<Arc<AppState>>) -> StatusCode {
    tracing::info!("Shutdown requested through the control API");
    state.manager.shutdown();
    StatusCode::ACCEPTED
}
