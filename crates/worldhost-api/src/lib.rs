//! # worldhost-api
//!
//! HTTP control surface over the session lifecycle manager. Handlers translate
//! requests into [`SessionManager`] calls and serialize the results; errors
//! render through `HostError`'s `IntoResponse`.

pub mod routes;

use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use worldhost_session::SessionManager;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(routes::sessions::router())
        .merge(routes::host::router());

    Router::new()
        .nest("/api/v1", api_routes)
        .merge(routes::health::router())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
