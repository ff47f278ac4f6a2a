//! Session routes.
//!
//! Routes:
//! - GET    /sessions                      - List running sessions
//! - POST   /sessions                      - Start a world
//! - GET    /sessions/{id}                 - Get one session
//! - DELETE /sessions/{id}                 - Stop a session (saves first if configured)
//! - POST   /sessions/{id}/save            - Save into the current record
//! - POST   /sessions/{id}/save-as         - Save into a new record
//! - POST   /sessions/{id}/allowed-users   - Allow a user to join
//! - POST   /sessions/{id}/invites         - Allow and invite a user

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use worldhost_common::error::HostResult;
use worldhost_common::models::{SaveOutcome, SessionInfo, StartupParameters, WorldRecord};
use worldhost_common::validation::validate_request;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions).post(start_world))
        .route("/sessions/{id}", get(get_session).delete(stop_world))
        .route("/sessions/{id}/save", post(save_world))
        .route("/sessions/{id}/save-as", post(save_world_as))
        .route("/sessions/{id}/allowed-users", post(allow_user))
        .route("/sessions/{id}/invites", post(invite_user))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SaveAsRequest {
    /// Switch the live session to the new record.
    pub make_current: bool,
}

#[derive(Debug, Serialize)]
pub struct SaveAsResponse {
    pub record: WorldRecord,
    pub url: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UserRequest {
    #[validate(length(min = 1, max = 128, message = "user_id must not be empty"))]
    pub user_id: String,
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    let sessions = state.manager.list_sessions().await;
    Json(sessions.iter().map(|s| s.info()).collect())
}

async fn start_world(
    State(state): State<Arc<AppState>>,
    Json(params): Json<StartupParameters>,
) -> HostResult<(StatusCode, Json<SessionInfo>)> {
    let session = state
        .manager
        .start_world(params, state.manager.shutdown_token())
        .await?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HostResult<Json<SessionInfo>> {
    let session = state.manager.get_session(&id).await?;
    Ok(Json(session.info()))
}

async fn stop_world(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    state.manager.stop_world(&id).await;
    StatusCode::NO_CONTENT
}

async fn save_world(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> HostResult<Json<SaveOutcome>> {
    Ok(Json(state.manager.save_world(&id).await?))
}

async fn save_world_as(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<SaveAsRequest>>,
) -> HostResult<Json<SaveAsResponse>> {
    let Json(request) = body.unwrap_or_default();
    let record = state
        .manager
        .save_world_as(&id, request.make_current)
        .await?;
    let url = record.url.clone().unwrap_or_else(|| record.canonical_url());
    Ok(Json(SaveAsResponse { record, url }))
}

async fn allow_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UserRequest>,
) -> HostResult<StatusCode> {
    validate_request(&request)?;
    state
        .manager
        .allow_user_to_join(&id, &request.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invite_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UserRequest>,
) -> HostResult<StatusCode> {
    validate_request(&request)?;
    state.manager.invite_user(&id, &request.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
