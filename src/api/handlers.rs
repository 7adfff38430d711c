use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use crate::pty::SpawnOptions;
use crate::session::SessionInfo;

use super::auth::AuthedUser;
use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn session_list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_by_user(&user.id))
}

#[derive(Deserialize, Default)]
pub(super) struct CreateSessionRequest {
    name: Option<String>,
}

#[derive(Serialize)]
pub(super) struct CreateSessionResponse {
    id: String,
    name: String,
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    request: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let Json(request) = request.unwrap_or_default();
    let session = state
        .sessions
        .create(&user.id, request.name, SpawnOptions::default())
        .map_err(|e| {
            tracing::error!(?e, user = %user.id, "session create failed");
            ApiError::SessionCreateFailed(e.to_string())
        })?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            id: session.id.clone(),
            name: session.name(),
        }),
    ))
}

#[derive(Deserialize)]
pub(super) struct RenameSessionRequest {
    name: String,
}

pub(super) async fn session_rename(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(user): Extension<AuthedUser>,
    Json(request): Json<RenameSessionRequest>,
) -> Result<StatusCode, ApiError> {
    if request.name.is_empty() {
        return Err(ApiError::InvalidRequest("name must be non-empty".into()));
    }
    super::owned_session(&state, &id, &user)?;
    state
        .sessions
        .rename(&id, &request.name)
        .map_err(|_| ApiError::SessionNotFound(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(user): Extension<AuthedUser>,
) -> Result<StatusCode, ApiError> {
    super::owned_session(&state, &id, &user)?;
    state.sessions.remove(&id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub(super) struct TicketResponse {
    ticket: String,
}

pub(super) async fn ws_ticket(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
) -> Result<Json<TicketResponse>, ApiError> {
    let ticket = state
        .tickets
        .create(&user.id)
        .ok_or(ApiError::Saturated("pending tickets"))?;
    Ok(Json(TicketResponse { ticket }))
}
