//! HTTP control plane and the per-tab streaming endpoint.

pub mod auth;
pub mod error;
mod handlers;
pub mod stream;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::session::{Session, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;

use auth::{AuthedUser, TicketStore, TokenStore};
use error::ApiError;
use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
    pub shutdown: ShutdownCoordinator,
    pub tokens: Arc<TokenStore>,
    pub tickets: Arc<TicketStore>,
}

/// Resolve a session owned by the calling user.
///
/// A session owned by someone else reports not-found rather than forbidden,
/// so ids do not leak across users.
pub(crate) fn owned_session(
    state: &AppState,
    id: &str,
    user: &AuthedUser,
) -> Result<Session, ApiError> {
    state
        .sessions
        .get(id)
        .filter(|s| s.user_id == user.id)
        .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))
}

/// Build the router: `/health` open, everything under `/v1` authenticated.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/sessions", get(session_list).post(session_create))
        .route(
            "/sessions/{id}",
            patch(session_rename).delete(session_delete),
        )
        .route("/sessions/{id}/stream", get(stream::stream))
        .route("/auth/ws-ticket", post(ws_ticket))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .nest("/v1", protected)
        .layer(TraceLayer::new_for_http())
}
