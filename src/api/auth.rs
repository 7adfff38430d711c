//! Authentication surface: opaque bearer tokens and single-use WebSocket
//! tickets.
//!
//! Credential verification and token issuance live outside this crate; the
//! contract is an opaque token that identifies a user, checked on every
//! request. Browser WebSocket connections cannot set an `Authorization`
//! header, so streams authenticate with a short-lived single-use ticket:
//!
//! 1. the client calls `POST /v1/auth/ws-ticket` with its Bearer token,
//! 2. the server returns a single-use nonce,
//! 3. the client opens the stream with `?ticket=<nonce>`,
//! 4. the server validates and consumes the ticket on upgrade.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use parking_lot::Mutex;
use rand::Rng;

use super::error::ApiError;
use super::AppState;

/// Time-to-live for a pending ticket.
pub const TICKET_TTL: Duration = Duration::from_secs(30);

/// Maximum number of pending (unconsumed) tickets.
const MAX_PENDING_TICKETS: usize = 1024;

/// Authenticated user identity, inserted into request extensions by
/// [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
}

fn random_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

struct TokenEntry {
    user_id: String,
    issued: Instant,
}

/// Opaque token → user id map with a fixed TTL.
pub struct TokenStore {
    ttl: Duration,
    inner: Mutex<HashMap<String, TokenEntry>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh token for `user_id` and return it.
    pub fn issue(&self, user_id: &str) -> String {
        let token = random_nonce();
        self.register(&token, user_id);
        token
    }

    /// Register an externally supplied token value for `user_id`.
    pub fn register(&self, token: &str, user_id: &str) {
        let mut map = self.inner.lock();
        let now = Instant::now();
        map.retain(|_, entry| now.duration_since(entry.issued) < self.ttl);
        map.insert(
            token.to_string(),
            TokenEntry {
                user_id: user_id.to_string(),
                issued: now,
            },
        );
    }

    /// Resolve a token to its user, if present and unexpired.
    pub fn validate(&self, token: &str) -> Option<String> {
        let map = self.inner.lock();
        let entry = map.get(token)?;
        if entry.issued.elapsed() < self.ttl {
            Some(entry.user_id.clone())
        } else {
            None
        }
    }
}

struct TicketEntry {
    user_id: String,
    created: Instant,
}

/// In-memory store of short-lived, single-use stream tickets.
pub struct TicketStore {
    inner: Mutex<HashMap<String, TicketEntry>>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a ticket bound to `user_id`. Fails when too many tickets are
    /// pending.
    pub fn create(&self, user_id: &str) -> Option<String> {
        let mut map = self.inner.lock();
        let now = Instant::now();
        map.retain(|_, entry| now.duration_since(entry.created) < TICKET_TTL);
        if map.len() >= MAX_PENDING_TICKETS {
            return None;
        }
        let nonce = random_nonce();
        map.insert(
            nonce.clone(),
            TicketEntry {
                user_id: user_id.to_string(),
                created: now,
            },
        );
        Some(nonce)
    }

    /// Validate and consume a ticket, returning the bound user.
    pub fn consume(&self, ticket: &str) -> Option<String> {
        let entry = self.inner.lock().remove(ticket)?;
        if entry.created.elapsed() < TICKET_TTL {
            Some(entry.user_id)
        } else {
            None
        }
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// Extract a `?ticket=` value from the query string.
fn extract_ticket(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("ticket=").map(|v| v.to_string()))
    })
}

/// Check if this request is a WebSocket upgrade.
fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Auth middleware: resolve a Bearer token, or a single-use ticket on
/// WebSocket upgrades, to a user and stash it in request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(token) = extract_bearer(&req) {
        if let Some(user_id) = state.tokens.validate(&token) {
            req.extensions_mut().insert(AuthedUser { id: user_id });
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    if is_ws_upgrade(&req) {
        if let Some(ticket) = extract_ticket(&req) {
            if let Some(user_id) = state.tickets.consume(&ticket) {
                req.extensions_mut().insert(AuthedUser { id: user_id });
                return Ok(next.run(req).await);
            }
        }
    }

    Err(ApiError::AuthRequired)
}
