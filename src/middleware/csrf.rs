//! Cross-Site Request Forgery (CSRF) protection.
//!
//! Tokens are issued per session and kept in an in-memory store with a TTL.
//! State-changing admin requests must echo the token in the `x-csrf-token`
//! header; the same value must also be present in the `csrf-token` cookie
//! (double submit) and be valid for the caller's session.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::session::{read_cookie, CurrentUser};
use crate::state::AppState;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_COOKIE: &str = "csrf-token";

#[derive(Debug, Clone)]
struct CsrfEntry {
    token: String,
    expires_at: Instant,
}

/// In-memory map `session_id -> {token, expires_at}`.
#[derive(Clone)]
pub struct CsrfStore {
    tokens: Arc<RwLock<HashMap<String, CsrfEntry>>>,
    ttl: Duration,
}

impl CsrfStore {
    pub fn new(ttl: Duration) -> Self {
        Self { tokens: Arc::new(RwLock::new(HashMap::new())), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a fresh token for `session_id`, replacing any previous one.
    pub async fn issue(&self, session_id: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let entry = CsrfEntry { token: token.clone(), expires_at: Instant::now() + self.ttl };
        self.tokens.write().await.insert(session_id.to_string(), entry);
        token
    }

    /// True only when `token` was issued to `session_id` and has not expired.
    pub async fn validate(&self, session_id: &str, token: &str) -> bool {
        self.validate_at(session_id, token, Instant::now()).await
    }

    async fn validate_at(&self, session_id: &str, token: &str, now: Instant) -> bool {
        let tokens = self.tokens.read().await;
        match tokens.get(session_id) {
            Some(entry) if now < entry.expires_at => constant_time_eq(entry.token.as_bytes(), token.as_bytes()),
            _ => false,
        }
    }

    /// Moves the token of `old` to `new` (session rotated by a refresh).
    pub async fn rekey(&self, old: &str, new: &str) {
        let mut tokens = self.tokens.write().await;
        if let Some(entry) = tokens.remove(old) {
            tokens.insert(new.to_string(), entry);
        }
    }

    pub async fn revoke(&self, session_id: &str) {
        self.tokens.write().await.remove(session_id);
    }

    /// Drops every expired token.
    pub async fn cleanup_expired(&self) {
        let now = Instant::now();
        self.tokens.write().await.retain(|_, e| now < e.expires_at);
    }

    #[cfg(test)]
    async fn expire_now(&self, session_id: &str) {
        if let Some(e) = self.tokens.write().await.get_mut(session_id) {
            e.expires_at = Instant::now();
        }
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Header and cookie must both be present and identical.
fn double_submit_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok())?.trim();
    let cookie = read_cookie(headers, CSRF_COOKIE)?;
    if header.is_empty() || !constant_time_eq(header.as_bytes(), cookie.as_bytes()) {
        return None;
    }
    Some(header.to_string())
}

/// CSRF protection middleware for state-changing admin operations.
///
/// Must run inside the session gate so the caller's [`CurrentUser`] is present
/// in the request extensions.
pub async fn csrf_protection_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !matches!(req.method(), &Method::POST | &Method::PUT | &Method::DELETE | &Method::PATCH) {
        return next.run(req).await;
    }

    let session_id = match req.extensions().get::<CurrentUser>() {
        Some(user) => user.session_id.clone(),
        None => return AppError::Unauthorized("Authentication required".into()).into_response(),
    };

    let valid = match double_submit_token(req.headers()) {
        Some(token) => state.csrf.validate(&session_id, &token).await,
        None => false,
    };
    if !valid {
        state.metrics.inc_csrf_rejected();
        tracing::warn!(session_id = %session_id, path = %req.uri().path(), "CSRF validation failed");
        return AppError::Forbidden("Invalid or missing CSRF token".into()).into_response();
    }

    next.run(req).await
}
