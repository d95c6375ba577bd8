//! Session cookies, the authenticated-caller extractor and the idle tracker.

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{header, request::Parts, HeaderMap, HeaderValue},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::error::AppError;

pub const ACCESS_COOKIE: &str = "sb-access-token";
pub const REFRESH_COOKIE: &str = "sb-refresh-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    User,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "editor" => Some(Role::Editor),
            "user" => Some(Role::User),
            _ => None,
        }
    }

    /// Whether this role may use the back office.
    pub fn can_access_admin(self) -> bool {
        matches!(self, Role::Admin | Role::Editor)
    }
}

/// The authenticated caller, placed in request extensions by the session gate.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentUser {
    pub user_id: String,
    pub session_id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: Role,
}

/// Extractor for handlers behind the session gate.
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))
    }
}

/// `Option<CurrentUser>` for routes that serve both anonymous and signed-in callers.
impl<S> OptionalFromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<CurrentUser>().cloned())
    }
}

/// Returns the value of cookie `name` from the `Cookie` header(s).
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy)]
pub struct CookieOptions {
    pub secure: bool,
    pub http_only: bool,
}

pub fn build_cookie(name: &str, value: &str, max_age_secs: i64, opts: CookieOptions) -> String {
    let secure_attr = if opts.secure { "; Secure" } else { "" };
    let http_only_attr = if opts.http_only { "; HttpOnly" } else { "" };
    format!(
        "{}={}{}{}; Path=/; Max-Age={}; SameSite=Lax",
        name,
        value,
        http_only_attr,
        secure_attr,
        max_age_secs.max(0)
    )
}

pub fn clear_cookie(name: &str, opts: CookieOptions) -> String {
    build_cookie(name, "", 0, opts)
}

/// Appends `Set-Cookie` headers for every cookie string; invalid values are skipped.
pub fn append_set_cookies(headers: &mut HeaderMap, cookies: impl IntoIterator<Item = String>) {
    for c in cookies {
        match HeaderValue::from_str(&c) {
            Ok(v) => {
                headers.append(header::SET_COOKIE, v);
            }
            Err(e) => tracing::warn!("Skipping invalid Set-Cookie value: {}", e),
        }
    }
}

/// Server-side last-activity tracker for back-office sessions.
#[derive(Clone)]
pub struct IdleTracker {
    last_seen: Arc<RwLock<HashMap<String, Instant>>>,
    timeout: Duration,
}

impl IdleTracker {
    pub fn new(timeout: Duration) -> Self {
        Self { last_seen: Arc::new(RwLock::new(HashMap::new())), timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn touch(&self, session_id: &str) {
        self.last_seen.write().await.insert(session_id.to_string(), Instant::now());
    }

    /// True when the session was seen before and has been quiet longer than the timeout.
    ///
    /// Unknown sessions (e.g. after a restart) are not idle.
    pub async fn is_idle(&self, session_id: &str) -> bool {
        self.is_idle_at(session_id, Instant::now()).await
    }

    async fn is_idle_at(&self, session_id: &str, now: Instant) -> bool {
        match self.last_seen.read().await.get(session_id) {
            Some(seen) => now.saturating_duration_since(*seen) > self.timeout,
            None => false,
        }
    }

    pub async fn forget(&self, session_id: &str) {
        self.last_seen.write().await.remove(session_id);
    }

    /// Sessions quiet for longer than the timeout.
    ///
    /// Entries stay tracked (and keep reporting idle) until [`forget`](Self::forget)
    /// is called, so the caller must revoke each session before dropping it.
    pub async fn idle_sessions(&self) -> Vec<String> {
        let now = Instant::now();
        self.last_seen
            .read()
            .await
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn tracked(&self) -> usize {
        self.last_seen.read().await.len()
    }
}
