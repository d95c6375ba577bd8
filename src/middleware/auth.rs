//! Session gate.
//!
//! Resolves the caller from the `sb-access-token` / `sb-refresh-token`
//! cookies, enforces the idle timeout and keeps unauthenticated or
//! under-privileged callers out of `/admin/*` and `/api/admin/*`.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use std::net::IpAddr;

use super::ip::{client_ip, peer_ip};
use crate::audit::{AuditAction, AuditEvent};
use crate::error::AppError;
use crate::identity::Session;
use crate::session::{
    append_set_cookies, build_cookie, clear_cookie, read_cookie, CookieOptions, CurrentUser, ACCESS_COOKIE,
    REFRESH_COOKIE,
};
use crate::state::AppState;

pub const LOGIN_PATH: &str = "/login";
pub const DASHBOARD_PATH: &str = "/admin/dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    AdminPage,
    AdminApi,
    LoginPage,
    Public,
}

pub fn classify(path: &str) -> Area {
    let under = |prefix: &str| path == prefix || path.starts_with(&format!("{}/", prefix));
    if under("/api/admin") {
        Area::AdminApi
    } else if under("/admin") {
        Area::AdminPage
    } else if path == LOGIN_PATH {
        Area::LoginPage
    } else {
        Area::Public
    }
}

#[derive(Default)]
struct Resolution {
    user: Option<CurrentUser>,
    set_cookies: Vec<String>,
    idle_expired: bool,
}

fn session_opts(state: &AppState) -> CookieOptions {
    CookieOptions { secure: state.cookie_secure(), http_only: true }
}

/// `Set-Cookie` values for a freshly issued session.
pub fn session_cookies(state: &AppState, session: &Session) -> Vec<String> {
    let opts = session_opts(state);
    vec![
        build_cookie(ACCESS_COOKIE, &session.access_token, session.access_expires_in, opts),
        build_cookie(REFRESH_COOKIE, &session.refresh_token, session.refresh_expires_in, opts),
    ]
}

/// `Set-Cookie` values that remove both session cookies.
pub fn cleared_session_cookies(state: &AppState) -> Vec<String> {
    let opts = session_opts(state);
    vec![clear_cookie(ACCESS_COOKIE, opts), clear_cookie(REFRESH_COOKIE, opts)]
}

/// Revokes a session everywhere it is tracked.
pub async fn end_session(state: &AppState, session_id: &str) {
    if let Err(e) = state.identity.sign_out(session_id).await {
        tracing::warn!(session_id, "Failed to revoke session: {}", e);
    }
    state.idle.forget(session_id).await;
    state.csrf.revoke(session_id).await;
}

/// Revokes an idle session and records why.
pub(crate) async fn expire_idle(state: &AppState, user: &CurrentUser, ip: IpAddr) {
    end_session(state, &user.session_id).await;
    state.metrics.inc_sessions_idle_expired();
    state.audit.record(AuditEvent::new(AuditAction::SessionIdleExpired).actor(user).ip(ip)).await;
}

/// Revokes every tracked session that has gone idle without a further request.
///
/// Run by the background sweeper; returns the number of revoked sessions.
pub async fn expire_idle_sessions(state: &AppState) -> usize {
    let idle = state.idle.idle_sessions().await;
    for session_id in &idle {
        end_session(state, session_id).await;
        state.metrics.inc_sessions_idle_expired();
        state
            .audit
            .record(
                AuditEvent::new(AuditAction::SessionIdleExpired)
                    .target(session_id.as_str())
                    .details(serde_json::json!({ "swept": true })),
            )
            .await;
    }
    if !idle.is_empty() {
        tracing::info!(count = idle.len(), "revoked idle sessions");
    }
    idle.len()
}

/// Moves idle tracking and the CSRF token from the replaced session to `session`.
///
/// Returns `false` when the replaced session had gone idle; nothing is carried over then.
pub async fn carry_over_rotation(state: &AppState, session: &Session) -> bool {
    if let Some(old) = session.rotated_from.as_deref() {
        let idle = state.idle.is_idle(old).await;
        state.idle.forget(old).await;
        if idle {
            state.csrf.revoke(old).await;
            return false;
        }
        state.csrf.rekey(old, &session.session_id).await;
    }
    state.idle.touch(&session.session_id).await;
    true
}

async fn resolve(state: &AppState, headers: &HeaderMap, ip: IpAddr) -> Resolution {
    let access = read_cookie(headers, ACCESS_COOKIE);
    let refresh = read_cookie(headers, REFRESH_COOKIE);
    if access.is_none() && refresh.is_none() {
        return Resolution::default();
    }

    let mut out = Resolution::default();

    if let Some(token) = access.as_deref() {
        match state.identity.verify_access_token(token).await {
            Ok(Some(user)) => {
                if state.idle.is_idle(&user.session_id).await {
                    expire_idle(state, &user, ip).await;
                    out.idle_expired = true;
                    out.set_cookies = cleared_session_cookies(state);
                    return out;
                }
                state.idle.touch(&user.session_id).await;
                out.user = Some(user);
                return out;
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Access token verification failed: {}", e),
        }
    }

    if let Some(token) = refresh.as_deref() {
        match state.identity.refresh(token).await {
            Ok(session) => {
                let user = session.current_user();
                if !carry_over_rotation(state, &session).await {
                    expire_idle(state, &user, ip).await;
                    out.idle_expired = true;
                    out.set_cookies = cleared_session_cookies(state);
                    return out;
                }
                tracing::debug!(session_id = %user.session_id, "session refreshed");
                out.set_cookies = session_cookies(state, &session);
                out.user = Some(user);
                return out;
            }
            Err(e) => tracing::debug!("Session refresh rejected: {}", e),
        }

        // A parallel request may have rotated this refresh token a moment ago
        match state.identity.rotated_successor(token).await {
            Ok(Some(user)) => {
                if !state.idle.is_idle(&user.session_id).await {
                    state.idle.touch(&user.session_id).await;
                    out.user = Some(user);
                    return out;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Rotated session lookup failed: {}", e),
        }
    }

    // Stale cookies: make the browser drop them
    out.set_cookies = cleared_session_cookies(state);
    out
}

fn login_redirect(path_and_query: &str, idle: bool) -> Response {
    let mut target = format!("{}?redirectTo={}", LOGIN_PATH, urlencoding::encode(path_and_query));
    if idle {
        target.push_str("&reason=idle");
    }
    Redirect::temporary(&target).into_response()
}

/// Gatekeeper for the back office; must wrap every route.
pub async fn session_gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let area = classify(req.uri().path());
    let ip = client_ip(req.headers(), peer_ip(req.extensions()), &state.config.server.trusted_proxies);
    let resolution = resolve(&state, req.headers(), ip).await;

    let mut res = match (area, resolution.user.as_ref()) {
        (Area::AdminPage, None) => {
            let pq = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/admin").to_string();
            login_redirect(&pq, resolution.idle_expired)
        }
        (Area::AdminPage, Some(user)) if !user.role.can_access_admin() => {
            Redirect::temporary("/?error=unauthorized").into_response()
        }
        (Area::AdminApi, None) => {
            let msg = if resolution.idle_expired {
                "Session expired due to inactivity"
            } else {
                "Authentication required"
            };
            AppError::Unauthorized(msg.into()).into_response()
        }
        (Area::AdminApi, Some(user)) if !user.role.can_access_admin() => {
            AppError::Forbidden("You do not have access to the admin area".into()).into_response()
        }
        (Area::LoginPage, Some(user)) if user.role.can_access_admin() => {
            Redirect::temporary(DASHBOARD_PATH).into_response()
        }
        _ => {
            if let Some(user) = resolution.user.clone() {
                req.extensions_mut().insert(user);
            }
            next.run(req).await
        }
    };

    append_set_cookies(res.headers_mut(), resolution.set_cookies);
    res
}
