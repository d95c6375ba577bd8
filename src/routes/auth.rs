//! `/api/auth/*`: login, signup, logout and the account recovery flows.
//!
//! All endpoints that accept credentials or send mail are rate limited per
//! client address. Login is reserved for back-office roles; other accounts
//! are signed out again right away.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::audit::{AuditAction, AuditEvent};
use crate::error::{AppError, AppResult};
use crate::identity::{AuthError, Session};
use crate::middleware::auth::{
    carry_over_rotation, cleared_session_cookies, end_session, expire_idle, session_cookies,
};
use crate::middleware::csrf::CSRF_COOKIE;
use crate::middleware::ip::ClientIp;
use crate::middleware::rate_limit::buckets;
use crate::middleware::validation::{optional_text, validate_email};
use crate::password::validate_password;
use crate::session::{append_set_cookies, build_cookie, clear_cookie, read_cookie, CookieOptions, CurrentUser, REFRESH_COOKIE};
use crate::state::AppState;
use crate::types::{
    AuthResponse, EmailRequest, LoginRequest, MessageResponse, PasswordStrengthRequest, PasswordStrengthResponse,
    ResetPasswordRequest, SessionInfo, SignupRequest, TokenRequest,
};

async fn limit(state: &AppState, bucket: &str, ip: &str) -> AppResult<()> {
    match state.rate_limiter.check(bucket, ip).await {
        Ok(_) => Ok(()),
        Err(e) => {
            state.metrics.inc_rate_limited();
            Err(e)
        }
    }
}

fn csrf_cookie(state: &AppState, token: &str) -> String {
    let opts = CookieOptions { secure: state.cookie_secure(), http_only: false };
    build_cookie(CSRF_COOKIE, token, state.csrf.ttl().as_secs() as i64, opts)
}

fn cleared_csrf_cookie(state: &AppState) -> String {
    clear_cookie(CSRF_COOKIE, CookieOptions { secure: state.cookie_secure(), http_only: false })
}

fn with_cookies(body: impl IntoResponse, cookies: Vec<String>) -> Response {
    let mut res = body.into_response();
    append_set_cookies(res.headers_mut(), cookies);
    res
}

/// Rejects weak passwords with every failed rule in the message.
fn ensure_strong(password: &str) -> AppResult<()> {
    let check = validate_password(password);
    if check.valid {
        return Ok(());
    }
    Err(AppError::ValidationError { field: "password".into(), message: check.messages().join("; ") })
}

/// Cookies and body for a back-office session that was just issued.
async fn establish(state: &AppState, session: &Session) -> Response {
    let user = session.current_user();
    let csrf_token = state.csrf.issue(&user.session_id).await;
    let mut cookies = session_cookies(state, session);
    cookies.push(csrf_cookie(state, &csrf_token));
    let body = AuthResponse { user, expires_in: session.access_expires_in, csrf_token: Some(csrf_token) };
    with_cookies(Json(body), cookies)
}

pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<LoginRequest>,
) -> AppResult<Response> {
    let key = ip.to_string();
    if let Err(e) = limit(&state, buckets::LOGIN, &key).await {
        state
            .audit
            .record(AuditEvent::new(AuditAction::LoginRateLimited).email(req.email.trim()).ip(ip))
            .await;
        return Err(e);
    }

    let email = validate_email(&req.email)?;
    if req.password.is_empty() {
        return Err(AppError::ValidationError { field: "password".into(), message: "Password is required".into() });
    }

    let session = match state.identity.sign_in(&email, &req.password).await {
        Ok(session) => session,
        Err(e) => {
            if matches!(e, AuthError::InvalidCredentials | AuthError::AccountInactive | AuthError::EmailNotVerified) {
                state.metrics.inc_logins_failed();
                state
                    .audit
                    .record(
                        AuditEvent::new(AuditAction::LoginFailed)
                            .email(&email)
                            .ip(ip)
                            .details(serde_json::json!({ "reason": e.to_string() })),
                    )
                    .await;
            }
            return Err(e.into());
        }
    };

    let user = session.current_user();
    if !user.role.can_access_admin() {
        end_session(&state, &user.session_id).await;
        state.metrics.inc_logins_failed();
        state
            .audit
            .record(AuditEvent::new(AuditAction::LoginRoleDenied).actor(&user).ip(ip))
            .await;
        return Err(AppError::Forbidden("You do not have access to the admin area".into()));
    }

    state.rate_limiter.reset(buckets::LOGIN, &key).await;
    state.idle.touch(&user.session_id).await;
    state.metrics.inc_logins_succeeded();
    state.audit.record(AuditEvent::new(AuditAction::LoginSucceeded).actor(&user).ip(ip)).await;

    Ok(establish(&state, &session).await)
}

pub async fn signup(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<SignupRequest>,
) -> AppResult<Response> {
    limit(&state, buckets::SIGNUP, &ip.to_string()).await?;

    let email = validate_email(&req.email)?;
    ensure_strong(&req.password)?;
    let full_name = optional_text(req.full_name.as_deref(), "full_name", 100)?;

    let user = state.identity.sign_up(&email, &req.password, full_name.as_deref()).await?;
    state.metrics.inc_signups();
    state
        .audit
        .record(AuditEvent::new(AuditAction::SignUp).email(&user.email).ip(ip).target(&user.id))
        .await;

    let message = if user.email_verified {
        "Account created"
    } else {
        "Account created. Check your email to verify your address"
    };
    let body = serde_json::json!({ "success": true, "message": message, "user": user });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

pub async fn logout(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    user: Option<CurrentUser>,
) -> Response {
    if let Some(user) = user.as_ref() {
        end_session(&state, &user.session_id).await;
        state.audit.record(AuditEvent::new(AuditAction::Logout).actor(user).ip(ip)).await;
    }
    let mut cookies = cleared_session_cookies(&state);
    cookies.push(cleared_csrf_cookie(&state));
    with_cookies(Json(MessageResponse::new("Signed out")), cookies)
}

/// Always answers the same way so the endpoint cannot be used to discover accounts.
pub async fn forgot_password(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<EmailRequest>,
) -> AppResult<Json<MessageResponse>> {
    limit(&state, buckets::FORGOT_PASSWORD, &ip.to_string()).await?;
    let email = validate_email(&req.email)?;

    state.identity.request_password_reset(&email).await?;
    state
        .audit
        .record(AuditEvent::new(AuditAction::PasswordResetRequested).email(&email).ip(ip))
        .await;
    Ok(Json(MessageResponse::new("If an account exists for this address, a reset link has been sent")))
}

pub async fn reset_password(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<ResetPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    limit(&state, buckets::RESET_PASSWORD, &ip.to_string()).await?;
    if req.token.trim().is_empty() {
        return Err(AuthError::InvalidToken.into());
    }
    ensure_strong(&req.password)?;

    let user = state.identity.reset_password(req.token.trim(), &req.password).await?;
    state
        .audit
        .record(AuditEvent::new(AuditAction::PasswordResetCompleted).email(&user.email).ip(ip).target(&user.id))
        .await;
    Ok(Json(MessageResponse::new("Password updated. Please sign in again")))
}

pub async fn resend_verification(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<EmailRequest>,
) -> AppResult<Json<MessageResponse>> {
    limit(&state, buckets::RESEND_VERIFICATION, &ip.to_string()).await?;
    let email = validate_email(&req.email)?;
    state.identity.resend_verification(&email).await?;
    Ok(Json(MessageResponse::new("If the address still needs verification, a new link has been sent")))
}

pub async fn verify_email(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<TokenRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if req.token.trim().is_empty() {
        return Err(AuthError::InvalidToken.into());
    }
    let user = state.identity.verify_email(req.token.trim()).await?;
    state
        .audit
        .record(AuditEvent::new(AuditAction::EmailVerified).email(&user.email).ip(ip).target(&user.id))
        .await;
    Ok(Json(serde_json::json!({ "success": true, "user": user })))
}

/// Explicit token rotation for clients that refresh ahead of expiry.
pub async fn refresh(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    user: Option<CurrentUser>,
) -> AppResult<Response> {
    let token = read_cookie(&headers, REFRESH_COOKIE)
        .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))?;

    match state.identity.refresh(&token).await {
        Ok(session) => {
            let fresh = session.current_user();
            if !carry_over_rotation(&state, &session).await {
                expire_idle(&state, &fresh, ip).await;
                let err = AppError::Unauthorized("Session expired due to inactivity".into()).into_response();
                return Ok(with_cookies(err, cleared_session_cookies(&state)));
            }
            let body = AuthResponse { user: fresh, expires_in: session.access_expires_in, csrf_token: None };
            Ok(with_cookies(Json(body), session_cookies(&state, &session)))
        }
        // The session gate already rotated this refresh token on the way in
        Err(AuthError::InvalidToken | AuthError::SessionExpired) if user.is_some() => {
            let body = serde_json::json!({ "user": user, "expires_in": state.config.auth.access_token_ttl_secs });
            Ok(Json(body).into_response())
        }
        Err(AuthError::InvalidToken | AuthError::SessionExpired) => {
            let err = AppError::Unauthorized("Session expired, please sign in again".into()).into_response();
            Ok(with_cookies(err, cleared_session_cookies(&state)))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn session(State(state): State<AppState>, user: Option<CurrentUser>) -> Json<SessionInfo> {
    Json(SessionInfo {
        authenticated: user.is_some(),
        user,
        idle_timeout_secs: state.idle.timeout().as_secs(),
    })
}

/// Issues a fresh CSRF token for the caller's session (header value + cookie).
pub async fn csrf_token(State(state): State<AppState>, user: CurrentUser) -> Response {
    let token = state.csrf.issue(&user.session_id).await;
    let cookie = csrf_cookie(&state, &token);
    with_cookies(Json(serde_json::json!({ "csrf_token": token })), vec![cookie])
}

pub async fn password_strength(Json(req): Json<PasswordStrengthRequest>) -> Json<PasswordStrengthResponse> {
    let check = validate_password(&req.password);
    Json(PasswordStrengthResponse { valid: check.valid, score: check.score, errors: check.messages() })
}
