use axum::{
    extract::{Request, State},
    http::{header::CONTENT_LENGTH, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap();
    // 17 characters, I/O/Q never appear in a VIN
    static ref VIN: Regex = Regex::new(r"^[A-HJ-NPR-Z0-9]{17}$").unwrap();
}

pub const MAX_EMAIL_LENGTH: usize = 254;

/// An Axum middleware that rejects obviously malicious requests early.
///
/// - Path traversal attempts in the request URI -> `400`
/// - Declared bodies above `server.max_body_bytes` -> `413`
/// - Scanner user agents are logged
pub async fn validate_request_middleware(State(cfg): State<Arc<AppConfig>>, req: Request, next: Next) -> Response {
    if contains_path_traversal(req.uri().path()) {
        return AppError::BadRequest("Path traversal detected in request".into()).into_response();
    }

    if let Some(ua) = req.headers().get("user-agent").and_then(|v| v.to_str().ok()) {
        if is_suspicious_user_agent(ua) {
            tracing::warn!("Suspicious user agent detected: {}", sanitize_for_logging(ua));
        }
    }

    if matches!(req.method(), &Method::POST | &Method::PUT | &Method::PATCH) {
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(length) = declared {
            if length > cfg.server.max_body_bytes {
                return AppError::PayloadTooLarge(format!(
                    "Request body exceeds maximum size of {} bytes",
                    cfg.server.max_body_bytes
                ))
                .into_response();
            }
        }
    }

    next.run(req).await
}

/// Check if a path contains traversal attempts
fn contains_path_traversal(path: &str) -> bool {
    let lower = path.to_lowercase();

    if path.contains("/..") || path.contains("\\..") || path.starts_with("..") {
        return true;
    }
    if path.contains("/./") || path.contains("\\.\\") {
        return true;
    }

    // URL-encoded variants (single and double encoding)
    let encoded_patterns = ["%2e%2e", "%252e%252e", "%2e/", "%252e%2f", "/%2e", "%2f%2e", "%5c%2e", "%00"];
    if encoded_patterns.iter().any(|p| lower.contains(p)) {
        return true;
    }

    path.contains('\0')
}

/// Check for suspicious user agents (simple heuristic)
fn is_suspicious_user_agent(ua: &str) -> bool {
    let ua_lower = ua.to_lowercase();
    ua_lower.contains("scanner")
        || (ua_lower.contains("crawler") && !ua_lower.contains("googlebot") && !ua_lower.contains("bingbot"))
        || ua_lower.contains("nikto")
        || ua_lower.contains("sqlmap")
        || ua_lower.contains("havij")
        || ua_lower.contains("acunetix")
}

/// Parses a path id, answering `400` for anything that is not a UUID.
pub fn validate_uuid(id: &str) -> AppResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| AppError::BadRequest(format!("Invalid id: {}", sanitize_for_logging(id))))
}

pub fn validate_email(email: &str) -> AppResult<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(AppError::ValidationError { field: "email".into(), message: "Email is required".into() });
    }
    if trimmed.len() > MAX_EMAIL_LENGTH || !EMAIL.is_match(trimmed) {
        return Err(AppError::ValidationError { field: "email".into(), message: "Invalid email address".into() });
    }
    Ok(trimmed.to_lowercase())
}

/// Trims `value` and checks it is non-empty and at most `max` characters.
pub fn required_text(value: &str, field: &str, max: usize) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::ValidationError { field: field.into(), message: "must not be empty".into() });
    }
    optional_text(Some(trimmed), field, max).map(|v| v.unwrap_or_default())
}

/// Like [`required_text`] but blank input becomes `None`.
pub fn optional_text(value: Option<&str>, field: &str, max: usize) -> AppResult<Option<String>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) if v.chars().count() > max => Err(AppError::ValidationError {
            field: field.into(),
            message: format!("must be at most {} characters", max),
        }),
        Some(v) => Ok(Some(v.to_string())),
    }
}

pub fn validate_vin(vin: &str) -> AppResult<String> {
    let upper = vin.trim().to_uppercase();
    if !VIN.is_match(&upper) {
        return Err(AppError::ValidationError {
            field: "vin".into(),
            message: "VIN must be 17 characters (letters I, O and Q are not allowed)".into(),
        });
    }
    Ok(upper)
}

/// Sanitizes input for safe logging
pub fn sanitize_for_logging(input: &str) -> String {
    input.chars().filter(|c| !c.is_control() || *c == '\n').take(200).collect()
}
