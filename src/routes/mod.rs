//! HTTP route handlers for the Mikki Trade Motors API.
//!
//! - `auth`: login, signup, session and account recovery endpoints
//! - `vehicles`: public catalog and admin CRUD over listings
//! - `images`: vehicle image uploads and ordering
//! - `inquiries`: customer contact requests
//! - `dashboard`: admin statistics
//! - `audit`: audit log listing
//! - `health`: health check and system status endpoints

pub mod audit;
pub mod auth;
pub mod dashboard;
pub mod health;
pub mod images;
pub mod inquiries;
pub mod vehicles;

use std::path::PathBuf;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::{
    routing::{get, patch, post, put},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::middleware::{auth::session_gate, csrf::csrf_protection_middleware, rate_limit::rate_limit_middleware};
use crate::middleware::{security_headers::security_headers_middleware, validation::validate_request_middleware};
use crate::state::AppState;

fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(auth::login))
        .route("/signup", post(auth::signup))
        .route("/logout", post(auth::logout))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password", post(auth::reset_password))
        .route("/resend-verification", post(auth::resend_verification))
        .route("/verify-email", post(auth::verify_email))
        .route("/refresh", post(auth::refresh))
        .route("/session", get(auth::session))
        .route("/csrf", get(auth::csrf_token))
        .route("/password-strength", post(auth::password_strength))
}

/// Everything under `/api/admin`; the session gate has already admitted the caller.
fn admin_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/vehicles", get(vehicles::admin_list).post(vehicles::create_vehicle))
        .route(
            "/vehicles/{id}",
            get(vehicles::admin_get).put(vehicles::update_vehicle).delete(vehicles::delete_vehicle),
        )
        .route("/vehicles/{id}/restore", post(vehicles::restore_vehicle))
        .route("/vehicles/{id}/images", get(images::list_images).post(images::upload_image))
        .route("/vehicles/{id}/images/order", put(images::reorder_images))
        .route("/images/{id}", axum::routing::delete(images::delete_image))
        .route("/images/{id}/primary", put(images::set_primary))
        .route("/inquiries", get(inquiries::list_inquiries))
        .route("/inquiries/{id}", patch(inquiries::update_inquiry))
        .route("/dashboard/stats", get(dashboard::stats))
        .route("/audit", get(audit::list_audit))
        .route_layer(from_fn_with_state(state.clone(), csrf_protection_middleware))
}

/// Builds the complete application: API, object storage, static front end and
/// every middleware layer.
pub fn router(state: AppState) -> Router {
    let cfg = state.config.clone();

    let static_root = PathBuf::from(&cfg.server.static_dir);
    let static_ui = ServeDir::new(&static_root)
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new(static_root.join("index.html")));

    let mut app = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route("/metrics/prometheus", get(health::metrics_prometheus))
        .route("/version", get(health::version))
        .nest("/api/auth", auth_routes())
        .route("/api/vehicles", get(vehicles::list_public))
        .route("/api/vehicles/makes", get(vehicles::list_makes))
        .route("/api/vehicles/{id}", get(vehicles::get_public))
        .route("/api/inquiries", post(inquiries::create_inquiry))
        .nest("/api/admin", admin_routes(&state));

    // Only serve uploads ourselves when they live under a local path
    let storage_prefix = cfg.storage.public_base_url.trim_end_matches('/');
    if storage_prefix.starts_with('/') && storage_prefix.len() > 1 {
        app = app.nest_service(storage_prefix, ServeDir::new(&cfg.storage.root));
    }

    app.fallback_service(static_ui)
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(cfg.server.max_body_bytes))
        .layer(from_fn_with_state(state.clone(), session_gate))
        .layer(from_fn_with_state(cfg.clone(), validate_request_middleware))
        .layer(from_fn_with_state(state, rate_limit_middleware))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(cfg, security_headers_middleware))
}
