//! Router-level tests for the Mikki Trade Motors API.
//!
//! Every test drives the complete application (all middleware layers
//! included) with `tower::ServiceExt::oneshot` against an in-memory SQLite
//! database and a temporary object store.
//!
//! ## Test Modules
//!
//! - **auth_api_tests**: login, signup, recovery flows and rate limiting
//! - **gate_api_tests**: session gate redirects, refresh, idle timeout and CSRF
//! - **vehicles_api_tests**: public catalog and admin vehicle CRUD
//! - **images_api_tests**: image uploads, primary flag and ordering
//! - **inquiries_api_tests**: contact form and inquiry triage
//! - **admin_api_tests**: dashboard statistics and audit log
//! - **health_api_tests**: health, metrics, version and request hardening

pub mod images_api_tests;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, Response, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use crate::config::AppConfig;
use crate::identity::mailer::testing::CapturingMailer;
use crate::session::Role;
use crate::state::AppState;
use crate::test_support::memory_pool;

pub const ADMIN_EMAIL: &str = "admin@mikki.example";
pub const ADMIN_PASSWORD: &str = "Showroom#2024";
pub const STRONG_PASSWORD: &str = "Garage#Keys42";

/// Session cookies of a signed-in client.
#[derive(Debug, Clone, Default)]
pub struct Cookies {
    pub access: String,
    pub refresh: String,
    pub csrf: Option<String>,
}

impl Cookies {
    pub fn header(&self) -> String {
        let mut out = format!("sb-access-token={}; sb-refresh-token={}", self.access, self.refresh);
        if let Some(csrf) = &self.csrf {
            out.push_str(&format!("; csrf-token={}", csrf));
        }
        out
    }

    /// Applies rotated values from a response.
    pub fn update_from(&mut self, res: &Response<Body>) {
        if let Some(v) = set_cookie(res, "sb-access-token") {
            self.access = v;
        }
        if let Some(v) = set_cookie(res, "sb-refresh-token") {
            self.refresh = v;
        }
        if let Some(v) = set_cookie(res, "csrf-token") {
            self.csrf = Some(v);
        }
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub mailer: CapturingMailer,
    _storage: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let storage = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.storage.root = storage.path().to_string_lossy().into_owned();
        tweak(&mut cfg);

        let mailer = CapturingMailer::default();
        let state = AppState::with_mailer(memory_pool().await, cfg, Arc::new(mailer.clone()));
        state.identity.ensure_admin(ADMIN_EMAIL, ADMIN_PASSWORD).await.unwrap();
        let app = crate::routes::router(state.clone());
        TestApp { app, state, mailer, _storage: storage }
    }

    pub fn storage_root(&self) -> &std::path::Path {
        self._storage.path()
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    pub async fn get(&self, uri: &str, cookies: Option<&Cookies>) -> Response<Body> {
        self.send(request(Method::GET, uri, None, cookies)).await
    }

    pub async fn post_json(&self, uri: &str, body: Value, cookies: Option<&Cookies>) -> Response<Body> {
        self.send(request(Method::POST, uri, Some(body), cookies)).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Response<Body> {
        self.post_json("/api/auth/login", serde_json::json!({ "email": email, "password": password }), None)
            .await
    }

    pub async fn login_admin(&self) -> Cookies {
        let res = self.login(ADMIN_EMAIL, ADMIN_PASSWORD).await;
        assert_eq!(res.status(), StatusCode::OK);
        let mut cookies = Cookies::default();
        cookies.update_from(&res);
        cookies
    }

    /// A verified, active account with `role`, signed in through the identity
    /// provider directly (the login endpoint refuses non back-office roles).
    pub async fn session_for_role(&self, email: &str, role: Role) -> Cookies {
        self.state.identity.sign_up(email, STRONG_PASSWORD, None).await.unwrap();
        sqlx::query("UPDATE users SET role = ?1, email_verified_at = '2024-01-01T00:00:00Z' WHERE email = ?2")
            .bind(role.as_str())
            .bind(email)
            .execute(&self.state.db)
            .await
            .unwrap();
        let session = self.state.identity.sign_in(email, STRONG_PASSWORD).await.unwrap();
        let csrf = self.state.csrf.issue(&session.session_id).await;
        Cookies { access: session.access_token, refresh: session.refresh_token, csrf: Some(csrf) }
    }

    pub async fn create_vehicle(&self, cookies: &Cookies, body: Value) -> Value {
        let res = self.post_json("/api/admin/vehicles", body, Some(cookies)).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        body_json(res).await
    }
}

/// Builds a request; with cookies it also echoes the CSRF token in the header.
pub fn request(method: Method, uri: &str, body: Option<Value>, cookies: Option<&Cookies>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(c) = cookies {
        builder = builder.header(header::COOKIE, c.header());
        if let Some(csrf) = &c.csrf {
            builder = builder.header("x-csrf-token", csrf);
        }
    }
    match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Marks `req` as arriving from `peer`, the way `into_make_service_with_connect_info` does.
pub fn from_peer(mut req: Request<Body>, peer: &str) -> Request<Body> {
    let addr = std::net::SocketAddr::new(peer.parse().unwrap(), 49152);
    req.extensions_mut().insert(axum::extract::ConnectInfo(addr));
    req
}

/// A login request carrying an `x-forwarded-for` header.
pub fn login_request(email: &str, password: &str, forwarded_for: &str) -> Request<Body> {
    let mut req = request(Method::POST, "/api/auth/login", Some(serde_json::json!({ "email": email, "password": password })), None);
    req.headers_mut().insert("x-forwarded-for", forwarded_for.parse().unwrap());
    req
}

pub async fn body_json(res: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Every `Set-Cookie` header of the response.
pub fn set_cookies(res: &Response<Body>) -> Vec<String> {
    res.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Value of the last non-empty `Set-Cookie` for `name`.
pub fn set_cookie(res: &Response<Body>, name: &str) -> Option<String> {
    set_cookies(res)
        .iter()
        .filter_map(|c| c.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_string())
        .last()
}

/// Minimal valid PNG header, enough for type sniffing.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R'];

pub fn multipart_request(
    uri: &str,
    cookies: &Cookies,
    content_type: &str,
    bytes: &[u8],
    extra: &[(&str, &str)],
) -> Request<Body> {
    const BOUNDARY: &str = "mikkiboundary";
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"photo\"\r\nContent-Type: {}\r\n\r\n",
            BOUNDARY, content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(b"\r\n");
    for (name, value) in extra {
        body.extend_from_slice(
            format!("--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n", BOUNDARY, name, value)
                .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
        .header(header::COOKIE, cookies.header());
    if let Some(csrf) = &cookies.csrf {
        builder = builder.header("x-csrf-token", csrf);
    }
    builder.body(Body::from(body)).unwrap()
}

/// Inserts a vehicle row directly; returns its id.
pub async fn seed_vehicle(
    state: &AppState,
    make: &str,
    model: &str,
    year: i64,
    price: i64,
    mileage: i64,
    status: &str,
    featured: bool,
) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"INSERT INTO vehicles (id, make, model, year, price, mileage, status, featured, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
    )
    .bind(&id)
    .bind(make)
    .bind(model)
    .bind(year)
    .bind(price)
    .bind(mileage)
    .bind(status)
    .bind(featured)
    .bind(crate::db::now_timestamp())
    .execute(&state.db)
    .await
    .unwrap();
    id
}
