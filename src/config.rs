use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory with the prebuilt front end, served as SPA fallback.
    pub static_dir: String,
    pub max_body_bytes: usize,
    /// Reverse proxies whose `x-forwarded-for` / `x-real-ip` headers are believed.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub idle_timeout_secs: u64,
    /// How long a just-rotated refresh token still resolves to its replacement.
    pub refresh_reuse_grace_secs: i64,
    pub verification_token_ttl_secs: i64,
    pub reset_token_ttl_secs: i64,
    pub require_email_verification: bool,
    pub cookie_secure: bool,
    /// Base URL used when building links in outgoing mail.
    pub site_url: String,
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub global_max_requests: u32,
    pub global_window_secs: u64,
    pub login_max_attempts: u32,
    pub login_window_secs: u64,
    pub signup_max_attempts: u32,
    pub signup_window_secs: u64,
    pub password_reset_max_attempts: u32,
    pub password_reset_window_secs: u64,
    pub resend_verification_max_attempts: u32,
    pub resend_verification_window_secs: u64,
    pub inquiry_max_attempts: u32,
    pub inquiry_window_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub root: String,
    pub public_base_url: String,
    pub max_image_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    pub enable_hsts: Option<bool>,
    pub hsts_max_age: Option<u64>,
    pub hsts_include_subdomains: Option<bool>,
    pub csp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub csrf: CsrfConfig,
    pub rate_limit: RateLimitConfig,
    pub storage: StorageConfig,
    pub security: Option<SecurityConfig>,
}

const DEFAULTS: &str = include_str!("../config/default.toml");

impl Default for AppConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
            .build()
        {
            Ok(cfg) => match cfg.try_deserialize() {
                Ok(app_cfg) => app_cfg,
                Err(e) => {
                    eprintln!("FATAL: Failed to deserialize default config: {}", e);
                    panic!("Failed to deserialize default config: {}", e);
                }
            },
            Err(e) => {
                eprintln!("FATAL: Failed to parse default config: {}", e);
                panic!("Failed to parse default config: {}", e);
            }
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: mikki.toml (in CWD)
        .add_source(::config::File::with_name("mikki").required(false));

    if let Ok(custom_path) = std::env::var("MIKKI_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(::config::Environment::with_prefix("MIKKI").separator("__"));

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    // Server
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }
    if cfg.server.max_body_bytes < cfg.storage.max_image_bytes {
        return Err(anyhow::anyhow!("server.max_body_bytes must be >= storage.max_image_bytes"));
    }

    // Auth
    let a = &cfg.auth;
    if a.access_token_ttl_secs <= 0 {
        return Err(anyhow::anyhow!("auth.access_token_ttl_secs must be > 0"));
    }
    if a.refresh_token_ttl_secs <= a.access_token_ttl_secs {
        return Err(anyhow::anyhow!("auth.refresh_token_ttl_secs must be > access_token_ttl_secs"));
    }
    if a.idle_timeout_secs == 0 {
        return Err(anyhow::anyhow!("auth.idle_timeout_secs must be > 0"));
    }
    if a.verification_token_ttl_secs <= 0 || a.reset_token_ttl_secs <= 0 {
        return Err(anyhow::anyhow!("auth token lifetimes must be > 0"));
    }
    if a.bootstrap_admin_email.is_some() != a.bootstrap_admin_password.is_some() {
        return Err(anyhow::anyhow!(
            "auth.bootstrap_admin_email and auth.bootstrap_admin_password must be set together"
        ));
    }

    if cfg.csrf.token_ttl_secs == 0 {
        return Err(anyhow::anyhow!("csrf.token_ttl_secs must be > 0"));
    }

    // Rate limits: every (max, window) pair must be positive
    let r = &cfg.rate_limit;
    let pairs = [
        ("global", r.global_max_requests, r.global_window_secs),
        ("login", r.login_max_attempts, r.login_window_secs),
        ("signup", r.signup_max_attempts, r.signup_window_secs),
        ("password_reset", r.password_reset_max_attempts, r.password_reset_window_secs),
        ("resend_verification", r.resend_verification_max_attempts, r.resend_verification_window_secs),
        ("inquiry", r.inquiry_max_attempts, r.inquiry_window_secs),
    ];
    for (name, max, window) in pairs {
        if max == 0 || window == 0 {
            return Err(anyhow::anyhow!("rate_limit.{} limits must be > 0", name));
        }
    }
    if !(10..=86_400).contains(&r.cleanup_interval_secs) {
        return Err(anyhow::anyhow!("rate_limit.cleanup_interval_secs must be in 10..=86400"));
    }

    if cfg.storage.max_image_bytes == 0 {
        return Err(anyhow::anyhow!("storage.max_image_bytes must be > 0"));
    }

    Ok(())
}

pub fn ensure_sqlite_parent_dir(url: &str) -> anyhow::Result<()> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
