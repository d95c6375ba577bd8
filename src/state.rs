use std::{sync::Arc, time::Duration};

use crate::audit::AuditLogger;
use crate::config::AppConfig;
use crate::identity::{IdentityProvider, LogMailer, Mailer, SqliteIdentityProvider};
use crate::metrics::Metrics;
use crate::middleware::csrf::CsrfStore;
use crate::middleware::rate_limit::{EndpointRateLimiter, RateLimiter};
use crate::session::IdleTracker;
use crate::storage::{LocalObjectStore, ObjectStore};

/// The shared application state.
///
/// Cloned into every handler and middleware; all members are cheap handles
/// around shared data.
#[derive(Clone)]
pub struct AppState {
    /// The database connection pool.
    pub db: sqlx::SqlitePool,
    /// The application configuration.
    pub config: Arc<AppConfig>,
    pub identity: Arc<dyn IdentityProvider>,
    pub storage: Arc<dyn ObjectStore>,
    pub metrics: Metrics,
    /// Per-endpoint limiters for the auth and inquiry routes.
    pub rate_limiter: EndpointRateLimiter,
    /// Per-IP limiter applied to every request.
    pub global_limiter: RateLimiter,
    pub csrf: CsrfStore,
    pub idle: IdleTracker,
    pub audit: AuditLogger,
}

impl AppState {
    /// Creates the state with the SQLite identity provider, a log-only mailer
    /// and local object storage from configuration.
    pub fn new(db: sqlx::SqlitePool, config: AppConfig) -> Self {
        Self::with_mailer(db, config, Arc::new(LogMailer))
    }

    pub fn with_mailer(db: sqlx::SqlitePool, config: AppConfig, mailer: Arc<dyn Mailer>) -> Self {
        let identity = Arc::new(SqliteIdentityProvider::new(db.clone(), config.auth.clone(), mailer));
        let storage = Arc::new(LocalObjectStore::new(&config.storage.root, config.storage.public_base_url.clone()));
        Self::from_parts(db, config, identity, storage)
    }

    pub fn from_parts(
        db: sqlx::SqlitePool,
        config: AppConfig,
        identity: Arc<dyn IdentityProvider>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        let rl = &config.rate_limit;
        let global_limiter = RateLimiter::new(rl.global_max_requests, Duration::from_secs(rl.global_window_secs));
        let rate_limiter = EndpointRateLimiter::from_config(rl);
        let csrf = CsrfStore::new(Duration::from_secs(config.csrf.token_ttl_secs));
        let idle = IdleTracker::new(Duration::from_secs(config.auth.idle_timeout_secs));

        Self {
            audit: AuditLogger::new(db.clone()),
            db,
            config: Arc::new(config),
            identity,
            storage,
            metrics: Metrics::new(),
            rate_limiter,
            global_limiter,
            csrf,
            idle,
        }
    }

    pub fn cookie_secure(&self) -> bool {
        self.config.auth.cookie_secure
    }
}
