use super::ip::{client_ip, peer_ip};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::config::RateLimitConfig;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    reset_at: Instant,
}

/// Outcome of a single [`RateLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Time until the window resets.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Converts a rejection into the HTTP error, passing allowed decisions through.
    pub fn into_result(self) -> Result<Self, AppError> {
        if self.allowed {
            Ok(self)
        } else {
            // Round up so clients never retry a fraction of a second too early
            let secs = self.retry_after.as_secs() + u64::from(self.retry_after.subsec_nanos() > 0);
            Err(AppError::RateLimited { retry_after_seconds: secs.max(1) })
        }
    }
}

/// A thread-safe fixed-window rate limiter keyed by an arbitrary identifier.
///
/// Each identifier owns a counter and the instant its window resets. An entry
/// whose reset instant has passed is treated as absent.
#[derive(Clone)]
pub struct RateLimiter {
    entries: Arc<RwLock<HashMap<String, WindowEntry>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    /// Creates a new `RateLimiter` allowing `max_requests` per `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), max_requests, window }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Counts one request for `identifier` and reports whether it may proceed.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        self.check_at(identifier, Instant::now()).await
    }

    async fn check_at(&self, identifier: &str, now: Instant) -> RateLimitDecision {
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(identifier.to_string())
            .or_insert(WindowEntry { count: 0, reset_at: now + self.window });
        if now >= entry.reset_at {
            *entry = WindowEntry { count: 0, reset_at: now + self.window };
        }

        let retry_after = entry.reset_at.saturating_duration_since(now);
        if entry.count >= self.max_requests {
            return RateLimitDecision { allowed: false, remaining: 0, retry_after };
        }
        entry.count += 1;
        RateLimitDecision { allowed: true, remaining: self.max_requests - entry.count, retry_after }
    }

    /// Forgets `identifier`, restoring its full budget.
    pub async fn reset(&self, identifier: &str) {
        self.entries.write().await.remove(identifier);
    }

    /// Removes every entry whose window has already ended.
    pub async fn cleanup_expired(&self) {
        self.cleanup_at(Instant::now()).await;
    }

    async fn cleanup_at(&self, now: Instant) {
        self.entries.write().await.retain(|_, e| now < e.reset_at);
    }

    pub async fn tracked(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Names of the per-endpoint limiters built from configuration.
pub mod buckets {
    pub const LOGIN: &str = "login";
    pub const SIGNUP: &str = "signup";
    pub const FORGOT_PASSWORD: &str = "forgot_password";
    pub const RESET_PASSWORD: &str = "reset_password";
    pub const RESEND_VERIFICATION: &str = "resend_verification";
    pub const INQUIRY: &str = "inquiry";
}

/// A manager for per-endpoint rate limiters.
#[derive(Clone, Default)]
pub struct EndpointRateLimiter {
    limiters: Arc<HashMap<String, RateLimiter>>,
}

impl EndpointRateLimiter {
    /// Creates a new, empty `EndpointRateLimiter`; every check passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a limiter from `(name, max_requests, window_seconds)` triples.
    pub fn with_limits(limits: Vec<(&str, u32, u64)>) -> Self {
        let limiters = limits
            .into_iter()
            .map(|(name, max, window)| (name.to_string(), RateLimiter::new(max, Duration::from_secs(window))))
            .collect();
        Self { limiters: Arc::new(limiters) }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::with_limits(vec![
            (buckets::LOGIN, cfg.login_max_attempts, cfg.login_window_secs),
            (buckets::SIGNUP, cfg.signup_max_attempts, cfg.signup_window_secs),
            (buckets::FORGOT_PASSWORD, cfg.password_reset_max_attempts, cfg.password_reset_window_secs),
            (buckets::RESET_PASSWORD, cfg.password_reset_max_attempts, cfg.password_reset_window_secs),
            (
                buckets::RESEND_VERIFICATION,
                cfg.resend_verification_max_attempts,
                cfg.resend_verification_window_secs,
            ),
            (buckets::INQUIRY, cfg.inquiry_max_attempts, cfg.inquiry_window_secs),
        ])
    }

    /// Checks `identifier` against the limiter registered as `bucket`.
    ///
    /// Unknown buckets are unlimited.
    pub async fn check(&self, bucket: &str, identifier: &str) -> Result<RateLimitDecision, AppError> {
        match self.limiters.get(bucket) {
            Some(limiter) => {
                let decision = limiter.check(identifier).await;
                if !decision.allowed {
                    tracing::warn!(bucket, identifier, "rate limit exceeded");
                }
                decision.into_result()
            }
            None => Ok(RateLimitDecision { allowed: true, remaining: u32::MAX, retry_after: Duration::ZERO }),
        }
    }

    pub async fn reset(&self, bucket: &str, identifier: &str) {
        if let Some(limiter) = self.limiters.get(bucket) {
            limiter.reset(identifier).await;
        }
    }

    /// Cleans up expired entries from all endpoint-specific rate limiters.
    pub async fn cleanup_all(&self) {
        for limiter in self.limiters.values() {
            limiter.cleanup_expired().await;
        }
    }
}

/// An Axum middleware for global per-IP rate limiting.
///
/// Uses the global limiter held in [`AppState`]; answers `429 Too Many Requests`
/// with a `Retry-After` header once the client's window is exhausted.
pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ip = client_ip(req.headers(), peer_ip(req.extensions()), &state.config.server.trusted_proxies);

    let decision = state.global_limiter.check(&ip.to_string()).await;
    match decision.into_result() {
        Ok(_) => next.run(req).await,
        Err(e) => {
            state.metrics.inc_rate_limited();
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_request_after_max_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        for expected_remaining in [2, 1, 0] {
            let d = limiter.check("10.0.0.1").await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let blocked = limiter.check("10.0.0.1").await;
        assert!(!blocked.allowed);
        assert!(blocked.retry_after <= Duration::from_secs(60));
        assert!(blocked.retry_after > Duration::from_secs(55));
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_absent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check_at("k", start).await.allowed);
        assert!(!limiter.check_at("k", start + Duration::from_secs(9)).await.allowed);
        let after = limiter.check_at("k", start + Duration::from_secs(10)).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 0);
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.check("a").await.allowed);
        assert!(limiter.check("b").await.allowed);
        assert!(!limiter.check("a").await.allowed);
        assert!(!limiter.check("b").await.allowed);
    }

    #[tokio::test]
    async fn reset_restores_budget() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("user").await.allowed);
        assert!(!limiter.check("user").await.allowed);
        limiter.reset("user").await;
        assert!(limiter.check("user").await.allowed);
    }

    #[tokio::test]
    async fn cleanup_drops_only_finished_windows() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        limiter.check_at("old", start).await;
        limiter.check_at("fresh", start + Duration::from_secs(30)).await;
        assert_eq!(limiter.tracked().await, 2);

        limiter.cleanup_at(start + Duration::from_secs(61)).await;
        assert_eq!(limiter.tracked().await, 1);
    }

    #[tokio::test]
    async fn endpoint_limiter_maps_to_rate_limited_error() {
        let limiters = EndpointRateLimiter::with_limits(vec![(buckets::LOGIN, 2, 60)]);
        assert!(limiters.check(buckets::LOGIN, "ip").await.is_ok());
        assert!(limiters.check(buckets::LOGIN, "ip").await.is_ok());
        match limiters.check(buckets::LOGIN, "ip").await {
            Err(AppError::RateLimited { retry_after_seconds }) => assert!((1..=60).contains(&retry_after_seconds)),
            other => panic!("expected rate limit, got {:?}", other),
        }
        // Unregistered buckets never block
        for _ in 0..10 {
            assert!(limiters.check("unknown", "ip").await.is_ok());
        }
    }
}
