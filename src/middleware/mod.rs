//! Middleware components for HTTP request processing.
//!
//! Cross-cutting concerns layered onto the router: the session gate,
//! CSRF protection, rate limiting, request validation, security headers
//! and client identification.

pub mod auth;
pub mod csrf;
pub mod ip;
pub mod rate_limit;
pub mod security_headers;
pub mod validation;

pub use rate_limit::{EndpointRateLimiter, RateLimiter};
