//! # Mikki Trade Motors Backend Library
//!
//! The back office and public catalog API of a vehicle dealership: listings
//! with images, customer inquiries, dashboard statistics and the
//! authentication flow guarding the admin area.
//!
//! ## Architecture
//!
//! The application is built using:
//! - **Axum**: HTTP server, routing and middleware
//! - **SQLx**: Asynchronous database operations with SQLite
//! - **Tokio**: Async runtime and background sweepers
//! - **Serde**: Serialization/deserialization for JSON APIs
//!
//! ## Core Components
//!
//! - [`config`]: Application configuration management
//! - [`db`]: Database schema initialization
//! - [`error`]: Centralized error handling and HTTP error responses
//! - [`identity`]: Identity provider seam (accounts, sessions, one-time tokens)
//! - [`middleware`]: Session gate, CSRF, rate limiting, validation and security headers
//! - [`password`]: Password policy and strength scoring
//! - [`routes`]: HTTP API endpoint handlers
//! - [`session`]: Session cookies, the caller extractor and the idle tracker
//! - [`storage`]: Object storage for vehicle images
//! - [`audit`]: Audit trail of security-relevant actions
//! - [`state`]: Shared application state
//! - [`types`]: Data transfer objects and shared type definitions

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod password;
pub mod routes;
pub mod session;
pub mod state;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;
