//! Identity provider seam.
//!
//! Everything the back office needs from an identity service (credential
//! checks, session issuance, token verification, one-time tokens for email
//! verification and password reset) goes through [`IdentityProvider`].
//! [`sqlite::SqliteIdentityProvider`] is the shipped implementation.

pub mod mailer;
pub mod sqlite;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::session::{CurrentUser, Role};

pub use mailer::{LogMailer, Mailer, OutgoingMail};
pub use sqlite::SqliteIdentityProvider;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("This account has been deactivated")]
    AccountInactive,
    #[error("Please verify your email address before signing in")]
    EmailNotVerified,
    #[error("An account with this email already exists")]
    EmailTaken,
    #[error("The link is invalid or has expired")]
    InvalidToken,
    #[error("Session expired, please sign in again")]
    SessionExpired,
    #[error("password hashing failed: {0}")]
    Hashing(String),
    #[error("mail delivery failed: {0}")]
    Mail(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
}

/// A freshly issued session. Raw tokens only exist here; storage keeps digests.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_in: i64,
    pub refresh_expires_in: i64,
    pub user: UserRecord,
    /// Session this one replaced, when issued by a refresh.
    pub rotated_from: Option<String>,
}

impl Session {
    pub fn current_user(&self) -> CurrentUser {
        CurrentUser {
            user_id: self.user.id.clone(),
            session_id: self.session_id.clone(),
            email: self.user.email.clone(),
            full_name: self.user.full_name.clone(),
            role: self.user.role,
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> Result<UserRecord, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    /// Resolves an access token to its caller; `None` for unknown, expired or revoked tokens.
    async fn verify_access_token(&self, token: &str) -> Result<Option<CurrentUser>, AuthError>;

    /// Exchanges a refresh token for a new session; the old session is revoked.
    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError>;

    /// Caller of the live session that replaced `refresh_token`'s session, as long as
    /// the rotation happened within `auth.refresh_reuse_grace_secs`.
    ///
    /// Lets parallel requests that still carry the pre-rotation cookies through
    /// without issuing a second rotation.
    async fn rotated_successor(&self, refresh_token: &str) -> Result<Option<CurrentUser>, AuthError>;

    async fn sign_out(&self, session_id: &str) -> Result<(), AuthError>;

    /// Sends a reset link when the account exists; silent otherwise.
    async fn request_password_reset(&self, email: &str) -> Result<(), AuthError>;

    /// Consumes a reset token, sets the new password and revokes all sessions of the user.
    async fn reset_password(&self, token: &str, new_password: &str) -> Result<UserRecord, AuthError>;

    async fn resend_verification(&self, email: &str) -> Result<(), AuthError>;

    async fn verify_email(&self, token: &str) -> Result<UserRecord, AuthError>;

    /// Creates an active, verified admin when no admin exists yet.
    async fn ensure_admin(&self, email: &str, password: &str) -> Result<bool, AuthError>;
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest used to store tokens at rest.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
