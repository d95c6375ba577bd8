use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::mailer::MailKind;
use super::{
    generate_token, hash_token, normalize_email, AuthError, IdentityProvider, Mailer, OutgoingMail, Session,
    UserRecord,
};
use crate::config::AuthConfig;
use crate::session::{CurrentUser, Role};

const PURPOSE_VERIFY: &str = "email_verification";
const PURPOSE_RESET: &str = "password_reset";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    password_hash: String,
    full_name: Option<String>,
    role: String,
    is_active: bool,
    email_verified_at: Option<String>,
}

impl UserRow {
    fn record(&self) -> UserRecord {
        UserRecord {
            id: self.id.clone(),
            email: self.email.clone(),
            full_name: self.full_name.clone(),
            role: Role::parse(&self.role).unwrap_or(Role::User),
            is_active: self.is_active,
            email_verified: self.email_verified_at.is_some(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionUserRow {
    session_id: String,
    user_id: String,
    email: String,
    full_name: Option<String>,
    role: String,
}

impl SessionUserRow {
    fn into_current_user(self) -> CurrentUser {
        CurrentUser {
            user_id: self.user_id,
            session_id: self.session_id,
            email: self.email,
            full_name: self.full_name,
            role: Role::parse(&self.role).unwrap_or(Role::User),
        }
    }
}

/// Identity provider backed by the application's SQLite database.
#[derive(Clone)]
pub struct SqliteIdentityProvider {
    db: SqlitePool,
    cfg: AuthConfig,
    mailer: Arc<dyn Mailer>,
}

impl SqliteIdentityProvider {
    pub fn new(db: SqlitePool, cfg: AuthConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self { db, cfg, mailer }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRow>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, full_name, role, is_active, email_verified_at FROM users WHERE email = ?1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<UserRow, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, email, password_hash, full_name, role, is_active, email_verified_at FROM users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.ok_or(AuthError::InvalidToken)
    }

    async fn insert_session(
        &self,
        conn: &mut SqliteConnection,
        user: &UserRow,
        rotated_from: Option<&str>,
    ) -> Result<Session, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let session_id = Uuid::new_v4().to_string();
        let access_token = generate_token();
        let refresh_token = generate_token();

        sqlx::query(
            r#"INSERT INTO sessions (id, user_id, access_token_hash, refresh_token_hash, access_expires_at, refresh_expires_at, rotated_from)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        )
        .bind(&session_id)
        .bind(&user.id)
        .bind(hash_token(&access_token))
        .bind(hash_token(&refresh_token))
        .bind(now + self.cfg.access_token_ttl_secs)
        .bind(now + self.cfg.refresh_token_ttl_secs)
        .bind(rotated_from)
        .execute(&mut *conn)
        .await?;

        Ok(Session {
            session_id,
            access_token,
            refresh_token,
            access_expires_in: self.cfg.access_token_ttl_secs,
            refresh_expires_in: self.cfg.refresh_token_ttl_secs,
            user: user.record(),
            rotated_from: rotated_from.map(str::to_string),
        })
    }

    /// Stores a one-time token, invalidating earlier unused tokens of the same purpose.
    async fn issue_one_time_token(&self, user_id: &str, purpose: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let token = generate_token();
        let expires_at = chrono::Utc::now().timestamp() + ttl_secs;
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM auth_tokens WHERE user_id = ?1 AND purpose = ?2 AND used_at IS NULL")
            .bind(user_id)
            .bind(purpose)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO auth_tokens (token_hash, user_id, purpose, expires_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(hash_token(&token))
            .bind(user_id)
            .bind(purpose)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(token)
    }

    /// Marks a token used and returns its user; fails for unknown, used or expired tokens.
    async fn consume_one_time_token(
        &self,
        conn: &mut SqliteConnection,
        token: &str,
        purpose: &str,
    ) -> Result<String, AuthError> {
        let user_id: Option<String> = sqlx::query_scalar(
            r#"UPDATE auth_tokens SET used_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
               WHERE token_hash = ?1 AND purpose = ?2 AND used_at IS NULL AND expires_at > ?3
               RETURNING user_id"#,
        )
        .bind(hash_token(token))
        .bind(purpose)
        .bind(chrono::Utc::now().timestamp())
        .fetch_optional(&mut *conn)
        .await?;
        user_id.ok_or(AuthError::InvalidToken)
    }

    async fn send_verification(&self, user: &UserRow) -> Result<(), AuthError> {
        let token = self.issue_one_time_token(&user.id, PURPOSE_VERIFY, self.cfg.verification_token_ttl_secs).await?;
        let link = format!("{}/auth/verify-email?token={}", self.cfg.site_url.trim_end_matches('/'), token);
        self.mailer.send(OutgoingMail { to: user.email.clone(), kind: MailKind::EmailVerification, link, token }).await
    }
}

async fn hash_password(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AuthError::Hashing(e.to_string()))
    })
    .await
    .map_err(|e| AuthError::Hashing(e.to_string()))?
}

async fn verify_password(password: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash).map_err(|e| AuthError::Hashing(e.to_string()))?;
        Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
    })
    .await
    .map_err(|e| AuthError::Hashing(e.to_string()))?
}

#[async_trait]
impl IdentityProvider for SqliteIdentityProvider {
    async fn sign_up(&self, email: &str, password: &str, full_name: Option<&str>) -> Result<UserRecord, AuthError> {
        let email = normalize_email(email);
        if self.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let hash = hash_password(password.to_string()).await?;
        let id = Uuid::new_v4().to_string();
        let verified_now = !self.cfg.require_email_verification;
        let inserted = sqlx::query(
            r#"INSERT INTO users (id, email, password_hash, full_name, role, email_verified_at)
               VALUES (?1, ?2, ?3, ?4, 'user', CASE WHEN ?5 THEN strftime('%Y-%m-%dT%H:%M:%SZ','now') ELSE NULL END)"#,
        )
        .bind(&id)
        .bind(&email)
        .bind(&hash)
        .bind(full_name.map(str::trim).filter(|s| !s.is_empty()))
        .bind(verified_now)
        .execute(&self.db)
        .await;
        match inserted {
            Ok(_) => {}
            // Lost a race against a concurrent signup for the same address
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => return Err(AuthError::EmailTaken),
            Err(e) => return Err(e.into()),
        }

        let user = self.find_user_by_id(&id).await?;
        if self.cfg.require_email_verification {
            self.send_verification(&user).await?;
        }
        tracing::info!(user_id = %user.id, "user signed up");
        Ok(user.record())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let user = match self.find_user_by_email(email).await? {
            Some(u) => u,
            None => {
                // Spend the same hashing effort as a real check
                let _ = hash_password(password.to_string()).await;
                return Err(AuthError::InvalidCredentials);
            }
        };
        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::AccountInactive);
        }
        if self.cfg.require_email_verification && user.email_verified_at.is_none() {
            return Err(AuthError::EmailNotVerified);
        }

        let mut tx = self.db.begin().await?;
        let session = self.insert_session(&mut tx, &user, None).await?;
        sqlx::query("UPDATE users SET last_login_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1")
            .bind(&user.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn verify_access_token(&self, token: &str) -> Result<Option<CurrentUser>, AuthError> {
        let row = sqlx::query_as::<_, SessionUserRow>(
            r#"SELECT s.id AS session_id, u.id AS user_id, u.email, u.full_name, u.role
               FROM sessions s JOIN users u ON u.id = s.user_id
               WHERE s.access_token_hash = ?1 AND s.revoked_at IS NULL AND s.access_expires_at > ?2 AND u.is_active = 1"#,
        )
        .bind(hash_token(token))
        .bind(chrono::Utc::now().timestamp())
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(SessionUserRow::into_current_user))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let found: Option<(String, String)> = sqlx::query_as(
            r#"SELECT s.id, s.user_id FROM sessions s JOIN users u ON u.id = s.user_id
               WHERE s.refresh_token_hash = ?1 AND s.revoked_at IS NULL AND s.refresh_expires_at > ?2 AND u.is_active = 1"#,
        )
        .bind(hash_token(refresh_token))
        .bind(chrono::Utc::now().timestamp())
        .fetch_optional(&self.db)
        .await?;
        let (old_session, user_id) = found.ok_or(AuthError::SessionExpired)?;
        let user = self.find_user_by_id(&user_id).await?;

        // Revocation and replacement commit together
        let mut tx = self.db.begin().await?;
        // Only one concurrent refresh may win the rotation
        let revoked = sqlx::query(
            "UPDATE sessions SET revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1 AND revoked_at IS NULL",
        )
        .bind(&old_session)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if revoked != 1 {
            return Err(AuthError::SessionExpired);
        }

        let session = self.insert_session(&mut tx, &user, Some(&old_session)).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn rotated_successor(&self, refresh_token: &str) -> Result<Option<CurrentUser>, AuthError> {
        if self.cfg.refresh_reuse_grace_secs <= 0 {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, SessionUserRow>(
            r#"SELECT n.id AS session_id, u.id AS user_id, u.email, u.full_name, u.role
               FROM sessions o
               JOIN sessions n ON n.rotated_from = o.id
               JOIN users u ON u.id = n.user_id
               WHERE o.refresh_token_hash = ?1
                 AND o.revoked_at > strftime('%Y-%m-%dT%H:%M:%SZ','now', ?2)
                 AND n.revoked_at IS NULL AND n.access_expires_at > ?3 AND u.is_active = 1"#,
        )
        .bind(hash_token(refresh_token))
        .bind(format!("-{} seconds", self.cfg.refresh_reuse_grace_secs))
        .bind(chrono::Utc::now().timestamp())
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(SessionUserRow::into_current_user))
    }

    async fn sign_out(&self, session_id: &str) -> Result<(), AuthError> {
        sqlx::query(
            "UPDATE sessions SET revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1 AND revoked_at IS NULL",
        )
        .bind(session_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let user = match self.find_user_by_email(email).await? {
            Some(u) if u.is_active => u,
            _ => {
                tracing::debug!("password reset requested for unknown or inactive account");
                return Ok(());
            }
        };
        let token = self.issue_one_time_token(&user.id, PURPOSE_RESET, self.cfg.reset_token_ttl_secs).await?;
        let link = format!("{}/auth/reset-password?token={}", self.cfg.site_url.trim_end_matches('/'), token);
        self.mailer.send(OutgoingMail { to: user.email, kind: MailKind::PasswordReset, link, token }).await
    }

    async fn reset_password(&self, token: &str, new_password: &str) -> Result<UserRecord, AuthError> {
        // Hash first: a failure here must not burn the link
        let hash = hash_password(new_password.to_string()).await?;

        let mut tx = self.db.begin().await?;
        let user_id = self.consume_one_time_token(&mut tx, token, PURPOSE_RESET).await?;
        sqlx::query(
            r#"UPDATE users SET password_hash = ?1,
                   email_verified_at = COALESCE(email_verified_at, strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                   updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
               WHERE id = ?2"#,
        )
        .bind(&hash)
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE sessions SET revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE user_id = ?1 AND revoked_at IS NULL",
        )
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(self.find_user_by_id(&user_id).await?.record())
    }

    async fn resend_verification(&self, email: &str) -> Result<(), AuthError> {
        match self.find_user_by_email(email).await? {
            Some(user) if user.email_verified_at.is_none() && user.is_active => self.send_verification(&user).await,
            _ => Ok(()),
        }
    }

    async fn verify_email(&self, token: &str) -> Result<UserRecord, AuthError> {
        let mut tx = self.db.begin().await?;
        let user_id = self.consume_one_time_token(&mut tx, token, PURPOSE_VERIFY).await?;
        sqlx::query(
            r#"UPDATE users SET email_verified_at = COALESCE(email_verified_at, strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                   updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
               WHERE id = ?1"#,
        )
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(self.find_user_by_id(&user_id).await?.record())
    }

    async fn ensure_admin(&self, email: &str, password: &str) -> Result<bool, AuthError> {
        let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
            .fetch_one(&self.db)
            .await?;
        if admins > 0 {
            return Ok(false);
        }

        let hash = hash_password(password.to_string()).await?;
        let email = normalize_email(email);
        sqlx::query(
            r#"INSERT INTO users (id, email, password_hash, role, is_active, email_verified_at)
               VALUES (?1, ?2, ?3, 'admin', 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
               ON CONFLICT(email) DO UPDATE SET password_hash = excluded.password_hash, role = 'admin', is_active = 1,
                   email_verified_at = COALESCE(users.email_verified_at, excluded.email_verified_at)"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&email)
        .bind(&hash)
        .execute(&self.db)
        .await?;
        tracing::info!(email = %email, "bootstrap admin account ensured");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::identity::mailer::testing::CapturingMailer;
    use crate::test_support::memory_pool;

    async fn provider(require_verification: bool) -> (SqliteIdentityProvider, CapturingMailer, SqlitePool) {
        let pool = memory_pool().await;
        let mut cfg = AppConfig::default().auth;
        cfg.require_email_verification = require_verification;
        let mailer = CapturingMailer::default();
        (SqliteIdentityProvider::new(pool.clone(), cfg, Arc::new(mailer.clone())), mailer, pool)
    }

    const PW: &str = "Garage#Keys42";

    #[tokio::test]
    async fn signup_then_verify_then_login() {
        let (idp, mailer, _) = provider(true).await;
        let user = idp.sign_up("Buyer@Example.com", PW, Some("Ana Buyer")).await.unwrap();
        assert_eq!(user.email, "buyer@example.com");
        assert_eq!(user.role, Role::User);
        assert!(!user.email_verified);

        assert!(matches!(idp.sign_in("buyer@example.com", PW).await, Err(AuthError::EmailNotVerified)));

        let token = mailer.last_token(MailKind::EmailVerification).unwrap();
        let verified = idp.verify_email(&token).await.unwrap();
        assert!(verified.email_verified);
        // Single use
        assert!(matches!(idp.verify_email(&token).await, Err(AuthError::InvalidToken)));

        let session = idp.sign_in("BUYER@example.com", PW).await.unwrap();
        let caller = idp.verify_access_token(&session.access_token).await.unwrap().unwrap();
        assert_eq!(caller.session_id, session.session_id);
        assert_eq!(caller.email, "buyer@example.com");
    }

    #[tokio::test]
    async fn duplicate_signup_is_rejected() {
        let (idp, _, _) = provider(false).await;
        idp.sign_up("dup@example.com", PW, None).await.unwrap();
        assert!(matches!(idp.sign_up(" DUP@example.com", PW, None).await, Err(AuthError::EmailTaken)));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let (idp, _, _) = provider(false).await;
        idp.sign_up("a@example.com", PW, None).await.unwrap();
        assert!(matches!(idp.sign_in("a@example.com", "Wrong#Pass1").await, Err(AuthError::InvalidCredentials)));
        assert!(matches!(idp.sign_in("nobody@example.com", PW).await, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn inactive_accounts_cannot_sign_in() {
        let (idp, _, pool) = provider(false).await;
        idp.sign_up("gone@example.com", PW, None).await.unwrap();
        sqlx::query("UPDATE users SET is_active = 0").execute(&pool).await.unwrap();
        assert!(matches!(idp.sign_in("gone@example.com", PW).await, Err(AuthError::AccountInactive)));
    }

    #[tokio::test]
    async fn sign_out_revokes_access_token() {
        let (idp, _, _) = provider(false).await;
        idp.sign_up("s@example.com", PW, None).await.unwrap();
        let session = idp.sign_in("s@example.com", PW).await.unwrap();
        idp.sign_out(&session.session_id).await.unwrap();
        assert!(idp.verify_access_token(&session.access_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_rotates_tokens_once() {
        let (idp, _, _) = provider(false).await;
        idp.sign_up("r@example.com", PW, None).await.unwrap();
        let first = idp.sign_in("r@example.com", PW).await.unwrap();

        let second = idp.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(second.rotated_from.as_deref(), Some(first.session_id.as_str()));
        assert!(idp.verify_access_token(&first.access_token).await.unwrap().is_none());
        assert!(idp.verify_access_token(&second.access_token).await.unwrap().is_some());
        assert!(matches!(idp.refresh(&first.refresh_token).await, Err(AuthError::SessionExpired)));
    }

    #[tokio::test]
    async fn failed_rotation_keeps_the_old_session() {
        let (idp, _, pool) = provider(false).await;
        idp.sign_up("f@example.com", PW, None).await.unwrap();
        let first = idp.sign_in("f@example.com", PW).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER block_rotation BEFORE INSERT ON sessions WHEN NEW.rotated_from IS NOT NULL
             BEGIN SELECT RAISE(ABORT, 'rotation blocked'); END",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(matches!(idp.refresh(&first.refresh_token).await, Err(AuthError::Database(_))));
        // Revocation rolled back with the failed insert
        assert!(idp.verify_access_token(&first.access_token).await.unwrap().is_some());

        sqlx::query("DROP TRIGGER block_rotation").execute(&pool).await.unwrap();
        assert!(idp.refresh(&first.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn recently_rotated_refresh_token_resolves_to_successor() {
        let (idp, _, _) = provider(false).await;
        idp.sign_up("g@example.com", PW, None).await.unwrap();
        let first = idp.sign_in("g@example.com", PW).await.unwrap();
        assert!(idp.rotated_successor(&first.refresh_token).await.unwrap().is_none());

        let second = idp.refresh(&first.refresh_token).await.unwrap();
        let caller = idp.rotated_successor(&first.refresh_token).await.unwrap().unwrap();
        assert_eq!(caller.session_id, second.session_id);
        assert_eq!(caller.email, "g@example.com");

        // Logging out of the successor closes the grace path too
        idp.sign_out(&second.session_id).await.unwrap();
        assert!(idp.rotated_successor(&first.refresh_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotation_grace_expires() {
        let (idp, _, pool) = provider(false).await;
        idp.sign_up("h@example.com", PW, None).await.unwrap();
        let first = idp.sign_in("h@example.com", PW).await.unwrap();
        idp.refresh(&first.refresh_token).await.unwrap();

        sqlx::query("UPDATE sessions SET revoked_at = '2024-01-01T00:00:00Z' WHERE id = ?1")
            .bind(&first.session_id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(idp.rotated_successor(&first.refresh_token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_access_token_is_rejected() {
        let (idp, _, pool) = provider(false).await;
        idp.sign_up("e@example.com", PW, None).await.unwrap();
        let session = idp.sign_in("e@example.com", PW).await.unwrap();
        sqlx::query("UPDATE sessions SET access_expires_at = 0").execute(&pool).await.unwrap();
        assert!(idp.verify_access_token(&session.access_token).await.unwrap().is_none());
        // The refresh token still works
        assert!(idp.refresh(&session.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn password_reset_flow_revokes_sessions() {
        let (idp, mailer, _) = provider(false).await;
        idp.sign_up("p@example.com", PW, None).await.unwrap();
        let session = idp.sign_in("p@example.com", PW).await.unwrap();

        idp.request_password_reset("nobody@example.com").await.unwrap();
        assert!(mailer.last_token(MailKind::PasswordReset).is_none());

        idp.request_password_reset("p@example.com").await.unwrap();
        let token = mailer.last_token(MailKind::PasswordReset).unwrap();
        idp.reset_password(&token, "Fresh#Start99").await.unwrap();

        assert!(idp.verify_access_token(&session.access_token).await.unwrap().is_none());
        assert!(matches!(idp.sign_in("p@example.com", PW).await, Err(AuthError::InvalidCredentials)));
        assert!(idp.sign_in("p@example.com", "Fresh#Start99").await.is_ok());
        assert!(matches!(idp.reset_password(&token, "Again#Pass77").await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn failed_reset_does_not_burn_the_link() {
        let (idp, mailer, pool) = provider(false).await;
        idp.sign_up("q@example.com", PW, None).await.unwrap();
        let session = idp.sign_in("q@example.com", PW).await.unwrap();
        idp.request_password_reset("q@example.com").await.unwrap();
        let token = mailer.last_token(MailKind::PasswordReset).unwrap();

        sqlx::query(
            "CREATE TRIGGER block_password BEFORE UPDATE OF password_hash ON users
             BEGIN SELECT RAISE(ABORT, 'password update blocked'); END",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(idp.reset_password(&token, "Fresh#Start99").await.is_err());
        assert!(idp.verify_access_token(&session.access_token).await.unwrap().is_some());

        sqlx::query("DROP TRIGGER block_password").execute(&pool).await.unwrap();
        idp.reset_password(&token, "Fresh#Start99").await.unwrap();
        assert!(idp.sign_in("q@example.com", "Fresh#Start99").await.is_ok());
    }

    #[tokio::test]
    async fn newer_reset_token_invalidates_older_one() {
        let (idp, mailer, _) = provider(false).await;
        idp.sign_up("t@example.com", PW, None).await.unwrap();
        idp.request_password_reset("t@example.com").await.unwrap();
        let old = mailer.last_token(MailKind::PasswordReset).unwrap();
        idp.request_password_reset("t@example.com").await.unwrap();
        assert!(matches!(idp.reset_password(&old, "Fresh#Start99").await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn resend_verification_only_for_unverified() {
        let (idp, mailer, _) = provider(true).await;
        idp.sign_up("v@example.com", PW, None).await.unwrap();
        assert_eq!(mailer.count(), 1);
        idp.resend_verification("v@example.com").await.unwrap();
        assert_eq!(mailer.count(), 2);

        let token = mailer.last_token(MailKind::EmailVerification).unwrap();
        idp.verify_email(&token).await.unwrap();
        idp.resend_verification("v@example.com").await.unwrap();
        idp.resend_verification("nobody@example.com").await.unwrap();
        assert_eq!(mailer.count(), 2);
    }

    #[tokio::test]
    async fn ensure_admin_runs_once() {
        let (idp, _, _) = provider(true).await;
        assert!(idp.ensure_admin("owner@mikki.example", PW).await.unwrap());
        assert!(!idp.ensure_admin("other@mikki.example", PW).await.unwrap());
        let session = idp.sign_in("owner@mikki.example", PW).await.unwrap();
        assert_eq!(session.user.role, Role::Admin);
    }
}
