//! Audit trail for security-relevant actions.
//!
//! Every event is emitted on the `audit` tracing target and, best effort,
//! persisted to the `audit_log` table.

use serde::Serialize;
use sqlx::SqlitePool;
use std::net::IpAddr;

use crate::session::CurrentUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LoginSucceeded,
    LoginFailed,
    LoginRateLimited,
    LoginRoleDenied,
    Logout,
    SessionIdleExpired,
    SignUp,
    PasswordResetRequested,
    PasswordResetCompleted,
    EmailVerified,
    VehicleCreated,
    VehicleUpdated,
    VehicleDeleted,
    VehicleRestored,
    ImageUploaded,
    ImageDeleted,
    ImagePrimarySet,
    ImagesReordered,
    InquiryUpdated,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::LoginSucceeded => "login_succeeded",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::LoginRateLimited => "login_rate_limited",
            AuditAction::LoginRoleDenied => "login_role_denied",
            AuditAction::Logout => "logout",
            AuditAction::SessionIdleExpired => "session_idle_expired",
            AuditAction::SignUp => "sign_up",
            AuditAction::PasswordResetRequested => "password_reset_requested",
            AuditAction::PasswordResetCompleted => "password_reset_completed",
            AuditAction::EmailVerified => "email_verified",
            AuditAction::VehicleCreated => "vehicle_created",
            AuditAction::VehicleUpdated => "vehicle_updated",
            AuditAction::VehicleDeleted => "vehicle_deleted",
            AuditAction::VehicleRestored => "vehicle_restored",
            AuditAction::ImageUploaded => "image_uploaded",
            AuditAction::ImageDeleted => "image_deleted",
            AuditAction::ImagePrimarySet => "image_primary_set",
            AuditAction::ImagesReordered => "images_reordered",
            AuditAction::InquiryUpdated => "inquiry_updated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub actor_id: Option<String>,
    pub actor_email: Option<String>,
    pub ip: Option<IpAddr>,
    pub target: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction) -> Self {
        Self { action, actor_id: None, actor_email: None, ip: None, target: None, details: None }
    }

    pub fn actor(mut self, user: &CurrentUser) -> Self {
        self.actor_id = Some(user.user_id.clone());
        self.actor_email = Some(user.email.clone());
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        self.actor_email = Some(email.to_string());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub event: String,
    pub actor_id: Option<String>,
    pub actor_email: Option<String>,
    pub ip: Option<String>,
    pub target: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct AuditLogger {
    db: SqlitePool,
}

impl AuditLogger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Logs the event; a failed insert is logged and otherwise ignored.
    pub async fn record(&self, event: AuditEvent) {
        let ip = event.ip.map(|ip| ip.to_string());
        let details = event.details.as_ref().map(|d| d.to_string());
        tracing::info!(
            target: "audit",
            event = event.action.as_str(),
            actor_id = event.actor_id.as_deref().unwrap_or("-"),
            actor_email = event.actor_email.as_deref().unwrap_or("-"),
            ip = ip.as_deref().unwrap_or("-"),
            target_id = event.target.as_deref().unwrap_or("-"),
            "audit"
        );

        let res = sqlx::query(
            "INSERT INTO audit_log (event, actor_id, actor_email, ip, target, details) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(event.action.as_str())
        .bind(&event.actor_id)
        .bind(&event.actor_email)
        .bind(&ip)
        .bind(&event.target)
        .bind(&details)
        .execute(&self.db)
        .await;
        if let Err(e) = res {
            tracing::warn!("Failed to persist audit event {}: {}", event.action.as_str(), e);
        }
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
        sqlx::query_as::<_, AuditEntry>(
            "SELECT id, event, actor_id, actor_email, ip, target, details, created_at FROM audit_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }
}
