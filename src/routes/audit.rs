use axum::{
    extract::{Query, State},
    Json,
};

use crate::audit::AuditEntry;
use crate::error::{AppError, AppResult};
use crate::session::{CurrentUser, Role};
use crate::state::AppState;
use crate::types::AuditQuery;

/// Recent audit entries, newest first. Admins only; editors get `403`.
pub async fn list_audit(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(q): Query<AuditQuery>,
) -> AppResult<Json<Vec<AuditEntry>>> {
    if user.role != Role::Admin {
        return Err(AppError::Forbidden("Only administrators may read the audit log".into()));
    }
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    Ok(Json(state.audit.recent(limit).await?))
}
