use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use super::vehicles::find_vehicle;
use crate::audit::{AuditAction, AuditEvent};
use crate::db::now_timestamp;
use crate::error::{AppError, AppResult, OptionExt};
use crate::middleware::ip::ClientIp;
use crate::middleware::rate_limit::buckets;
use crate::middleware::validation::{optional_text, required_text, validate_email, validate_uuid};
use crate::session::CurrentUser;
use crate::state::AppState;
use crate::types::{CreateInquiryRequest, Inquiry, InquiryQuery, InquiryStatus, UpdateInquiryRequest, VehicleStatus};

const INQUIRY_COLUMNS: &str = "id, vehicle_id, name, email, phone, message, status, created_at, updated_at";

/// Public contact form, limited per client address.
pub async fn create_inquiry(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateInquiryRequest>,
) -> AppResult<(StatusCode, Json<Inquiry>)> {
    if let Err(e) = state.rate_limiter.check(buckets::INQUIRY, &ip.to_string()).await {
        state.metrics.inc_rate_limited();
        return Err(e);
    }

    let name = required_text(&req.name, "name", 100)?;
    let email = validate_email(&req.email)?;
    let phone = optional_text(req.phone.as_deref(), "phone", 40)?;
    let message = required_text(&req.message, "message", 5000)?;
    let vehicle_id = match req.vehicle_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => {
            validate_uuid(id)?;
            find_vehicle(&state.db, id)
                .await?
                .filter(|v| v.deleted_at.is_none() && v.status != VehicleStatus::Draft.as_str())
                .ok_or_not_found("Vehicle")?;
            Some(id.to_string())
        }
        None => None,
    };

    let now = now_timestamp();
    let inquiry = sqlx::query_as::<_, Inquiry>(&format!(
        r#"INSERT INTO inquiries (id, vehicle_id, name, email, phone, message, status, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'new', ?7, ?7)
           RETURNING {}"#,
        INQUIRY_COLUMNS
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&vehicle_id)
    .bind(&name)
    .bind(&email)
    .bind(&phone)
    .bind(&message)
    .bind(&now)
    .fetch_one(&state.db)
    .await?;

    state.metrics.inc_inquiries_received();
    tracing::info!(inquiry_id = %inquiry.id, vehicle_id = ?inquiry.vehicle_id, "inquiry received");
    Ok((StatusCode::CREATED, Json(inquiry)))
}

pub async fn list_inquiries(
    State(state): State<AppState>,
    Query(q): Query<InquiryQuery>,
) -> AppResult<Json<Vec<Inquiry>>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    let status = match q.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(
            InquiryStatus::parse(s)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown inquiry status '{}'", s)))?
                .as_str(),
        ),
        None => None,
    };

    let items = sqlx::query_as::<_, Inquiry>(&format!(
        "SELECT {} FROM inquiries WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        INQUIRY_COLUMNS
    ))
    .bind(status)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(items))
}

pub async fn update_inquiry(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<UpdateInquiryRequest>,
) -> AppResult<Json<Inquiry>> {
    validate_uuid(&id)?;
    let status = InquiryStatus::parse(req.status.trim()).ok_or_else(|| AppError::ValidationError {
        field: "status".into(),
        message: "must be one of new, contacted, closed".into(),
    })?;

    let inquiry = sqlx::query_as::<_, Inquiry>(&format!(
        "UPDATE inquiries SET status = ?2, updated_at = ?3 WHERE id = ?1 RETURNING {}",
        INQUIRY_COLUMNS
    ))
    .bind(&id)
    .bind(status.as_str())
    .bind(now_timestamp())
    .fetch_optional(&state.db)
    .await?
    .ok_or_not_found("Inquiry")?;

    state
        .audit
        .record(
            AuditEvent::new(AuditAction::InquiryUpdated)
                .actor(&user)
                .ip(ip)
                .target(&id)
                .details(serde_json::json!({ "status": status.as_str() })),
        )
        .await;
    Ok(Json(inquiry))
}
