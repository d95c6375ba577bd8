use axum::{extract::State, Json};

use crate::error::AppResult;
use crate::state::AppState;
use crate::types::{DashboardStats, InquiryCounts, StatusCounts, Vehicle};

const RECENT_LIMIT: i64 = 5;

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<DashboardStats>> {
    let db = &state.db;

    let (total, featured, deleted): (i64, i64, i64) = sqlx::query_as(
        r#"SELECT
               COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN deleted_at IS NULL AND featured = 1 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0)
           FROM vehicles"#,
    )
    .fetch_one(db)
    .await?;

    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM vehicles WHERE deleted_at IS NULL GROUP BY status")
            .fetch_all(db)
            .await?;
    let mut by_status = StatusCounts::default();
    for (status, count) in rows {
        match status.as_str() {
            "draft" => by_status.draft = count,
            "available" => by_status.available = count,
            "reserved" => by_status.reserved = count,
            "sold" => by_status.sold = count,
            other => tracing::warn!("Unexpected vehicle status in catalog: {}", other),
        }
    }

    let average_price: Option<f64> =
        sqlx::query_scalar("SELECT AVG(price) FROM vehicles WHERE deleted_at IS NULL AND status = 'available'")
            .fetch_one(db)
            .await?;

    let (inquiries_total, inquiries_new): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'new' THEN 1 ELSE 0 END), 0) FROM inquiries",
    )
    .fetch_one(db)
    .await?;

    let recent_vehicles = sqlx::query_as::<_, Vehicle>(
        r#"SELECT id, make, model, year, price, mileage, fuel_type, transmission, body_type, color, condition, status,
                  featured, vin, description, created_by, created_at, updated_at, deleted_at
           FROM vehicles WHERE deleted_at IS NULL ORDER BY created_at DESC, rowid DESC LIMIT ?1"#,
    )
    .bind(RECENT_LIMIT)
    .fetch_all(db)
    .await?;

    Ok(Json(DashboardStats {
        total_vehicles: total,
        by_status,
        featured,
        deleted,
        average_price,
        inquiries: InquiryCounts { total: inquiries_total, new: inquiries_new },
        recent_vehicles,
    }))
}
