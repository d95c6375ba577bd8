use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::vehicles::{find_vehicle, images_for};
use crate::audit::{AuditAction, AuditEvent};
use crate::db::now_timestamp;
use crate::error::{AppError, AppResult, OptionExt};
use crate::middleware::ip::ClientIp;
use crate::middleware::validation::{optional_text, validate_uuid};
use crate::session::CurrentUser;
use crate::state::AppState;
use crate::storage::{image_extension, sniff_matches};
use crate::types::{MessageResponse, ReorderImagesRequest, VehicleImage};

struct Upload {
    bytes: Vec<u8>,
    content_type: String,
    alt_text: Option<String>,
    is_primary: bool,
}

async fn read_upload(mut multipart: Multipart, max_bytes: usize) -> AppResult<Upload> {
    let mut file: Option<(Vec<u8>, String)> = None;
    let mut alt_text = None;
    let mut is_primary = false;

    while let Some(field) =
        multipart.next_field().await.map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field.content_type().unwrap_or_default().to_ascii_lowercase();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?;
                if bytes.len() > max_bytes {
                    return Err(AppError::PayloadTooLarge(format!("Images may be at most {} bytes", max_bytes)));
                }
                file = Some((bytes.to_vec(), content_type));
            }
            "alt_text" => {
                let text = field.text().await.map_err(|e| AppError::BadRequest(e.to_string()))?;
                alt_text = optional_text(Some(&text), "alt_text", 200)?;
            }
            "is_primary" => {
                let text = field.text().await.map_err(|e| AppError::BadRequest(e.to_string()))?;
                is_primary = matches!(text.trim(), "true" | "1" | "on");
            }
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (bytes, content_type) =
        file.ok_or_else(|| AppError::ValidationError { field: "file".into(), message: "is required".into() })?;
    if bytes.is_empty() {
        return Err(AppError::ValidationError { field: "file".into(), message: "must not be empty".into() });
    }
    Ok(Upload { bytes, content_type, alt_text, is_primary })
}

async fn find_image(db: &SqlitePool, id: &str) -> AppResult<Option<VehicleImage>> {
    let image = sqlx::query_as::<_, VehicleImage>(
        r#"SELECT id, vehicle_id, storage_path, url, alt_text, position, is_primary, content_type, size_bytes, created_at
           FROM vehicle_images WHERE id = ?1"#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(image)
}

async fn require_live_vehicle(db: &SqlitePool, vehicle_id: &str) -> AppResult<()> {
    find_vehicle(db, vehicle_id)
        .await?
        .filter(|v| v.deleted_at.is_none())
        .ok_or_not_found("Vehicle")
        .map(|_| ())
}

pub async fn list_images(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> AppResult<Json<Vec<VehicleImage>>> {
    validate_uuid(&vehicle_id)?;
    find_vehicle(&state.db, &vehicle_id).await?.ok_or_not_found("Vehicle")?;
    Ok(Json(images_for(&state.db, &vehicle_id).await?))
}

/// Stores the upload, then records it. The first image of a vehicle always
/// becomes primary; `is_primary` moves the flag to the new image.
pub async fn upload_image(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(vehicle_id): Path<String>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<VehicleImage>)> {
    validate_uuid(&vehicle_id)?;
    require_live_vehicle(&state.db, &vehicle_id).await?;

    let upload = read_upload(multipart, state.config.storage.max_image_bytes).await?;
    let ext = image_extension(&upload.content_type).ok_or_else(|| AppError::ValidationError {
        field: "file".into(),
        message: "must be a JPEG, PNG or WebP image".into(),
    })?;
    if !sniff_matches(&upload.content_type, &upload.bytes) {
        return Err(AppError::ValidationError {
            field: "file".into(),
            message: "content does not match its declared image type".into(),
        });
    }

    let image_id = Uuid::new_v4().to_string();
    let key = format!("vehicles/{}/{}.{}", vehicle_id, image_id, ext);
    state.storage.put(&key, &upload.bytes).await?;
    let url = state.storage.public_url(&key);

    let inserted = insert_image(&state.db, &vehicle_id, &image_id, &key, &url, &upload).await;
    let image = match inserted {
        Ok(image) => image,
        Err(e) => {
            if let Err(del) = state.storage.delete(&key).await {
                tracing::warn!(key = %key, "Failed to remove orphaned upload: {}", del);
            }
            return Err(e);
        }
    };

    state.metrics.inc_images_uploaded();
    state
        .audit
        .record(
            AuditEvent::new(AuditAction::ImageUploaded)
                .actor(&user)
                .ip(ip)
                .target(&image_id)
                .details(serde_json::json!({ "vehicle_id": vehicle_id, "size_bytes": image.size_bytes })),
        )
        .await;

    Ok((StatusCode::CREATED, Json(image)))
}

async fn insert_image(
    db: &SqlitePool,
    vehicle_id: &str,
    image_id: &str,
    key: &str,
    url: &str,
    upload: &Upload,
) -> AppResult<VehicleImage> {
    let mut tx = db.begin().await?;

    let (next_position, primaries): (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(MAX(position) + 1, 0), COALESCE(SUM(is_primary), 0) FROM vehicle_images WHERE vehicle_id = ?1",
    )
    .bind(vehicle_id)
    .fetch_one(&mut *tx)
    .await?;

    let make_primary = upload.is_primary || primaries == 0;
    if make_primary {
        sqlx::query("UPDATE vehicle_images SET is_primary = 0 WHERE vehicle_id = ?1")
            .bind(vehicle_id)
            .execute(&mut *tx)
            .await?;
    }

    let image = sqlx::query_as::<_, VehicleImage>(
        r#"INSERT INTO vehicle_images (id, vehicle_id, storage_path, url, alt_text, position, is_primary, content_type, size_bytes, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
           RETURNING id, vehicle_id, storage_path, url, alt_text, position, is_primary, content_type, size_bytes, created_at"#,
    )
    .bind(image_id)
    .bind(vehicle_id)
    .bind(key)
    .bind(url)
    .bind(&upload.alt_text)
    .bind(next_position)
    .bind(make_primary)
    .bind(&upload.content_type)
    .bind(upload.bytes.len() as i64)
    .bind(now_timestamp())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(image)
}

/// Removes the image row and object; a deleted primary hands the flag to the
/// lowest-positioned remaining image.
pub async fn delete_image(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> AppResult<Json<MessageResponse>> {
    validate_uuid(&id)?;
    let image = find_image(&state.db, &id).await?.ok_or_not_found("Image")?;
    require_live_vehicle(&state.db, &image.vehicle_id).await?;

    let mut tx = state.db.begin().await?;
    sqlx::query("DELETE FROM vehicle_images WHERE id = ?1").bind(&id).execute(&mut *tx).await?;
    if image.is_primary {
        sqlx::query(
            r#"UPDATE vehicle_images SET is_primary = 1
               WHERE id = (SELECT id FROM vehicle_images WHERE vehicle_id = ?1 ORDER BY position ASC, created_at ASC LIMIT 1)"#,
        )
        .bind(&image.vehicle_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    if let Err(e) = state.storage.delete(&image.storage_path).await {
        tracing::warn!(key = %image.storage_path, "Failed to delete stored image: {}", e);
    }

    state
        .audit
        .record(
            AuditEvent::new(AuditAction::ImageDeleted)
                .actor(&user)
                .ip(ip)
                .target(&id)
                .details(serde_json::json!({ "vehicle_id": image.vehicle_id })),
        )
        .await;
    Ok(Json(MessageResponse::new("Image deleted")))
}

pub async fn set_primary(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<VehicleImage>>> {
    validate_uuid(&id)?;
    let image = find_image(&state.db, &id).await?.ok_or_not_found("Image")?;
    require_live_vehicle(&state.db, &image.vehicle_id).await?;

    let mut tx = state.db.begin().await?;
    sqlx::query("UPDATE vehicle_images SET is_primary = CASE WHEN id = ?2 THEN 1 ELSE 0 END WHERE vehicle_id = ?1")
        .bind(&image.vehicle_id)
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    state
        .audit
        .record(
            AuditEvent::new(AuditAction::ImagePrimarySet)
                .actor(&user)
                .ip(ip)
                .target(&id)
                .details(serde_json::json!({ "vehicle_id": image.vehicle_id })),
        )
        .await;
    Ok(Json(images_for(&state.db, &image.vehicle_id).await?))
}

/// `image_ids` must list every image of the vehicle exactly once.
pub async fn reorder_images(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(vehicle_id): Path<String>,
    Json(req): Json<ReorderImagesRequest>,
) -> AppResult<Json<Vec<VehicleImage>>> {
    validate_uuid(&vehicle_id)?;
    require_live_vehicle(&state.db, &vehicle_id).await?;

    let mut current: Vec<String> = images_for(&state.db, &vehicle_id).await?.into_iter().map(|i| i.id).collect();
    let mut requested = req.image_ids.clone();
    current.sort();
    requested.sort();
    if current != requested {
        return Err(AppError::ValidationError {
            field: "image_ids".into(),
            message: "must contain each image of the vehicle exactly once".into(),
        });
    }

    let mut tx = state.db.begin().await?;
    for (position, image_id) in req.image_ids.iter().enumerate() {
        sqlx::query("UPDATE vehicle_images SET position = ?1 WHERE id = ?2 AND vehicle_id = ?3")
            .bind(position as i64)
            .bind(image_id)
            .bind(&vehicle_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    state
        .audit
        .record(
            AuditEvent::new(AuditAction::ImagesReordered)
                .actor(&user)
                .ip(ip)
                .target(&vehicle_id)
                .details(serde_json::json!({ "image_ids": req.image_ids })),
        )
        .await;
    Ok(Json(images_for(&state.db, &vehicle_id).await?))
}
