use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Datelike;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent};
use crate::db::now_timestamp;
use crate::error::{AppError, AppResult, OptionExt};
use crate::middleware::ip::ClientIp;
use crate::middleware::validation::{optional_text, required_text, validate_uuid, validate_vin};
use crate::session::CurrentUser;
use crate::state::AppState;
use crate::types::{
    CreateVehicleRequest, MakeCount, MessageResponse, Page, UpdateVehicleRequest, Vehicle, VehicleCondition,
    VehicleDetail, VehicleImage, VehicleListItem, VehicleQuery, VehicleStatus,
};

pub const MIN_YEAR: i64 = 1900;
pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;
pub const MAX_PAGE: i64 = 100_000;

const VEHICLE_COLUMNS: &str = "id, make, model, year, price, mileage, fuel_type, transmission, body_type, color, \
     condition, status, featured, vin, description, created_by, created_at, updated_at, deleted_at";

const PRIMARY_IMAGE_URL: &str = "(SELECT i.url FROM vehicle_images i WHERE i.vehicle_id = v.id AND i.is_primary = 1 \
     LIMIT 1) AS primary_image_url";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Published, not deleted.
    Public,
    Admin { include_deleted: bool },
}

fn like_pattern(raw: &str) -> String {
    let escaped = raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{}%", escaped)
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, q: &VehicleQuery, scope: Scope) -> AppResult<()> {
    match scope {
        Scope::Public => {
            qb.push(" AND v.deleted_at IS NULL AND v.status <> 'draft'");
        }
        Scope::Admin { include_deleted: false } => {
            qb.push(" AND v.deleted_at IS NULL");
        }
        Scope::Admin { include_deleted: true } => {}
    }

    if let Some(status) = non_blank(&q.status) {
        let parsed = VehicleStatus::parse(&status)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown status '{}'", status)))?;
        qb.push(" AND v.status = ").push_bind(parsed.as_str());
    }
    if let Some(condition) = non_blank(&q.condition) {
        let parsed = VehicleCondition::parse(&condition)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown condition '{}'", condition)))?;
        qb.push(" AND v.condition = ").push_bind(parsed.as_str());
    }
    if let Some(make) = non_blank(&q.make) {
        qb.push(" AND v.make = ").push_bind(make).push(" COLLATE NOCASE");
    }
    if let Some(model) = non_blank(&q.model) {
        qb.push(" AND v.model LIKE ").push_bind(like_pattern(&model)).push(" ESCAPE '\\'");
    }
    for (column, value) in
        [("fuel_type", &q.fuel_type), ("transmission", &q.transmission), ("body_type", &q.body_type)]
    {
        if let Some(v) = non_blank(value) {
            qb.push(format!(" AND v.{} = ", column)).push_bind(v).push(" COLLATE NOCASE");
        }
    }
    if let Some(featured) = q.featured {
        qb.push(" AND v.featured = ").push_bind(featured);
    }
    if let Some(min) = q.min_price {
        qb.push(" AND v.price >= ").push_bind(min);
    }
    if let Some(max) = q.max_price {
        qb.push(" AND v.price <= ").push_bind(max);
    }
    if let Some(min) = q.min_year {
        qb.push(" AND v.year >= ").push_bind(min);
    }
    if let Some(max) = q.max_year {
        qb.push(" AND v.year <= ").push_bind(max);
    }
    if let Some(max) = q.max_mileage {
        qb.push(" AND v.mileage <= ").push_bind(max);
    }
    if let Some(text) = non_blank(&q.q) {
        let pattern = like_pattern(&text);
        qb.push(" AND (v.make LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR v.model LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR v.description LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    Ok(())
}

fn sort_clause(sort: Option<&str>) -> AppResult<&'static str> {
    // rowid breaks ties between rows created within the same millisecond
    match sort.unwrap_or("newest") {
        "newest" => Ok("v.created_at DESC, v.rowid DESC"),
        "price_asc" => Ok("v.price ASC, v.rowid DESC"),
        "price_desc" => Ok("v.price DESC, v.rowid DESC"),
        "year_desc" => Ok("v.year DESC, v.rowid DESC"),
        "mileage_asc" => Ok("v.mileage ASC, v.rowid DESC"),
        other => Err(AppError::BadRequest(format!(
            "Unknown sort '{}' (expected newest, price_asc, price_desc, year_desc or mileage_asc)",
            other
        ))),
    }
}

fn paging(q: &VehicleQuery) -> AppResult<(i64, i64)> {
    let page = q.page.unwrap_or(1).max(1);
    if page > MAX_PAGE {
        return Err(AppError::ValidationError {
            field: "page".into(),
            message: format!("page must be at most {}", MAX_PAGE),
        });
    }
    let per_page = q.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    Ok((page, per_page))
}

async fn list_vehicles(db: &SqlitePool, q: &VehicleQuery, scope: Scope) -> AppResult<Page<VehicleListItem>> {
    let order = sort_clause(q.sort.as_deref())?;
    let (page, per_page) = paging(q)?;

    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM vehicles v WHERE 1=1");
    push_filters(&mut count, q, scope)?;
    let total: i64 = count.build_query_scalar().fetch_one(db).await?;

    let mut select =
        QueryBuilder::<Sqlite>::new(format!("SELECT {}, {} FROM vehicles v WHERE 1=1", VEHICLE_COLUMNS, PRIMARY_IMAGE_URL));
    push_filters(&mut select, q, scope)?;
    select
        .push(" ORDER BY ")
        .push(order)
        .push(" LIMIT ")
        .push_bind(per_page)
        .push(" OFFSET ")
        .push_bind((page - 1) * per_page);
    let items = select.build_query_as::<VehicleListItem>().fetch_all(db).await?;

    Ok(Page { items, total, page, per_page })
}

pub(crate) async fn find_vehicle(db: &SqlitePool, id: &str) -> AppResult<Option<Vehicle>> {
    let vehicle = sqlx::query_as::<_, Vehicle>(&format!("SELECT {} FROM vehicles WHERE id = ?1", VEHICLE_COLUMNS))
        .bind(id)
        .fetch_optional(db)
        .await?;
    Ok(vehicle)
}

pub(crate) async fn images_for(db: &SqlitePool, vehicle_id: &str) -> AppResult<Vec<VehicleImage>> {
    let images = sqlx::query_as::<_, VehicleImage>(
        r#"SELECT id, vehicle_id, storage_path, url, alt_text, position, is_primary, content_type, size_bytes, created_at
           FROM vehicle_images WHERE vehicle_id = ?1 ORDER BY position ASC, created_at ASC"#,
    )
    .bind(vehicle_id)
    .fetch_all(db)
    .await?;
    Ok(images)
}

async fn detail(db: &SqlitePool, vehicle: Vehicle) -> AppResult<VehicleDetail> {
    let images = images_for(db, &vehicle.id).await?;
    Ok(VehicleDetail { vehicle, images })
}

/// Vehicle attributes after trimming and validation.
#[derive(Debug, Clone)]
struct VehicleFields {
    make: String,
    model: String,
    year: i64,
    price: i64,
    mileage: i64,
    fuel_type: Option<String>,
    transmission: Option<String>,
    body_type: Option<String>,
    color: Option<String>,
    condition: String,
    status: String,
    featured: bool,
    vin: Option<String>,
    description: Option<String>,
}

impl VehicleFields {
    fn from_create(req: CreateVehicleRequest) -> Self {
        Self {
            make: req.make,
            model: req.model,
            year: req.year,
            price: req.price,
            mileage: req.mileage.unwrap_or(0),
            fuel_type: req.fuel_type,
            transmission: req.transmission,
            body_type: req.body_type,
            color: req.color,
            condition: req.condition.unwrap_or_else(|| VehicleCondition::Used.as_str().into()),
            status: req.status.unwrap_or_else(|| VehicleStatus::Draft.as_str().into()),
            featured: req.featured.unwrap_or(false),
            vin: req.vin,
            description: req.description,
        }
    }

    fn from_existing(v: &Vehicle) -> Self {
        Self {
            make: v.make.clone(),
            model: v.model.clone(),
            year: v.year,
            price: v.price,
            mileage: v.mileage,
            fuel_type: v.fuel_type.clone(),
            transmission: v.transmission.clone(),
            body_type: v.body_type.clone(),
            color: v.color.clone(),
            condition: v.condition.clone(),
            status: v.status.clone(),
            featured: v.featured,
            vin: v.vin.clone(),
            description: v.description.clone(),
        }
    }

    /// Blank strings clear optional fields.
    fn apply(mut self, u: UpdateVehicleRequest) -> Self {
        if let Some(v) = u.make {
            self.make = v;
        }
        if let Some(v) = u.model {
            self.model = v;
        }
        if let Some(v) = u.year {
            self.year = v;
        }
        if let Some(v) = u.price {
            self.price = v;
        }
        if let Some(v) = u.mileage {
            self.mileage = v;
        }
        if let Some(v) = u.condition {
            self.condition = v;
        }
        if let Some(v) = u.status {
            self.status = v;
        }
        if let Some(v) = u.featured {
            self.featured = v;
        }
        let optional = [
            (&mut self.fuel_type, u.fuel_type),
            (&mut self.transmission, u.transmission),
            (&mut self.body_type, u.body_type),
            (&mut self.color, u.color),
            (&mut self.vin, u.vin),
            (&mut self.description, u.description),
        ];
        for (slot, value) in optional {
            if value.is_some() {
                *slot = value;
            }
        }
        self
    }

    fn validated(self) -> AppResult<Self> {
        let max_year = i64::from(chrono::Utc::now().year()) + 1;
        if !(MIN_YEAR..=max_year).contains(&self.year) {
            return Err(AppError::ValidationError {
                field: "year".into(),
                message: format!("must be between {} and {}", MIN_YEAR, max_year),
            });
        }
        if self.price < 0 {
            return Err(AppError::ValidationError { field: "price".into(), message: "must not be negative".into() });
        }
        if self.mileage < 0 {
            return Err(AppError::ValidationError { field: "mileage".into(), message: "must not be negative".into() });
        }
        let condition = VehicleCondition::parse(self.condition.trim()).ok_or_else(|| AppError::ValidationError {
            field: "condition".into(),
            message: "must be one of new, used".into(),
        })?;
        let status = VehicleStatus::parse(self.status.trim()).ok_or_else(|| AppError::ValidationError {
            field: "status".into(),
            message: "must be one of draft, available, reserved, sold".into(),
        })?;
        let vin = match optional_text(self.vin.as_deref(), "vin", 17)? {
            Some(v) => Some(validate_vin(&v)?),
            None => None,
        };

        Ok(Self {
            make: required_text(&self.make, "make", 100)?,
            model: required_text(&self.model, "model", 100)?,
            year: self.year,
            price: self.price,
            mileage: self.mileage,
            fuel_type: optional_text(self.fuel_type.as_deref(), "fuel_type", 50)?,
            transmission: optional_text(self.transmission.as_deref(), "transmission", 50)?,
            body_type: optional_text(self.body_type.as_deref(), "body_type", 50)?,
            color: optional_text(self.color.as_deref(), "color", 50)?,
            condition: condition.as_str().into(),
            status: status.as_str().into(),
            featured: self.featured,
            vin,
            description: optional_text(self.description.as_deref(), "description", 5000)?,
        })
    }
}

// ---------------- Public catalog ----------------

pub async fn list_public(
    State(state): State<AppState>,
    Query(q): Query<VehicleQuery>,
) -> AppResult<Json<Page<VehicleListItem>>> {
    Ok(Json(list_vehicles(&state.db, &q, Scope::Public).await?))
}

pub async fn get_public(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<VehicleDetail>> {
    validate_uuid(&id)?;
    let vehicle = find_vehicle(&state.db, &id)
        .await?
        .filter(|v| v.deleted_at.is_none() && v.status != VehicleStatus::Draft.as_str())
        .ok_or_not_found("Vehicle")?;
    Ok(Json(detail(&state.db, vehicle).await?))
}

/// Distinct makes of the published catalog with their vehicle counts.
pub async fn list_makes(State(state): State<AppState>) -> AppResult<Json<Vec<MakeCount>>> {
    let makes = sqlx::query_as::<_, MakeCount>(
        r#"SELECT MIN(make) AS make, COUNT(*) AS count FROM vehicles
           WHERE deleted_at IS NULL AND status <> 'draft'
           GROUP BY make COLLATE NOCASE ORDER BY make COLLATE NOCASE"#,
    )
    .fetch_all(&state.db)
    .await?;
    Ok(Json(makes))
}

// ---------------- Admin ----------------

pub async fn admin_list(
    State(state): State<AppState>,
    Query(q): Query<VehicleQuery>,
) -> AppResult<Json<Page<VehicleListItem>>> {
    let scope = Scope::Admin { include_deleted: q.include_deleted.unwrap_or(false) };
    Ok(Json(list_vehicles(&state.db, &q, scope).await?))
}

pub async fn admin_get(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<Json<VehicleDetail>> {
    validate_uuid(&id)?;
    let vehicle = find_vehicle(&state.db, &id).await?.ok_or_not_found("Vehicle")?;
    Ok(Json(detail(&state.db, vehicle).await?))
}

pub async fn create_vehicle(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateVehicleRequest>,
) -> AppResult<(StatusCode, Json<VehicleDetail>)> {
    let f = VehicleFields::from_create(req).validated()?;
    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    let vehicle = sqlx::query_as::<_, Vehicle>(&format!(
        r#"INSERT INTO vehicles (id, make, model, year, price, mileage, fuel_type, transmission, body_type, color,
               condition, status, featured, vin, description, created_by, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
           RETURNING {}"#,
        VEHICLE_COLUMNS
    ))
    .bind(&id)
    .bind(&f.make)
    .bind(&f.model)
    .bind(f.year)
    .bind(f.price)
    .bind(f.mileage)
    .bind(&f.fuel_type)
    .bind(&f.transmission)
    .bind(&f.body_type)
    .bind(&f.color)
    .bind(&f.condition)
    .bind(&f.status)
    .bind(f.featured)
    .bind(&f.vin)
    .bind(&f.description)
    .bind(&user.user_id)
    .bind(&now)
    .fetch_one(&state.db)
    .await?;

    state.metrics.inc_vehicles_written();
    state
        .audit
        .record(
            AuditEvent::new(AuditAction::VehicleCreated)
                .actor(&user)
                .ip(ip)
                .target(&id)
                .details(serde_json::json!({ "make": f.make, "model": f.model, "status": f.status })),
        )
        .await;

    Ok((StatusCode::CREATED, Json(VehicleDetail { vehicle, images: Vec::new() })))
}

pub async fn update_vehicle(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<UpdateVehicleRequest>,
) -> AppResult<Json<VehicleDetail>> {
    validate_uuid(&id)?;
    let existing = find_vehicle(&state.db, &id)
        .await?
        .filter(|v| v.deleted_at.is_none())
        .ok_or_not_found("Vehicle")?;
    let f = VehicleFields::from_existing(&existing).apply(req).validated()?;

    let vehicle = sqlx::query_as::<_, Vehicle>(&format!(
        r#"UPDATE vehicles SET make = ?2, model = ?3, year = ?4, price = ?5, mileage = ?6, fuel_type = ?7,
               transmission = ?8, body_type = ?9, color = ?10, condition = ?11, status = ?12, featured = ?13,
               vin = ?14, description = ?15, updated_at = ?16
           WHERE id = ?1 AND deleted_at IS NULL
           RETURNING {}"#,
        VEHICLE_COLUMNS
    ))
    .bind(&id)
    .bind(&f.make)
    .bind(&f.model)
    .bind(f.year)
    .bind(f.price)
    .bind(f.mileage)
    .bind(&f.fuel_type)
    .bind(&f.transmission)
    .bind(&f.body_type)
    .bind(&f.color)
    .bind(&f.condition)
    .bind(&f.status)
    .bind(f.featured)
    .bind(&f.vin)
    .bind(&f.description)
    .bind(now_timestamp())
    .fetch_optional(&state.db)
    .await?
    .ok_or_not_found("Vehicle")?;

    state.metrics.inc_vehicles_written();
    let mut changes = serde_json::Map::new();
    if existing.status != vehicle.status {
        changes.insert("status".into(), serde_json::json!([existing.status, vehicle.status]));
    }
    if existing.price != vehicle.price {
        changes.insert("price".into(), serde_json::json!([existing.price, vehicle.price]));
    }
    state
        .audit
        .record(
            AuditEvent::new(AuditAction::VehicleUpdated)
                .actor(&user)
                .ip(ip)
                .target(&id)
                .details(serde_json::Value::Object(changes)),
        )
        .await;

    Ok(Json(detail(&state.db, vehicle).await?))
}

/// Soft delete: the row and its images stay until restored.
pub async fn delete_vehicle(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> AppResult<Json<MessageResponse>> {
    validate_uuid(&id)?;
    let now = now_timestamp();
    let res = sqlx::query("UPDATE vehicles SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL")
        .bind(&id)
        .bind(&now)
        .execute(&state.db)
        .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::NotFound("Vehicle not found".into()));
    }

    state.metrics.inc_vehicles_written();
    state
        .audit
        .record(AuditEvent::new(AuditAction::VehicleDeleted).actor(&user).ip(ip).target(&id))
        .await;
    Ok(Json(MessageResponse::new("Vehicle deleted")))
}

pub async fn restore_vehicle(
    State(state): State<AppState>,
    user: CurrentUser,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> AppResult<Json<VehicleDetail>> {
    validate_uuid(&id)?;
    let restored = sqlx::query_as::<_, Vehicle>(&format!(
        "UPDATE vehicles SET deleted_at = NULL, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NOT NULL RETURNING {}",
        VEHICLE_COLUMNS
    ))
    .bind(&id)
    .bind(now_timestamp())
    .fetch_optional(&state.db)
    .await?;

    let vehicle = match restored {
        Some(v) => v,
        None => {
            return Err(match find_vehicle(&state.db, &id).await? {
                Some(_) => AppError::Conflict("Vehicle is not deleted".into()),
                None => AppError::NotFound("Vehicle not found".into()),
            })
        }
    };

    state.metrics.inc_vehicles_written();
    state
        .audit
        .record(AuditEvent::new(AuditAction::VehicleRestored).actor(&user).ip(ip).target(&id))
        .await;
    Ok(Json(detail(&state.db, vehicle).await?))
}
