use serde::{Deserialize, Serialize};

use crate::session::CurrentUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Draft,
    Available,
    Reserved,
    Sold,
}

impl VehicleStatus {
    pub const ALL: [VehicleStatus; 4] =
        [VehicleStatus::Draft, VehicleStatus::Available, VehicleStatus::Reserved, VehicleStatus::Sold];

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleStatus::Draft => "draft",
            VehicleStatus::Available => "available",
            VehicleStatus::Reserved => "reserved",
            VehicleStatus::Sold => "sold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleCondition {
    New,
    Used,
}

impl VehicleCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            VehicleCondition::New => "new",
            VehicleCondition::Used => "used",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(VehicleCondition::New),
            "used" => Some(VehicleCondition::Used),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InquiryStatus {
    New,
    Contacted,
    Closed,
}

impl InquiryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InquiryStatus::New => "new",
            InquiryStatus::Contacted => "contacted",
            InquiryStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(InquiryStatus::New),
            "contacted" => Some(InquiryStatus::Contacted),
            "closed" => Some(InquiryStatus::Closed),
            _ => None,
        }
    }
}

// Catalog rows
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vehicle {
    pub id: String,
    pub make: String,
    pub model: String,
    pub year: i64,
    pub price: i64,
    pub mileage: i64,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub condition: String,
    pub status: String,
    pub featured: bool,
    pub vin: Option<String>,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VehicleListItem {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub vehicle: Vehicle,
    pub primary_image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VehicleImage {
    pub id: String,
    pub vehicle_id: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub storage_path: String,
    pub url: String,
    pub alt_text: Option<String>,
    pub position: i64,
    pub is_primary: bool,
    pub content_type: String,
    pub size_bytes: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleDetail {
    #[serde(flatten)]
    pub vehicle: Vehicle,
    pub images: Vec<VehicleImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MakeCount {
    pub make: String,
    pub count: i64,
}

/// Query string of the catalog listings (public and admin).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VehicleQuery {
    pub make: Option<String>,
    pub model: Option<String>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub condition: Option<String>,
    pub status: Option<String>,
    pub featured: Option<bool>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub min_year: Option<i64>,
    pub max_year: Option<i64>,
    pub max_mileage: Option<i64>,
    /// Free text over make, model and description.
    pub q: Option<String>,
    pub sort: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    /// Admin listing only.
    pub include_deleted: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVehicleRequest {
    pub make: String,
    pub model: String,
    pub year: i64,
    pub price: i64,
    pub mileage: Option<i64>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub condition: Option<String>,
    pub status: Option<String>,
    pub featured: Option<bool>,
    pub vin: Option<String>,
    pub description: Option<String>,
}

/// Partial update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateVehicleRequest {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i64>,
    pub price: Option<i64>,
    pub mileage: Option<i64>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub condition: Option<String>,
    pub status: Option<String>,
    pub featured: Option<bool>,
    pub vin: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReorderImagesRequest {
    pub image_ids: Vec<String>,
}

// Inquiries
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Inquiry {
    pub id: String,
    pub vehicle_id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub message: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInquiryRequest {
    pub vehicle_id: Option<String>,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateInquiryRequest {
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InquiryQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

// Dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub draft: i64,
    pub available: i64,
    pub reserved: i64,
    pub sold: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InquiryCounts {
    pub total: i64,
    pub new: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    /// Vehicles that are not soft-deleted.
    pub total_vehicles: i64,
    pub by_status: StatusCounts,
    pub featured: i64,
    pub deleted: i64,
    pub average_price: Option<f64>,
    pub inquiries: InquiryCounts,
    pub recent_vehicles: Vec<Vehicle>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

// Auth
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordStrengthRequest {
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordStrengthResponse {
    pub valid: bool,
    pub score: u8,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: CurrentUser,
    pub expires_in: i64,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub authenticated: bool,
    pub user: Option<CurrentUser>,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }
}
