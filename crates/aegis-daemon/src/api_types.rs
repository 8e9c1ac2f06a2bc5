//! Request/response DTOs for the `/v1/` surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_types::{DeliveryChannel, GeoPoint, LocationSource, PhoneKind, ServiceType};

// -- auth --

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub email: String,
    pub phone: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub phone: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UnlockRequestBody {
    /// Email or E.164 phone.
    pub identifier: String,
    pub channel: DeliveryChannel,
}

#[derive(Debug, Deserialize)]
pub struct UnlockVerifyBody {
    pub identifier: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTokenBody {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct OkBody {
    pub ok: bool,
}

// -- firm administration --

#[derive(Debug, Deserialize)]
pub struct CreateFirmBody {
    pub name: String,
    pub registration_number: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAreaBody {
    pub name: String,
    /// Open or closed ring of vertices; auto-closed on input.
    pub ring: Vec<GeoPoint>,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveBody {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProviderPositionBody {
    pub point: GeoPoint,
}

// -- panic / requests --

#[derive(Debug, Deserialize)]
pub struct PanicBody {
    pub requester_phone: String,
    pub group_id: Uuid,
    pub service_type: ServiceType,
    pub point: GeoPoint,
    pub address: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PanicResponse {
    pub request_id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent_mode: Option<&'static str>,
    pub grace_alert: bool,
}

#[derive(Debug, Deserialize)]
pub struct AllocateBody {
    #[serde(default)]
    pub team_id: Option<Uuid>,
    #[serde(default)]
    pub provider_id: Option<Uuid>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub position: Option<GeoPoint>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressBody {
    #[serde(default)]
    pub position: Option<GeoPoint>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by caller".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub is_prank: bool,
    #[serde(default)]
    pub rating: Option<i32>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LocationBody {
    pub point: GeoPoint,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub source: LocationSource,
    #[serde(default)]
    pub update_primary: bool,
}

#[derive(Debug, Deserialize)]
pub struct NearestQuery {
    pub lon: f64,
    pub lat: f64,
    pub provider_type: String,
    #[serde(default = "default_radius")]
    pub radius_km: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_radius() -> f64 {
    50.0
}

fn default_limit() -> usize {
    10
}

// -- subscriptions / credits --

#[derive(Debug, Deserialize)]
pub struct PurchaseCreditsBody {
    pub amount: i64,
    pub price_cents: i64,
    pub idempotency_key: String,
    #[serde(default)]
    pub payment: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateProductBody {
    pub name: String,
    pub max_users: i32,
    pub price_cents: i64,
    pub credit_cost: i64,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseSubscriptionBody {
    pub product_id: Uuid,
    pub idempotency_key: String,
    #[serde(default)]
    pub payment: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ApplySubscriptionBody {
    pub stored_subscription_id: Uuid,
    pub group_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PayFineBody {
    #[serde(default)]
    pub payment: serde_json::Value,
}

// -- groups --

#[derive(Debug, Deserialize)]
pub struct AddPhoneBody {
    pub phone: String,
    pub kind: PhoneKind,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub db_ok: bool,
}
