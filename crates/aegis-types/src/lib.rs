//! Shared domain vocabulary for the dispatch platform.
//!
//! Everything here is plain data: enums with stable string forms (DB text
//! columns and JSON payloads use the same spelling), the realtime envelope,
//! and the error taxonomy. No I/O, no async.

pub mod envelope;
pub mod error;
pub mod status;

pub use envelope::{EnvelopeKind, RealtimeEnvelope};
pub use error::{ApiError, ErrorCode};
pub use status::{
    DeliveryChannel, FirmRole, FirmVerification, LocationSource, MembershipRole, PhoneKind,
    PrincipalKind, ProviderStatus, RequestStatus, ServiceType,
};

use serde::{Deserialize, Serialize};

/// A WGS84 coordinate. Longitude first in array forms, matching the
/// `[lon, lat]` ring layout persisted in JSONB columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}
