//! Realtime message envelope.
//!
//! Small JSON envelopes `{type, request_id, payload, ts}` pushed over
//! long-lived sessions. Delivery is at-most-once per session; the REST
//! surface remains the source of truth, so payloads stay small and clients
//! reconcile by re-fetching the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    RequestCreated,
    RequestAllocated,
    RequestStatusUpdate,
    LocationUpdate,
    EtaUpdate,
    Completed,
    Cancelled,
    SubscriptionExpiry,
    ServerPing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl RealtimeEnvelope {
    pub fn new(kind: EnvelopeKind, request_id: Uuid, payload: Value) -> Self {
        Self {
            kind,
            request_id: Some(request_id),
            payload,
            ts: Utc::now(),
        }
    }

    /// Keep-alive ping; not tied to any request.
    pub fn server_ping() -> Self {
        Self {
            kind: EnvelopeKind::ServerPing,
            request_id: None,
            payload: Value::Null,
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_type_tag() {
        let env = RealtimeEnvelope::new(
            EnvelopeKind::RequestCreated,
            Uuid::nil(),
            json!({"status": "pending"}),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "request_created");
        assert_eq!(v["payload"]["status"], "pending");
        assert!(v.get("kind").is_none());
    }

    #[test]
    fn ping_has_no_request_id() {
        let v = serde_json::to_value(RealtimeEnvelope::server_ping()).unwrap();
        assert_eq!(v["type"], "server_ping");
        assert!(v.get("request_id").is_none());
    }
}
