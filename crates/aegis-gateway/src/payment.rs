//! Payment-gateway adapter.
//!
//! Contract: `charge` is idempotent by the client-generated idempotency
//! key. A retried charge with the same key must not bill twice; the
//! in-memory adapter enforces that, and the HTTP adapter forwards the key
//! for the real gateway to enforce.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub idempotency_key: String,
    /// Opaque payload forwarded to the gateway (card token, reference, ...).
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Success { external_id: String },
    Failure { code: String, message: String },
}

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Transport-level failure: the gateway may or may not have seen the
    /// charge. Retry with the same idempotency key.
    #[error("payment gateway unreachable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, req: &ChargeRequest) -> Result<ChargeOutcome, PaymentError>;
}

// ---------------------------------------------------------------------------
// In-memory adapter (scenario tests, dev)
// ---------------------------------------------------------------------------

/// Scripted gateway: succeeds by default, can be told to refuse. Replays
/// the original outcome for a repeated idempotency key.
#[derive(Default)]
pub struct InMemoryPaymentGateway {
    refuse_with: Mutex<Option<(String, String)>>,
    seen: Mutex<HashMap<String, ChargeOutcome>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// All subsequent charges fail with this code/message.
    pub fn refuse(&self, code: &str, message: &str) {
        *self.refuse_with.lock().expect("poisoned") =
            Some((code.to_string(), message.to_string()));
    }

    pub fn charges_seen(&self) -> usize {
        self.seen.lock().expect("poisoned").len()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn charge(&self, req: &ChargeRequest) -> Result<ChargeOutcome, PaymentError> {
        let mut seen = self.seen.lock().expect("poisoned");
        if let Some(prior) = seen.get(&req.idempotency_key) {
            return Ok(prior.clone());
        }

        let outcome = match &*self.refuse_with.lock().expect("poisoned") {
            Some((code, message)) => ChargeOutcome::Failure {
                code: code.clone(),
                message: message.clone(),
            },
            None => ChargeOutcome::Success {
                external_id: format!("pay-{}", req.idempotency_key),
            },
        };
        seen.insert(req.idempotency_key.clone(), outcome.clone());
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

/// Thin JSON client for a gateway exposing `POST {base}/charge`.
pub struct HttpPaymentGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static config");
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, req: &ChargeRequest) -> Result<ChargeOutcome, PaymentError> {
        let url = format!("{}/charge", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Idempotency-Key", &req.idempotency_key)
            .json(req)
            .send()
            .await
            .map_err(|e| PaymentError::Unavailable(e.to_string()))?;

        resp.json::<ChargeOutcome>()
            .await
            .map_err(|e| PaymentError::Unavailable(format!("bad gateway response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(key: &str) -> ChargeRequest {
        ChargeRequest {
            amount_cents: 10_000,
            currency: "ZAR".to_string(),
            idempotency_key: key.to_string(),
            payload: json!({"token": "tok_test"}),
        }
    }

    #[tokio::test]
    async fn same_key_replays_outcome() {
        let gw = InMemoryPaymentGateway::new();
        let first = gw.charge(&req("k1")).await.unwrap();
        let second = gw.charge(&req("k1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gw.charges_seen(), 1);
    }

    #[tokio::test]
    async fn refusal_is_scripted() {
        let gw = InMemoryPaymentGateway::new();
        gw.refuse("card_declined", "insufficient funds");
        match gw.charge(&req("k2")).await.unwrap() {
            ChargeOutcome::Failure { code, .. } => assert_eq!(code, "card_declined"),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
