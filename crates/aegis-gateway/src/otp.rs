//! OTP delivery (SMS / email) with bounded retry.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use aegis_types::DeliveryChannel;

#[derive(Debug, Error)]
pub enum OtpDeliveryError {
    #[error("delivery failed via {channel}: {reason}")]
    Failed {
        channel: DeliveryChannel,
        reason: String,
    },
}

#[async_trait]
pub trait OtpDelivery: Send + Sync {
    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        body: &str,
    ) -> Result<(), OtpDeliveryError>;
}

/// Retry wrapper: up to 3 attempts, 200 ms doubling backoff. Lock state is
/// untouched by delivery failures; the caller decides what to surface.
pub async fn send_with_retry(
    delivery: &dyn OtpDelivery,
    channel: DeliveryChannel,
    address: &str,
    body: &str,
) -> Result<(), OtpDeliveryError> {
    let mut backoff = Duration::from_millis(200);
    let mut last_err = None;

    for attempt in 1..=3 {
        match delivery.send(channel, address, body).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, %channel, "otp delivery attempt failed");
                last_err = Some(e);
                if attempt < 3 {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_err.expect("loop ran at least once"))
}

/// Captures outgoing messages; can be told to fail the first N sends.
#[derive(Default)]
pub struct InMemoryOtpDelivery {
    pub sent: Mutex<Vec<(DeliveryChannel, String, String)>>,
    fail_next: Mutex<u32>,
}

impl InMemoryOtpDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock().expect("poisoned") = n;
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("poisoned").len()
    }

    pub fn last_body(&self) -> Option<String> {
        self.sent
            .lock()
            .expect("poisoned")
            .last()
            .map(|(_, _, body)| body.clone())
    }
}

#[async_trait]
impl OtpDelivery for InMemoryOtpDelivery {
    async fn send(
        &self,
        channel: DeliveryChannel,
        address: &str,
        body: &str,
    ) -> Result<(), OtpDeliveryError> {
        {
            let mut fail = self.fail_next.lock().expect("poisoned");
            if *fail > 0 {
                *fail -= 1;
                return Err(OtpDeliveryError::Failed {
                    channel,
                    reason: "scripted failure".to_string(),
                });
            }
        }
        self.sent
            .lock()
            .expect("poisoned")
            .push((channel, address.to_string(), body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_through_transient_failures() {
        let delivery = InMemoryOtpDelivery::new();
        delivery.fail_next(2);
        send_with_retry(&delivery, DeliveryChannel::Sms, "+27111111111", "code 123456")
            .await
            .unwrap();
        assert_eq!(delivery.sent_count(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let delivery = InMemoryOtpDelivery::new();
        delivery.fail_next(3);
        let err = send_with_retry(&delivery, DeliveryChannel::Email, "u@example.com", "code")
            .await
            .unwrap_err();
        assert!(matches!(err, OtpDeliveryError::Failed { .. }));
        assert_eq!(delivery.sent_count(), 0);
    }
}
