//! Outbound collaborator seam.
//!
//! Every external service the core talks to (payment gateway, OTP delivery,
//! mobile attestation) sits behind a trait here. Production wires the HTTP
//! adapters; scenario tests wire the in-memory ones with scripted outcomes.
//!
//! Callers must never hold an open store transaction across any of these
//! calls: charge first, then apply the result in a short transaction keyed
//! by the external reference.

pub mod attestation;
pub mod otp;
pub mod payment;

pub use attestation::{AttestationVerdict, AttestationVerifier, StaticAttestationVerifier};
pub use otp::{send_with_retry, InMemoryOtpDelivery, OtpDelivery, OtpDeliveryError};
pub use payment::{
    ChargeOutcome, ChargeRequest, HttpPaymentGateway, InMemoryPaymentGateway, PaymentError,
    PaymentGateway,
};
