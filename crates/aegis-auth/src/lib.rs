//! Identity, lockout, and token issuance.
//!
//! The lockout machine, password policy, token codec, and OTP codec are
//! pure and deterministic; `service` wires them to the store and the
//! delivery channel. The emergency override deliberately does NOT live
//! here: panic ingest resolves phone membership itself and bypasses the
//! login path entirely, so nothing in this crate can accidentally widen
//! the override's scope.

pub mod lockout;
pub mod otp;
pub mod password;
pub mod service;
pub mod token;

pub use lockout::{LockoutConfig, LockoutState, LoginGate, OtpChallenge, OtpIssue, OtpVerdict};
pub use password::{hash_password, validate_password_policy, verify_password};
pub use token::{Claims, TokenError, TokenPair, TokenSigner, TokenUse};
