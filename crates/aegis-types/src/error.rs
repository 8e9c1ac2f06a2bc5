//! User-visible error taxonomy.
//!
//! `ErrorCode` is the closed set of machine-readable codes; `ApiError` is
//! the wire shape `{error_code, message, details, timestamp, request_id}`.
//! Messages are always safe to display; anything structured the client can
//! act on (retry windows, alternative firms, attempts remaining) goes into
//! `details`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // AUTH_*
    AuthInvalidCredentials,
    AuthTokenExpired,
    AuthTokenRevoked,
    AuthInsufficientPermission,
    AccountLocked,
    AuthTooManyAttempts,
    AuthInvalidOtp,
    OtpExpired,
    AuthInvalidDeliveryMethod,
    AuthMissingAttestation,
    InvalidAttestation,
    // USER_*
    UserEmailExists,
    UserPhoneExists,
    UserPhoneUnverified,
    UserGroupNotOwned,
    UserSuspended,
    UserBanned,
    UnauthorizedRequester,
    // SUB_*
    InsufficientCredits,
    SubscriptionExpired,
    SubAlreadyApplied,
    SubProductNotFound,
    SubUserLimitExceeded,
    // GEO_*
    LocationNotCovered,
    InvalidCoordinates,
    // REQ_*
    DuplicateRequest,
    ReqNotFound,
    ReqInvalidServiceType,
    InvalidStatusTransition,
    ReqExpired,
    InvalidAssignmentForCall,
    ReqInvalidAssignment,
    ReqInvalidFeedback,
    // FIRM_*
    FirmNotApproved,
    FirmPersonnelLimit,
    // PAY_*
    PayFailed,
    PayGatewayUnavailable,
    // SYS_*
    SysStoreError,
    SysExternalUnavailable,
    SysRateLimited,
}

impl ErrorCode {
    /// Stable wire spelling. Codes that the mobile clients already match on
    /// keep their historical short form; the rest carry a family prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthInvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            ErrorCode::AuthTokenExpired => "AUTH_TOKEN_EXPIRED",
            ErrorCode::AuthTokenRevoked => "AUTH_TOKEN_REVOKED",
            ErrorCode::AuthInsufficientPermission => "AUTH_INSUFFICIENT_PERMISSION",
            ErrorCode::AccountLocked => "ACCOUNT_LOCKED",
            ErrorCode::AuthTooManyAttempts => "AUTH_TOO_MANY_ATTEMPTS",
            ErrorCode::AuthInvalidOtp => "AUTH_INVALID_OTP",
            ErrorCode::OtpExpired => "OTP_EXPIRED",
            ErrorCode::AuthInvalidDeliveryMethod => "AUTH_INVALID_DELIVERY_METHOD",
            ErrorCode::AuthMissingAttestation => "AUTH_MISSING_ATTESTATION",
            ErrorCode::InvalidAttestation => "INVALID_ATTESTATION",
            ErrorCode::UserEmailExists => "USER_EMAIL_EXISTS",
            ErrorCode::UserPhoneExists => "USER_PHONE_EXISTS",
            ErrorCode::UserPhoneUnverified => "USER_PHONE_UNVERIFIED",
            ErrorCode::UserGroupNotOwned => "USER_GROUP_NOT_OWNED",
            ErrorCode::UserSuspended => "USER_SUSPENDED",
            ErrorCode::UserBanned => "USER_BANNED",
            ErrorCode::UnauthorizedRequester => "UNAUTHORIZED_REQUESTER",
            ErrorCode::InsufficientCredits => "INSUFFICIENT_CREDITS",
            ErrorCode::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            ErrorCode::SubAlreadyApplied => "SUB_ALREADY_APPLIED",
            ErrorCode::SubProductNotFound => "SUB_PRODUCT_NOT_FOUND",
            ErrorCode::SubUserLimitExceeded => "SUB_USER_LIMIT_EXCEEDED",
            ErrorCode::LocationNotCovered => "LOCATION_NOT_COVERED",
            ErrorCode::InvalidCoordinates => "INVALID_COORDINATES",
            ErrorCode::DuplicateRequest => "DUPLICATE_REQUEST",
            ErrorCode::ReqNotFound => "REQ_NOT_FOUND",
            ErrorCode::ReqInvalidServiceType => "REQ_INVALID_SERVICE_TYPE",
            ErrorCode::InvalidStatusTransition => "INVALID_STATUS_TRANSITION",
            ErrorCode::ReqExpired => "REQ_EXPIRED",
            ErrorCode::InvalidAssignmentForCall => "INVALID_ASSIGNMENT_FOR_CALL",
            ErrorCode::ReqInvalidAssignment => "REQ_INVALID_ASSIGNMENT",
            ErrorCode::ReqInvalidFeedback => "REQ_INVALID_FEEDBACK",
            ErrorCode::FirmNotApproved => "FIRM_NOT_APPROVED",
            ErrorCode::FirmPersonnelLimit => "FIRM_PERSONNEL_LIMIT",
            ErrorCode::PayFailed => "PAY_FAILED",
            ErrorCode::PayGatewayUnavailable => "PAY_GATEWAY_UNAVAILABLE",
            ErrorCode::SysStoreError => "SYS_STORE_ERROR",
            ErrorCode::SysExternalUnavailable => "SYS_EXTERNAL_UNAVAILABLE",
            ErrorCode::SysRateLimited => "SYS_RATE_LIMITED",
        }
    }

    /// Validation rejections are non-retryable; only the SYS_* family (and
    /// the payment gateway being down) warrants a client retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::SysStoreError
                | ErrorCode::SysExternalUnavailable
                | ErrorCode::SysRateLimited
                | ErrorCode::PayGatewayUnavailable
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error body every endpoint returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            message: message.into(),
            details: Value::Null,
            timestamp: Utc::now(),
            request_id: Uuid::new_v4(),
        }
    }

    fn detail(mut self, key: &str, value: Value) -> Self {
        if !self.details.is_object() {
            self.details = json!({});
        }
        self.details
            .as_object_mut()
            .expect("details is an object")
            .insert(key.to_string(), value);
        self
    }

    /// Locked-account responses always carry this.
    pub fn with_retry_after_minutes(self, minutes: i64) -> Self {
        self.detail("retry_after_minutes", json!(minutes))
    }

    /// Rate-limit responses always carry this.
    pub fn with_retry_after_seconds(self, seconds: i64) -> Self {
        self.detail("retry_after_seconds", json!(seconds))
    }

    /// Coverage failures carry alternative firms when any exist.
    pub fn with_suggested_firms(self, firm_ids: &[Uuid]) -> Self {
        self.detail("suggested_firms", json!(firm_ids))
    }

    pub fn with_attempts_remaining(self, attempts: u32) -> Self {
        self.detail("attempts_remaining", json!(attempts))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_literal_codes_keep_short_spelling() {
        assert_eq!(ErrorCode::AccountLocked.as_str(), "ACCOUNT_LOCKED");
        assert_eq!(ErrorCode::OtpExpired.as_str(), "OTP_EXPIRED");
        assert_eq!(
            ErrorCode::UnauthorizedRequester.as_str(),
            "UNAUTHORIZED_REQUESTER"
        );
        assert_eq!(ErrorCode::DuplicateRequest.as_str(), "DUPLICATE_REQUEST");
        assert_eq!(
            ErrorCode::InsufficientCredits.as_str(),
            "INSUFFICIENT_CREDITS"
        );
        assert_eq!(
            ErrorCode::LocationNotCovered.as_str(),
            "LOCATION_NOT_COVERED"
        );
    }

    #[test]
    fn details_accumulate() {
        let e = ApiError::new(ErrorCode::AccountLocked, "account locked")
            .with_retry_after_minutes(29)
            .with_attempts_remaining(2);
        assert_eq!(e.details["retry_after_minutes"], 29);
        assert_eq!(e.details["attempts_remaining"], 2);
    }

    #[test]
    fn transient_family() {
        assert!(ErrorCode::SysStoreError.is_transient());
        assert!(!ErrorCode::DuplicateRequest.is_transient());
        assert!(!ErrorCode::AccountLocked.is_transient());
    }
}
