//! Bearer auth, actor resolution, attestation, and the error → HTTP
//! mapping.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use aegis_auth::service::verify_access;
use aegis_auth::Claims;
use aegis_dispatch::Actor;
use aegis_gateway::AttestationVerdict;
use aegis_types::{ApiError, ErrorCode};

use crate::state::AppState;

/// Wrapper giving `ApiError` an HTTP status. Handlers return
/// `Result<_, ApiFailure>` and use `?` on anything producing `ApiError`.
#[derive(Debug)]
pub struct ApiFailure(pub ApiError);

impl From<ApiError> for ApiFailure {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    use ErrorCode::*;
    match code {
        AuthInvalidCredentials | AuthTokenExpired | AuthTokenRevoked | AuthInvalidOtp
        | OtpExpired | AuthMissingAttestation | InvalidAttestation => StatusCode::UNAUTHORIZED,
        AccountLocked => StatusCode::LOCKED,
        AuthTooManyAttempts | SysRateLimited => StatusCode::TOO_MANY_REQUESTS,
        AuthInsufficientPermission | UserSuspended | UserBanned | UnauthorizedRequester
        | UserGroupNotOwned | FirmNotApproved => StatusCode::FORBIDDEN,
        ReqNotFound | SubProductNotFound => StatusCode::NOT_FOUND,
        DuplicateRequest | SubAlreadyApplied | UserEmailExists | UserPhoneExists
        | InvalidStatusTransition | ReqInvalidAssignment | InvalidAssignmentForCall => {
            StatusCode::CONFLICT
        }
        SubscriptionExpired | InsufficientCredits | PayFailed => StatusCode::PAYMENT_REQUIRED,
        PayGatewayUnavailable | SysExternalUnavailable => StatusCode::BAD_GATEWAY,
        SysStoreError => StatusCode::SERVICE_UNAVAILABLE,
        LocationNotCovered | InvalidCoordinates | ReqInvalidServiceType | ReqExpired
        | ReqInvalidFeedback | SubUserLimitExceeded | UserPhoneUnverified
        | FirmPersonnelLimit | AuthInvalidDeliveryMethod => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (status_for(self.0.error_code), Json(self.0)).into_response()
    }
}

/// Pull and verify the bearer token. Checked against the revocation list
/// on every call.
pub async fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiFailure> {
    let token = bearer_token(headers).ok_or_else(|| {
        ApiFailure(ApiError::new(
            ErrorCode::AuthInvalidCredentials,
            "missing bearer token",
        ))
    })?;
    Ok(verify_access(&state.pool, &state.signer, token).await?)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub fn actor_of(claims: &Claims) -> Actor {
    Actor {
        principal_id: claims.sub,
        kind: claims.kind,
        firm_id: claims.firm_id,
        role: claims.role,
    }
}

/// Mobile attestation headers on the panic path. Headers are optional; when
/// present the verdict gates the call. `unsupported` passes only in
/// development mode.
pub async fn check_attestation(state: &AppState, headers: &HeaderMap) -> Result<(), ApiFailure> {
    let token = headers.get("x-attestation-token").and_then(|v| v.to_str().ok());
    let platform = headers.get("x-platform").and_then(|v| v.to_str().ok());
    let nonce = headers
        .get("x-attestation-nonce")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (Some(token), Some(platform)) = (token, platform) else {
        return Ok(());
    };

    match state.attestation.verify(token, platform, nonce).await {
        AttestationVerdict::Valid => Ok(()),
        AttestationVerdict::Unsupported if state.settings.development_mode => Ok(()),
        verdict => {
            warn!(?verdict, platform, "attestation rejected");
            let _ = aegis_db::principals::record_security_event(
                &state.pool,
                "invalid_attestation",
                None,
                serde_json::json!({"platform": platform}),
            )
            .await;
            Err(ApiFailure(ApiError::new(
                ErrorCode::InvalidAttestation,
                "app attestation failed",
            )))
        }
    }
}
