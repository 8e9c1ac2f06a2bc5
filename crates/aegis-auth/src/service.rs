//! Auth flows over the store: login, refresh, revoke, account status,
//! registration, and the OTP unlock path.
//!
//! Lockout decisions are computed by the pure machine in `lockout.rs`; this
//! module's job is ordering: row-lock the principal, evaluate, persist the
//! next state, commit, and only then touch delivery channels. OTP delivery
//! never happens inside an open transaction.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use aegis_db::principals::{self, NewPrincipal, PrincipalRow};
use aegis_gateway::{send_with_retry, OtpDelivery};
use aegis_types::{ApiError, DeliveryChannel, ErrorCode, FirmRole, PrincipalKind};

use crate::lockout::{
    evaluate_login, issue_otp, on_login_failure, on_login_success, verify_otp, LockoutConfig,
    LockoutState, LoginGate, OtpChallenge, OtpIssue, OtpVerdict,
};
use crate::otp::{digest_code, generate_code};
use crate::password::{hash_password, validate_password_policy, verify_password};
use crate::token::{Claims, TokenError, TokenPair, TokenSigner, TokenUse};

/// Storage failures surface as one opaque user-safe error; detail goes to
/// the log, never the client.
fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("auth storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

fn token_error(e: TokenError) -> ApiError {
    match e {
        TokenError::Expired => ApiError::new(ErrorCode::AuthTokenExpired, "token expired"),
        TokenError::Invalid | TokenError::WrongUse => {
            ApiError::new(ErrorCode::AuthInvalidCredentials, "token invalid")
        }
    }
}

fn lockout_state_of(row: &PrincipalRow) -> LockoutState {
    LockoutState {
        failed_count: row.failed_login_count.max(0) as u32,
        locked_until: row.locked_until,
        otp: match (&row.otp_digest, row.otp_expires_at, row.otp_attempts_left) {
            (Some(digest), Some(expires_at), Some(attempts)) => Some(OtpChallenge {
                digest: digest.clone(),
                expires_at,
                attempts_left: attempts.max(0) as u32,
            }),
            _ => None,
        },
    }
}

async fn persist_lockout_state(
    tx: &mut Transaction<'_, Postgres>,
    principal_id: Uuid,
    state: &LockoutState,
) -> Result<()> {
    principals::update_lockout_state(
        tx,
        principal_id,
        state.failed_count as i32,
        state.locked_until,
    )
    .await?;
    match &state.otp {
        Some(c) => {
            principals::set_unlock_otp(
                tx,
                principal_id,
                &c.digest,
                c.expires_at,
                c.attempts_left as i32,
            )
            .await?
        }
        None => principals::clear_unlock_otp(tx, principal_id).await?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Login / refresh / revoke
// ---------------------------------------------------------------------------

pub async fn login(
    pool: &PgPool,
    signer: &TokenSigner,
    cfg: &LockoutConfig,
    email: &str,
    password: &str,
) -> Result<TokenPair, ApiError> {
    let now = Utc::now();

    let Some(found) = principals::fetch_principal_by_email(pool, email)
        .await
        .map_err(internal)?
    else {
        return Err(ApiError::new(
            ErrorCode::AuthInvalidCredentials,
            "invalid email or password",
        ));
    };
    if found.banned {
        return Err(ApiError::new(ErrorCode::UserBanned, "account is banned"));
    }

    let mut tx = pool.begin().await.context("begin login tx").map_err(internal)?;
    let row = principals::fetch_principal_for_update(&mut tx, found.principal_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::AuthInvalidCredentials, "invalid email or password"))?;

    let state = match evaluate_login(lockout_state_of(&row), now) {
        LoginGate::Locked {
            retry_after_minutes,
        } => {
            // No counter change while locked; nothing to persist.
            return Err(ApiError::new(ErrorCode::AccountLocked, "account locked")
                .with_retry_after_minutes(retry_after_minutes));
        }
        LoginGate::Allowed(state) => state,
    };

    if verify_password(password, &row.password_hash) {
        if !row.verified {
            return Err(ApiError::new(
                ErrorCode::UserPhoneUnverified,
                "account not yet verified",
            ));
        }
        let next = on_login_success(state, now);
        persist_lockout_state(&mut tx, row.principal_id, &next)
            .await
            .map_err(internal)?;
        tx.commit().await.context("commit login tx").map_err(internal)?;

        signer
            .mint_pair(row.principal_id, row.kind, row.firm_id, row.firm_role, now)
            .map_err(internal)
    } else {
        let (next, locked_now) = on_login_failure(cfg, state, now);
        let attempts_remaining = cfg.threshold.saturating_sub(next.failed_count);
        persist_lockout_state(&mut tx, row.principal_id, &next)
            .await
            .map_err(internal)?;
        tx.commit().await.context("commit login tx").map_err(internal)?;

        if locked_now {
            warn!(principal_id = %row.principal_id, "account locked after repeated failures");
            Err(
                ApiError::new(ErrorCode::AccountLocked, "account locked")
                    .with_retry_after_minutes(cfg.lock_duration.num_minutes()),
            )
        } else {
            Err(ApiError::new(
                ErrorCode::AuthInvalidCredentials,
                "invalid email or password",
            )
            .with_attempts_remaining(attempts_remaining))
        }
    }
}

/// Rotation: the presented refresh token is revoked and a fresh pair is
/// minted, so each refresh token works exactly once.
pub async fn refresh(
    pool: &PgPool,
    signer: &TokenSigner,
    refresh_token: &str,
) -> Result<TokenPair, ApiError> {
    let claims = signer
        .verify(refresh_token, TokenUse::Refresh)
        .map_err(token_error)?;

    if principals::is_token_revoked(pool, claims.jti)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::AuthTokenRevoked, "token revoked"));
    }

    let row = principals::fetch_principal(pool, claims.sub)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::AuthInvalidCredentials, "unknown principal"))?;
    if row.banned {
        return Err(ApiError::new(ErrorCode::UserBanned, "account is banned"));
    }

    principals::revoke_token(pool, claims.jti, claims.expires_at())
        .await
        .map_err(internal)?;

    signer
        .mint_pair(row.principal_id, row.kind, row.firm_id, row.firm_role, Utc::now())
        .map_err(internal)
}

/// Revoke either kind of token by its `jti`. An already-expired token is a
/// no-op success.
pub async fn revoke(pool: &PgPool, signer: &TokenSigner, token: &str) -> Result<(), ApiError> {
    let claims = match signer.verify(token, TokenUse::Access) {
        Ok(c) => c,
        Err(TokenError::WrongUse) => signer
            .verify(token, TokenUse::Refresh)
            .map_err(token_error)?,
        Err(TokenError::Expired) => return Ok(()),
        Err(e) => return Err(token_error(e)),
    };
    principals::revoke_token(pool, claims.jti, claims.expires_at())
        .await
        .map_err(internal)
}

/// Verify an access token and check the revocation list. Every
/// authenticated call goes through this.
pub async fn verify_access(
    pool: &PgPool,
    signer: &TokenSigner,
    token: &str,
) -> Result<Claims, ApiError> {
    let claims = signer.verify(token, TokenUse::Access).map_err(token_error)?;
    if principals::is_token_revoked(pool, claims.jti)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::AuthTokenRevoked, "token revoked"));
    }
    Ok(claims)
}

// ---------------------------------------------------------------------------
// Account status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct AccountStatus {
    pub principal_id: Uuid,
    pub verified: bool,
    pub suspended: bool,
    pub banned: bool,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_minutes: Option<i64>,
    pub failed_login_count: i32,
}

pub async fn account_status(pool: &PgPool, principal_id: Uuid) -> Result<AccountStatus, ApiError> {
    let row = principals::fetch_principal(pool, principal_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::AuthInvalidCredentials, "unknown principal"))?;

    let now = Utc::now();
    let state = lockout_state_of(&row);
    let locked = state.is_locked(now);
    let retry_after_minutes = match evaluate_login(state, now) {
        LoginGate::Locked {
            retry_after_minutes,
        } => Some(retry_after_minutes),
        LoginGate::Allowed(_) => None,
    };

    Ok(AccountStatus {
        principal_id,
        verified: row.verified,
        suspended: row.suspended,
        banned: row.banned,
        locked,
        retry_after_minutes,
        failed_login_count: row.failed_login_count,
    })
}

// ---------------------------------------------------------------------------
// Unlock OTP
// ---------------------------------------------------------------------------

async fn find_by_identifier(pool: &PgPool, identifier: &str) -> Result<Option<PrincipalRow>> {
    if identifier.contains('@') {
        principals::fetch_principal_by_email(pool, identifier).await
    } else {
        principals::fetch_principal_by_phone(pool, identifier).await
    }
}

/// Generate and deliver an unlock code. The challenge is committed before
/// delivery is attempted, so a delivery retry never regenerates the code
/// mid-flight; a repeated request explicitly invalidates the prior one.
pub async fn request_unlock_otp(
    pool: &PgPool,
    delivery: &dyn OtpDelivery,
    cfg: &LockoutConfig,
    identifier: &str,
    channel: DeliveryChannel,
) -> Result<(), ApiError> {
    let now = Utc::now();
    let Some(found) = find_by_identifier(pool, identifier).await.map_err(internal)? else {
        // Do not reveal whether the identifier exists.
        return Ok(());
    };

    let code = generate_code();
    let digest = digest_code(&code);

    let address = {
        let mut tx = pool.begin().await.context("begin otp tx").map_err(internal)?;
        let row = principals::fetch_principal_for_update(&mut tx, found.principal_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::AuthInvalidCredentials, "unknown principal"))?;

        let state = match issue_otp(cfg, lockout_state_of(&row), now, digest) {
            OtpIssue::Issued(state) => state,
            OtpIssue::NotLocked => {
                return Err(ApiError::new(
                    ErrorCode::AuthInvalidOtp,
                    "account is not locked; nothing to unlock",
                ));
            }
        };
        persist_lockout_state(&mut tx, row.principal_id, &state)
            .await
            .map_err(internal)?;
        tx.commit().await.context("commit otp tx").map_err(internal)?;

        match channel {
            DeliveryChannel::Sms => row.phone,
            DeliveryChannel::Email => row.email,
        }
    };

    info!(principal_id = %found.principal_id, %channel, "unlock otp issued");
    let body = format!("Your unlock code is {code}. It expires in 10 minutes.");
    send_with_retry(delivery, channel, &address, &body)
        .await
        .map_err(|e| {
            warn!("otp delivery exhausted retries: {e}");
            ApiError::new(ErrorCode::SysExternalUnavailable, "could not deliver code")
        })
}

pub async fn verify_unlock_otp(
    pool: &PgPool,
    identifier: &str,
    code: &str,
) -> Result<(), ApiError> {
    let now = Utc::now();
    let Some(found) = find_by_identifier(pool, identifier).await.map_err(internal)? else {
        return Err(ApiError::new(ErrorCode::OtpExpired, "no active code"));
    };

    let mut tx = pool.begin().await.context("begin otp verify tx").map_err(internal)?;
    let row = principals::fetch_principal_for_update(&mut tx, found.principal_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::OtpExpired, "no active code"))?;

    let verdict = verify_otp(lockout_state_of(&row), now, &digest_code(code));
    let (state, result): (LockoutState, Result<(), ApiError>) = match verdict {
        OtpVerdict::Unlocked(state) => {
            info!(principal_id = %row.principal_id, "account unlocked via otp");
            (state, Ok(()))
        }
        OtpVerdict::WrongCode {
            state,
            attempts_remaining,
        } => (
            state,
            Err(ApiError::new(ErrorCode::AuthInvalidOtp, "incorrect code")
                .with_attempts_remaining(attempts_remaining)),
        ),
        OtpVerdict::AttemptsExhausted(state) => (
            state,
            Err(ApiError::new(
                ErrorCode::AuthTooManyAttempts,
                "too many incorrect codes; request a new one",
            )),
        ),
        OtpVerdict::Expired => {
            return Err(ApiError::new(ErrorCode::OtpExpired, "code expired"));
        }
    };

    persist_lockout_state(&mut tx, row.principal_id, &state)
        .await
        .map_err(internal)?;
    tx.commit().await.context("commit otp verify tx").map_err(internal)?;
    result
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub struct Registration<'a> {
    pub kind: PrincipalKind,
    pub email: &'a str,
    pub phone: &'a str,
    pub password: &'a str,
    pub firm_id: Option<Uuid>,
    pub firm_role: Option<FirmRole>,
}

/// Create an unverified principal and deliver a verification code to the
/// registered phone.
pub async fn register(
    pool: &PgPool,
    delivery: &dyn OtpDelivery,
    reg: Registration<'_>,
) -> Result<Uuid, ApiError> {
    let violations = validate_password_policy(reg.password);
    if !violations.is_empty() {
        let mut err = ApiError::new(ErrorCode::AuthInvalidCredentials, "password too weak");
        err.details = serde_json::json!({ "violations": violations });
        return Err(err);
    }

    let principal_id = Uuid::new_v4();
    let hash = hash_password(reg.password).map_err(internal)?;
    let new = NewPrincipal {
        principal_id,
        kind: reg.kind,
        email: reg.email.to_string(),
        phone: reg.phone.to_string(),
        password_hash: hash,
        firm_id: reg.firm_id,
        firm_role: reg.firm_role,
    };

    if let Err(e) = principals::insert_principal(pool, &new).await {
        if aegis_db::is_unique_constraint_violation(&e, "uq_principals_email") {
            return Err(ApiError::new(ErrorCode::UserEmailExists, "email already registered"));
        }
        if aegis_db::is_unique_constraint_violation(&e, "uq_principals_phone") {
            return Err(ApiError::new(ErrorCode::UserPhoneExists, "phone already registered"));
        }
        return Err(internal(e.into()));
    }

    // Verification challenge reuses the OTP columns; the account is not
    // locked, so the unlock path cannot consume it by accident (it checks
    // the lock first).
    let code = generate_code();
    let digest = digest_code(&code);
    let mut tx = pool.begin().await.context("begin verify tx").map_err(internal)?;
    principals::set_unlock_otp(&mut tx, principal_id, &digest, Utc::now() + chrono::Duration::minutes(10), 3)
        .await
        .map_err(internal)?;
    tx.commit().await.context("commit verify tx").map_err(internal)?;

    let body = format!("Your verification code is {code}.");
    send_with_retry(delivery, DeliveryChannel::Sms, reg.phone, &body)
        .await
        .map_err(|e| {
            warn!("verification delivery failed: {e}");
            ApiError::new(ErrorCode::SysExternalUnavailable, "could not deliver code")
        })?;

    info!(%principal_id, "principal registered (unverified)");
    Ok(principal_id)
}

/// Confirm the phone-verification code and flip the verified flag.
pub async fn confirm_registration(pool: &PgPool, phone: &str, code: &str) -> Result<(), ApiError> {
    let row = principals::fetch_principal_by_phone(pool, phone)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::OtpExpired, "no active code"))?;

    let now = Utc::now();
    let live = matches!(
        (&row.otp_digest, row.otp_expires_at),
        (Some(d), Some(exp)) if now < exp && *d == digest_code(code)
    );
    if !live {
        return Err(ApiError::new(ErrorCode::AuthInvalidOtp, "incorrect or expired code"));
    }

    let mut tx = pool.begin().await.context("begin confirm tx").map_err(internal)?;
    principals::clear_unlock_otp(&mut tx, row.principal_id)
        .await
        .map_err(internal)?;
    tx.commit().await.context("commit confirm tx").map_err(internal)?;
    principals::mark_verified(pool, row.principal_id)
        .await
        .map_err(internal)?;
    Ok(())
}
