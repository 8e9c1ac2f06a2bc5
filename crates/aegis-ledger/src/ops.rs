//! Ledger operations.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use aegis_db::firms::{self, apply_credit_delta};
use aegis_db::groups;
use aegis_db::subscriptions::{self, ProductRow};
use aegis_geo::{firm_covers_point, CoverageSnapshot};
use aegis_types::{ApiError, ErrorCode, FirmVerification};
use aegis_gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};

use crate::standing::{evaluate_standing, extended_expiry, SubscriptionStanding};

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("ledger storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

fn payment_unavailable(e: aegis_gateway::PaymentError) -> ApiError {
    warn!("payment gateway unavailable: {e}");
    ApiError::new(ErrorCode::PayGatewayUnavailable, "payment gateway unavailable")
}

fn charge_failed(code: String, message: String) -> ApiError {
    let mut err = ApiError::new(ErrorCode::PayFailed, message);
    err.details = serde_json::json!({ "gateway_code": code });
    err
}

// ---------------------------------------------------------------------------
// Credits
// ---------------------------------------------------------------------------

/// Charge externally, then apply the credit atomically. The gateway's
/// external id keys the apply: a retried call that already landed is a
/// no-op success.
pub async fn purchase_credits(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    firm_id: Uuid,
    amount: i64,
    price_cents: i64,
    payment_payload: Value,
    idempotency_key: &str,
) -> Result<i64, ApiError> {
    if amount <= 0 {
        return Err(ApiError::new(ErrorCode::PayFailed, "credit amount must be positive"));
    }
    let firm = firms::fetch_firm(pool, firm_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::FirmNotApproved, "unknown firm"))?;
    if firm.verification_status != FirmVerification::Approved {
        return Err(ApiError::new(ErrorCode::FirmNotApproved, "firm not approved"));
    }

    // External call strictly outside any transaction.
    let outcome = gateway
        .charge(&ChargeRequest {
            amount_cents: price_cents,
            currency: "ZAR".to_string(),
            idempotency_key: idempotency_key.to_string(),
            payload: payment_payload,
        })
        .await
        .map_err(payment_unavailable)?;

    let external_id = match outcome {
        ChargeOutcome::Success { external_id } => external_id,
        ChargeOutcome::Failure { code, message } => return Err(charge_failed(code, message)),
    };

    if firms::credit_external_ref_exists(pool, &external_id)
        .await
        .map_err(internal)?
    {
        // Retried apply of an already-settled charge.
        let firm = firms::fetch_firm(pool, firm_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::FirmNotApproved, "unknown firm"))?;
        return Ok(firm.credit_balance);
    }

    let mut tx = pool.begin().await.context("begin purchase_credits tx").map_err(internal)?;
    firms::fetch_firm_for_update(&mut tx, firm_id)
        .await
        .map_err(internal)?;
    let balance = apply_credit_delta(&mut tx, firm_id, amount, "credit_purchase", Some(&external_id))
        .await
        .map_err(internal)?;
    tx.commit().await.context("commit purchase_credits tx").map_err(internal)?;

    info!(%firm_id, amount, balance, "credits purchased");
    Ok(balance)
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

/// Create a product. Does not debit credits; that happens at application.
pub async fn create_product(
    pool: &PgPool,
    firm_id: Uuid,
    name: &str,
    max_users: i32,
    price_cents: i64,
    credit_cost: i64,
) -> Result<Uuid, ApiError> {
    let firm = firms::fetch_firm(pool, firm_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::FirmNotApproved, "unknown firm"))?;
    if firm.verification_status != FirmVerification::Approved {
        return Err(ApiError::new(ErrorCode::FirmNotApproved, "firm not approved"));
    }
    if max_users <= 0 {
        return Err(ApiError::new(ErrorCode::SubUserLimitExceeded, "max_users must be positive"));
    }

    let product_id = Uuid::new_v4();
    subscriptions::insert_product(
        pool,
        &ProductRow {
            product_id,
            firm_id,
            name: name.to_string(),
            max_users,
            price_cents,
            credit_cost,
            active: true,
        },
    )
    .await
    .map_err(internal)?;
    Ok(product_id)
}

// ---------------------------------------------------------------------------
// Stored subscriptions
// ---------------------------------------------------------------------------

/// Buy a stored subscription: external charge, then an unapplied
/// entitlement row. Firm credits are untouched until application.
pub async fn purchase_subscription(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    user_id: Uuid,
    product_id: Uuid,
    payment_payload: Value,
    idempotency_key: &str,
) -> Result<Uuid, ApiError> {
    let product = subscriptions::fetch_product(pool, product_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::SubProductNotFound, "product not found"))?;
    if !product.active {
        return Err(ApiError::new(ErrorCode::SubProductNotFound, "product not available"));
    }

    let outcome = gateway
        .charge(&ChargeRequest {
            amount_cents: product.price_cents,
            currency: "ZAR".to_string(),
            idempotency_key: idempotency_key.to_string(),
            payload: payment_payload,
        })
        .await
        .map_err(payment_unavailable)?;
    if let ChargeOutcome::Failure { code, message } = outcome {
        return Err(charge_failed(code, message));
    }

    let stored_id = Uuid::new_v4();
    subscriptions::insert_stored_subscription(pool, stored_id, user_id, product_id)
        .await
        .map_err(internal)?;
    info!(%user_id, %product_id, %stored_id, "stored subscription purchased");
    Ok(stored_id)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApplyReceipt {
    pub group_id: Uuid,
    pub expires_at: chrono::DateTime<Utc>,
    pub firm_credit_balance: i64,
}

/// Apply a stored subscription to a group. All five preconditions are
/// checked under row-locks on the stored subscription and the firm; the
/// debit, the applied flag, and the group expiry commit together.
pub async fn apply_subscription(
    pool: &PgPool,
    snapshot: &CoverageSnapshot,
    settings: &aegis_config::Settings,
    user_id: Uuid,
    stored_subscription_id: Uuid,
    group_id: Uuid,
) -> Result<ApplyReceipt, ApiError> {
    let now = Utc::now();

    let mut tx = pool.begin().await.context("begin apply tx").map_err(internal)?;

    // Lock order: stored subscription, then firm. Both lock points are
    // uniform across callers so concurrent applies cannot deadlock.
    let stored = subscriptions::fetch_stored_subscription_for_update(&mut tx, stored_subscription_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::SubProductNotFound, "stored subscription not found"))?;

    if stored.user_id != user_id {
        return Err(ApiError::new(ErrorCode::UserGroupNotOwned, "not your subscription"));
    }
    if stored.applied {
        return Err(ApiError::new(ErrorCode::SubAlreadyApplied, "subscription already applied"));
    }

    let product = subscriptions::fetch_product(pool, stored.product_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::SubProductNotFound, "product not found"))?;

    if !groups::user_administers_group(pool, group_id, user_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::UserGroupNotOwned, "group not owned or administered"));
    }

    let phone_count = groups::count_group_phones(pool, group_id).await.map_err(internal)?;
    if phone_count > product.max_users as i64 {
        return Err(ApiError::new(
            ErrorCode::SubUserLimitExceeded,
            "group has more phone numbers than the product allows",
        ));
    }

    let group = groups::fetch_group_for_update(&mut tx, group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::UserGroupNotOwned, "unknown group"))?;

    if !firm_covers_point(snapshot, product.firm_id, group.point) {
        return Err(ApiError::new(
            ErrorCode::LocationNotCovered,
            "group location is outside the firm's coverage",
        ));
    }

    let firm = firms::fetch_firm_for_update(&mut tx, product.firm_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::FirmNotApproved, "unknown firm"))?;
    if firm.credit_balance < product.credit_cost {
        return Err(ApiError::new(ErrorCode::InsufficientCredits, "firm has insufficient credits"));
    }

    let balance = apply_credit_delta(
        &mut tx,
        product.firm_id,
        -product.credit_cost,
        "subscription_application",
        None,
    )
    .await
    .map_err(internal)?;

    let flipped = subscriptions::mark_stored_subscription_applied(&mut tx, stored_subscription_id, group_id, now)
        .await
        .map_err(internal)?;
    if !flipped {
        // The row-lock should make this unreachable; refuse rather than
        // double-apply.
        return Err(ApiError::new(ErrorCode::SubAlreadyApplied, "subscription already applied"));
    }

    let expires_at = extended_expiry(
        group.subscription_expires_at,
        now,
        settings.subscription.window_days,
    );
    groups::set_group_subscription(&mut tx, group_id, stored_subscription_id, expires_at)
        .await
        .map_err(internal)?;

    tx.commit().await.context("commit apply tx").map_err(internal)?;

    info!(%group_id, %stored_subscription_id, %expires_at, "subscription applied");
    Ok(ApplyReceipt {
        group_id,
        expires_at,
        firm_credit_balance: balance,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub async fn validate_subscription(
    pool: &PgPool,
    settings: &aegis_config::Settings,
    group_id: Uuid,
) -> Result<SubscriptionStanding, ApiError> {
    let group = groups::fetch_group(pool, group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::UserGroupNotOwned, "unknown group"))?;
    Ok(evaluate_standing(
        group.subscription_expires_at,
        settings.subscription.grace_days,
        Utc::now(),
    ))
}

/// Resolve the firm backing a group's active subscription.
pub async fn subscription_firm_for_group(pool: &PgPool, group_id: Uuid) -> Result<Option<Uuid>> {
    let group = groups::fetch_group(pool, group_id).await?;
    let Some(group) = group else { return Ok(None) };
    let Some(sub_id) = group.subscription_id else {
        return Ok(None);
    };
    let Some(stored) = subscriptions::fetch_stored_subscription(pool, sub_id).await? else {
        return Ok(None);
    };
    let product = subscriptions::fetch_product(pool, stored.product_id).await?;
    Ok(product.map(|p| p.firm_id))
}
