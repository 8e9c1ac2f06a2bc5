//! Transactional application of the fine policy.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use aegis_db::principals;
use aegis_db::requests;
use aegis_gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use aegis_types::{ApiError, ErrorCode};

use crate::policy::FinePolicy;

#[derive(Debug, Clone)]
pub struct PrankOutcome {
    pub total_count: i32,
    pub recent_count: i64,
    pub fine_id: Option<Uuid>,
    pub fine_cents: Option<i64>,
    pub suspended: bool,
    pub banned: bool,
}

/// Consume a prank flag inside the caller's transaction (the same one that
/// wrote the feedback row and incremented the counter). `total_count` is
/// the post-increment value returned by `increment_prank_count`.
pub async fn apply_prank_flag(
    tx: &mut Transaction<'_, Postgres>,
    policy: &FinePolicy,
    user_id: Uuid,
    total_count: i32,
) -> Result<PrankOutcome> {
    let now = Utc::now();
    let recent = requests::count_recent_pranks(
        tx,
        user_id,
        Duration::days(policy.recent_window_days),
        now,
    )
    .await?;

    let fine_cents = policy.fine_amount_cents(recent.max(0) as u32);
    let fine_id = match fine_cents {
        Some(amount) => {
            let id = Uuid::new_v4();
            requests::insert_fine(tx, id, user_id, amount, "prank_accumulation").await?;
            info!(%user_id, amount_cents = amount, "prank fine created");
            Some(id)
        }
        None => None,
    };

    let unpaid = requests::count_unpaid_fines(tx, user_id).await?;
    let decision = policy.evaluate(total_count.max(0) as u32, recent.max(0) as u32, unpaid > 0);

    if decision.suspend {
        principals::set_suspended(tx, user_id, true).await?;
        warn!(%user_id, total_count, "principal suspended for prank accumulation");
    }
    if decision.ban {
        principals::set_banned(tx, user_id).await?;
        warn!(%user_id, total_count, "principal permanently banned");
    }

    Ok(PrankOutcome {
        total_count,
        recent_count: recent,
        fine_id,
        fine_cents,
        suspended: decision.suspend,
        banned: decision.ban,
    })
}

/// Pay a fine: external charge first (idempotent by fine id), then a short
/// transaction marking it paid and clearing suspension if nothing unpaid
/// remains. The ban is never cleared here.
pub async fn pay_fine(
    pool: &PgPool,
    gateway: &dyn PaymentGateway,
    fine_id: Uuid,
    payment_payload: serde_json::Value,
) -> Result<(), ApiError> {
    let fine = requests::fetch_fine(pool, fine_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "fine not found"))?;
    if fine.paid {
        return Ok(());
    }

    let outcome = gateway
        .charge(&ChargeRequest {
            amount_cents: fine.amount_cents,
            currency: "ZAR".to_string(),
            idempotency_key: format!("fine-{fine_id}"),
            payload: payment_payload,
        })
        .await
        .map_err(|e| {
            warn!("fine payment gateway unavailable: {e}");
            ApiError::new(ErrorCode::PayGatewayUnavailable, "payment gateway unavailable")
        })?;

    if let ChargeOutcome::Failure { code, message } = outcome {
        let mut err = ApiError::new(ErrorCode::PayFailed, message);
        err.details = serde_json::json!({ "gateway_code": code });
        return Err(err);
    }

    let mut tx = pool.begin().await.context("begin pay_fine tx").map_err(internal)?;

    // Lock the principal row first: suspension evaluation must serialise
    // with concurrent prank events for the same user.
    principals::fetch_principal_for_update(&mut tx, fine.user_id)
        .await
        .map_err(internal)?;

    let newly_paid = requests::mark_fine_paid(&mut tx, fine_id, Utc::now())
        .await
        .map_err(internal)?;
    if !newly_paid {
        // Raced with another payer; the other transaction settles standing.
        tx.commit().await.context("commit pay_fine tx").map_err(internal)?;
        return Ok(());
    }

    let unpaid = requests::count_unpaid_fines(&mut tx, fine.user_id)
        .await
        .map_err(internal)?;
    if unpaid == 0 {
        principals::set_suspended(&mut tx, fine.user_id, false)
            .await
            .map_err(internal)?;
        info!(user_id = %fine.user_id, "suspension cleared after last fine paid");
    }

    tx.commit().await.context("commit pay_fine tx").map_err(internal)?;
    Ok(())
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("fines storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}
