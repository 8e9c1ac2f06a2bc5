//! Completion with feedback, prank propagation, and provider release.
//!
//! One transaction: the status write, the unique feedback row, the prank
//! counter increment, any fine the policy produces, and the standing flags
//! all commit together.

use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use aegis_db::{principals, requests};
use aegis_fines::{apply_prank_flag, FinePolicy, PrankOutcome};
use aegis_types::{ApiError, ErrorCode, RequestStatus};

use crate::allocate::release_previous_provider;
use crate::progress::responder_is_assigned;
use crate::transitions::{validate_transition, Actor, TransitionRole};

#[derive(Debug, Clone)]
pub struct Feedback {
    pub is_prank: bool,
    pub rating: Option<i32>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionReceipt {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub prank: Option<PrankOutcome>,
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("completion storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

pub async fn complete(
    pool: &PgPool,
    policy: &FinePolicy,
    actor: &Actor,
    request_id: Uuid,
    feedback: &Feedback,
) -> Result<CompletionReceipt, ApiError> {
    if let Some(r) = feedback.rating {
        if !(1..=5).contains(&r) {
            return Err(ApiError::new(
                ErrorCode::ReqInvalidFeedback,
                "rating must be between 1 and 5",
            ));
        }
    }

    let mut tx = pool.begin().await.map_err(|e| internal(e.into()))?;
    let req = requests::fetch_request_for_update(&mut tx, request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "request not found"))?;

    validate_transition(req.status, RequestStatus::Completed, TransitionRole::AssignedResponder)?;
    if !responder_is_assigned(pool, &req, actor).await.map_err(internal)? {
        return Err(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "not the assigned responder",
        ));
    }

    let wrote = requests::insert_feedback(
        &mut tx,
        request_id,
        actor.principal_id,
        feedback.is_prank,
        feedback.rating,
        feedback.comments.as_deref(),
    )
    .await
    .map_err(internal)?;
    if !wrote {
        // A feedback row already exists; the transition guard above means
        // this is a replayed call racing its own commit.
        return Err(ApiError::new(
            ErrorCode::InvalidStatusTransition,
            "feedback already recorded",
        ));
    }

    let now = Utc::now();
    requests::write_request_status(&mut tx, request_id, RequestStatus::Completed, now)
        .await
        .map_err(internal)?;
    requests::append_status_update(
        &mut tx,
        request_id,
        RequestStatus::Completed,
        feedback.comments.as_deref(),
        None,
        Some(actor.principal_id),
    )
    .await
    .map_err(internal)?;

    release_previous_provider(&mut tx, &req).await.map_err(internal)?;

    let prank = if feedback.is_prank {
        // Row-lock the author, then run the fine policy in this same
        // transaction.
        principals::fetch_principal_for_update(&mut tx, req.requester_user_id)
            .await
            .map_err(internal)?;
        let total = principals::increment_prank_count(&mut tx, req.requester_user_id)
            .await
            .map_err(internal)?;
        Some(
            apply_prank_flag(&mut tx, policy, req.requester_user_id, total)
                .await
                .map_err(internal)?,
        )
    } else {
        None
    };

    tx.commit().await.map_err(|e| internal(e.into()))?;

    info!(
        %request_id,
        is_prank = feedback.is_prank,
        rating = ?feedback.rating,
        "request completed"
    );
    Ok(CompletionReceipt {
        request_id,
        status: RequestStatus::Completed,
        prank,
    })
}
