//! Allocation and reassignment.
//!
//! One primitive drives both: validate the assignee against the caller's
//! firm, bind it, flip the provider busy, and record the pre-computed
//! distance/ETA. An assignment either fully applies or not at all: the
//! provider status flip and the assignment row ride the same transaction
//! as the request row.

use anyhow::Result;
use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use aegis_db::firms;
use aegis_db::requests::{self, PanicRequestRow};
use aegis_geo::{eta_minutes, haversine_km};
use aegis_types::{ApiError, ErrorCode, GeoPoint, ProviderStatus, RequestStatus, ServiceType};

use crate::transitions::{validate_transition, Actor, TransitionRole};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AllocationTarget {
    Team(Uuid),
    Provider(Uuid),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AllocationReceipt {
    pub request_id: Uuid,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("allocation storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

pub async fn allocate(
    pool: &PgPool,
    actor: &Actor,
    request_id: Uuid,
    target: AllocationTarget,
    notes: Option<&str>,
    caller_position: Option<GeoPoint>,
) -> Result<AllocationReceipt, ApiError> {
    assign(pool, actor, request_id, target, notes, caller_position, false).await
}

/// Reassignment: the same primitive against a non-terminal request. The
/// previous provider (if any) is released back to `available` iff it holds
/// no other active assignment, and the request returns to the acceptance
/// cycle with a fresh ETA.
pub async fn reassign(
    pool: &PgPool,
    actor: &Actor,
    request_id: Uuid,
    target: AllocationTarget,
    notes: Option<&str>,
) -> Result<AllocationReceipt, ApiError> {
    assign(pool, actor, request_id, target, notes, None, true).await
}

#[allow(clippy::too_many_arguments)]
async fn assign(
    pool: &PgPool,
    actor: &Actor,
    request_id: Uuid,
    target: AllocationTarget,
    notes: Option<&str>,
    caller_position: Option<GeoPoint>,
    is_reassign: bool,
) -> Result<AllocationReceipt, ApiError> {
    if !actor.is_office_staff() {
        return Err(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "only firm office staff may allocate",
        ));
    }
    let caller_firm = actor
        .firm_id
        .ok_or_else(|| ApiError::new(ErrorCode::AuthInsufficientPermission, "no firm"))?;

    let mut tx = pool.begin().await.map_err(|e| internal(e.into()))?;
    let req = requests::fetch_request_for_update(&mut tx, request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "request not found"))?;

    if is_reassign {
        if req.status.is_terminal() {
            return Err(ApiError::new(
                ErrorCode::InvalidStatusTransition,
                "request already settled",
            ));
        }
        release_previous_provider(&mut tx, &req).await.map_err(internal)?;
    } else {
        validate_transition(req.status, RequestStatus::Allocated, TransitionRole::OfficeStaff)?;
    }

    // No field dispatch for call-type requests; the call queue path is
    // `handle_call`.
    if req.service_type == ServiceType::Call {
        return Err(ApiError::new(
            ErrorCode::InvalidAssignmentForCall,
            "call requests go to the office call queue, not field dispatch",
        ));
    }

    let (team_id, provider_id, distance_km, eta) = match target {
        AllocationTarget::Team(team_id) => {
            let team = firms::fetch_team(pool, team_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::ReqInvalidAssignment, "unknown team"))?;
            if team.firm_id != caller_firm {
                return Err(ApiError::new(
                    ErrorCode::ReqInvalidAssignment,
                    "team belongs to another firm",
                ));
            }
            (Some(team_id), None, None, None)
        }
        AllocationTarget::Provider(provider_id) => {
            let provider = firms::fetch_provider(pool, provider_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::ReqInvalidAssignment, "unknown provider"))?;
            if provider.firm_id != caller_firm || !provider.active {
                return Err(ApiError::new(
                    ErrorCode::ReqInvalidAssignment,
                    "provider unavailable to this firm",
                ));
            }
            let ptype = firms::fetch_provider_type(pool, provider.provider_type_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| {
                    ApiError::new(ErrorCode::ReqInvalidAssignment, "provider type missing")
                })?;
            if ptype.service_type != req.service_type {
                return Err(ApiError::new(
                    ErrorCode::ReqInvalidAssignment,
                    "provider type does not match the requested service",
                ));
            }

            let became_busy = firms::transition_provider_status(
                &mut tx,
                provider_id,
                ProviderStatus::Available,
                ProviderStatus::Busy,
            )
            .await
            .map_err(internal)?;
            if !became_busy {
                return Err(ApiError::new(
                    ErrorCode::ReqInvalidAssignment,
                    "provider is not available",
                ));
            }

            let d = haversine_km(provider.current_position, req.point);
            let eta = eta_minutes(d);
            if let Err(e) =
                requests::insert_provider_assignment(&mut tx, request_id, provider_id, d, eta as i32)
                    .await
            {
                if aegis_db::is_unique_constraint_violation(&e, "uq_provider_single_active_assignment")
                {
                    return Err(ApiError::new(
                        ErrorCode::ReqInvalidAssignment,
                        "provider already holds an active assignment",
                    ));
                }
                return Err(internal(e.into()));
            }
            (None, Some(provider_id), Some(d), Some(eta))
        }
    };

    requests::write_request_assignment(&mut tx, request_id, team_id, provider_id)
        .await
        .map_err(internal)?;
    requests::write_request_status(&mut tx, request_id, RequestStatus::Allocated, Utc::now())
        .await
        .map_err(internal)?;
    requests::append_status_update(
        &mut tx,
        request_id,
        RequestStatus::Allocated,
        notes.or(if is_reassign { Some("reassigned") } else { None }),
        caller_position,
        Some(actor.principal_id),
    )
    .await
    .map_err(internal)?;

    tx.commit().await.map_err(|e| internal(e.into()))?;

    info!(
        %request_id,
        ?team_id,
        ?provider_id,
        reassigned = is_reassign,
        "request allocated"
    );
    Ok(AllocationReceipt {
        request_id,
        status: RequestStatus::Allocated,
        team_id,
        provider_id,
        distance_km,
        eta_minutes: eta,
    })
}

/// Release the previously assigned provider back to `available` unless it
/// still holds another active assignment.
pub(crate) async fn release_previous_provider(
    tx: &mut Transaction<'_, Postgres>,
    req: &PanicRequestRow,
) -> Result<()> {
    let Some(provider_id) = req.assigned_provider_id else {
        return Ok(());
    };
    requests::release_provider_assignment(tx, req.request_id, provider_id).await?;
    if !requests::provider_has_active_assignment(tx, provider_id).await? {
        firms::transition_provider_status(tx, provider_id, ProviderStatus::Busy, ProviderStatus::Available)
            .await?;
    }
    Ok(())
}
