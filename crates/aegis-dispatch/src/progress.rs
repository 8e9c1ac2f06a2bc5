//! Responder progress transitions, cancellation, and the call-queue path.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use aegis_db::firms;
use aegis_db::requests::{self, PanicRequestRow};
use aegis_geo::haversine_km;
use aegis_types::{
    ApiError, ErrorCode, FirmRole, GeoPoint, PrincipalKind, RequestStatus, ServiceType,
};

use crate::allocate::release_previous_provider;
use crate::transitions::{validate_transition, Actor, TransitionRole};

/// Advisory arrival radius. Beyond this the transition still succeeds but
/// the status update carries a warning note.
const ARRIVAL_RADIUS_KM: f64 = 0.5;

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("progress storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

/// Is this actor the assigned responder for the request?
pub(crate) async fn responder_is_assigned(
    pool: &PgPool,
    req: &PanicRequestRow,
    actor: &Actor,
) -> Result<bool> {
    if let Some(handler) = req.call_handler_id {
        return Ok(handler == actor.principal_id);
    }
    if let Some(team_id) = req.assigned_team_id {
        return firms::is_team_participant(pool, team_id, actor.principal_id).await;
    }
    if let Some(provider_id) = req.assigned_provider_id {
        let Some(provider) = firms::fetch_provider(pool, provider_id).await? else {
            return Ok(false);
        };
        // Provider units are crewed by the owning firm's field staff.
        return Ok(actor.kind == PrincipalKind::FirmMember
            && actor.firm_id == Some(provider.firm_id)
            && matches!(actor.role, Some(FirmRole::FieldAgent | FirmRole::TeamLeader)));
    }
    Ok(false)
}

/// A responder-driven transition: accept, en_route, arrived, in_progress.
/// Completion has its own path (`complete.rs`) because it requires
/// feedback.
pub async fn progress_request(
    pool: &PgPool,
    actor: &Actor,
    request_id: Uuid,
    to: RequestStatus,
    position: Option<GeoPoint>,
    message: Option<&str>,
) -> Result<RequestStatus, ApiError> {
    let mut tx = pool.begin().await.map_err(|e| internal(e.into()))?;
    let req = requests::fetch_request_for_update(&mut tx, request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "request not found"))?;

    validate_transition(req.status, to, TransitionRole::AssignedResponder)?;
    if !responder_is_assigned(pool, &req, actor).await.map_err(internal)? {
        return Err(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "not the assigned responder",
        ));
    }

    // Arrival proximity is advisory: noted when GPS is present and far,
    // never enforced.
    let note = if to == RequestStatus::Arrived {
        match position {
            Some(pos) if haversine_km(pos, req.point) > ARRIVAL_RADIUS_KM => {
                Some("arrival reported beyond 500 m of the request point")
            }
            _ => message,
        }
    } else {
        message
    };

    requests::write_request_status(&mut tx, request_id, to, Utc::now())
        .await
        .map_err(internal)?;
    requests::append_status_update(&mut tx, request_id, to, note, position, Some(actor.principal_id))
        .await
        .map_err(internal)?;
    tx.commit().await.map_err(|e| internal(e.into()))?;

    info!(%request_id, status = %to, responder = %actor.principal_id, "request progressed");
    Ok(to)
}

/// Cancel a pending or allocated request. `as_system` marks the timeout
/// sweep; otherwise the actor must be the requester or office staff.
pub async fn cancel_request(
    pool: &PgPool,
    actor: Option<&Actor>,
    request_id: Uuid,
    reason: &str,
) -> Result<(), ApiError> {
    let mut tx = pool.begin().await.map_err(|e| internal(e.into()))?;
    let req = requests::fetch_request_for_update(&mut tx, request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "request not found"))?;

    let role = match actor {
        None => TransitionRole::System,
        Some(a) if a.principal_id == req.requester_user_id => TransitionRole::Requester,
        Some(a) if a.is_office_staff() => TransitionRole::OfficeStaff,
        Some(_) => {
            return Err(ApiError::new(
                ErrorCode::AuthInsufficientPermission,
                "not allowed to cancel this request",
            ))
        }
    };
    validate_transition(req.status, RequestStatus::Cancelled, role)?;

    release_previous_provider(&mut tx, &req).await.map_err(internal)?;
    requests::write_request_status(&mut tx, request_id, RequestStatus::Cancelled, Utc::now())
        .await
        .map_err(internal)?;
    requests::append_status_update(
        &mut tx,
        request_id,
        RequestStatus::Cancelled,
        Some(reason),
        None,
        actor.map(|a| a.principal_id),
    )
    .await
    .map_err(internal)?;
    tx.commit().await.map_err(|e| internal(e.into()))?;

    info!(%request_id, reason, "request cancelled");
    Ok(())
}

/// Office staff takes a call-type request onto the call queue: the request
/// moves to Allocated with the caller bound as `call_handler_id`, and the
/// handler then walks the normal acceptance path.
pub async fn handle_call(
    pool: &PgPool,
    actor: &Actor,
    request_id: Uuid,
) -> Result<RequestStatus, ApiError> {
    if !actor.is_office_staff() {
        return Err(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "only office staff may handle calls",
        ));
    }

    let mut tx = pool.begin().await.map_err(|e| internal(e.into()))?;
    let req = requests::fetch_request_for_update(&mut tx, request_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::ReqNotFound, "request not found"))?;

    if req.service_type != ServiceType::Call {
        return Err(ApiError::new(
            ErrorCode::ReqInvalidAssignment,
            "only call-type requests use the call queue",
        ));
    }
    validate_transition(req.status, RequestStatus::Allocated, TransitionRole::OfficeStaff)?;

    requests::set_call_handler(&mut tx, request_id, actor.principal_id)
        .await
        .map_err(internal)?;
    requests::write_request_status(&mut tx, request_id, RequestStatus::Allocated, Utc::now())
        .await
        .map_err(internal)?;
    requests::append_status_update(
        &mut tx,
        request_id,
        RequestStatus::Allocated,
        Some("handed to call queue"),
        None,
        Some(actor.principal_id),
    )
    .await
    .map_err(internal)?;
    tx.commit().await.map_err(|e| internal(e.into()))?;

    info!(%request_id, handler = %actor.principal_id, "call request handed to queue");
    Ok(RequestStatus::Allocated)
}
