//! Axum router and all HTTP handlers.
//!
//! `build_router` is the single entry point; `main.rs` calls it and
//! attaches middleware layers. All handlers are `pub(crate)` so the
//! scenario tests in `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use aegis_auth::service as auth;
use aegis_dispatch as dispatch;
use aegis_dispatch::{AllocationTarget, Feedback, PanicInput};
use aegis_realtime::{ingest_location, publish_request_event, total_distance_km, LocationIngest};
use aegis_types::{ApiError, EnvelopeKind, ErrorCode, GeoPoint, PrincipalKind, RequestStatus};

use crate::api_types::*;
use crate::extract::{actor_of, check_attestation, require_auth, ApiFailure};
use crate::state::AppState;
use crate::ws::ws_handler;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        // auth
        .route("/v1/auth/register", post(register))
        .route("/v1/auth/confirm", post(confirm))
        .route("/v1/auth/login", post(login))
        .route("/v1/auth/refresh", post(refresh))
        .route("/v1/auth/revoke", post(revoke))
        .route("/v1/auth/me", get(me))
        .route("/v1/auth/status", get(account_status))
        .route("/v1/auth/verify", post(verify_token))
        .route("/v1/auth/unlock/request", post(unlock_request))
        .route("/v1/auth/unlock/verify", post(unlock_verify))
        // panic + request lifecycle
        .route("/v1/panic", post(create_panic))
        .route("/v1/requests/:id", get(get_request))
        .route("/v1/requests/:id/updates", get(get_updates))
        .route("/v1/requests/:id/allocate", post(allocate_request))
        .route("/v1/requests/:id/reassign", post(reassign_request))
        .route("/v1/requests/:id/accept", post(accept_request))
        .route("/v1/requests/:id/en-route", post(en_route_request))
        .route("/v1/requests/:id/arrive", post(arrive_request))
        .route("/v1/requests/:id/start", post(start_request))
        .route("/v1/requests/:id/complete", post(complete_request))
        .route("/v1/requests/:id/cancel", post(cancel_request))
        .route("/v1/requests/:id/handle-call", post(handle_call_request))
        .route("/v1/requests/:id/location", post(post_location))
        .route("/v1/requests/:id/distance", get(get_distance))
        // coverage
        .route("/v1/providers/nearest", get(nearest))
        // firm administration
        .route("/v1/firms", post(create_firm))
        .route("/v1/firms/:id/approve", post(approve_firm))
        .route("/v1/firms/:id/areas", post(create_area))
        .route("/v1/areas/:id/active", post(set_area_active))
        .route("/v1/providers/:id/position", post(update_provider_position))
        // ledger
        .route("/v1/firms/:id/credits", post(purchase_credits))
        .route("/v1/firms/:id/credits", get(list_credits))
        .route("/v1/firms/:id/products", post(create_product))
        .route("/v1/firms/:id/products", get(list_products))
        .route("/v1/products/:id/active", post(set_product_active))
        .route("/v1/products/:id", axum::routing::delete(delete_product))
        .route("/v1/subscriptions/purchase", post(purchase_subscription))
        .route("/v1/subscriptions/apply", post(apply_subscription))
        .route("/v1/groups/:id/subscription", get(validate_subscription))
        .route("/v1/groups/:id/phones", post(add_group_phone))
        // fines
        .route("/v1/fines/:id/pay", post(pay_fine))
        // realtime
        .route("/v1/ws", get(ws_handler))
        .route("/v1/admin/watch/:firm_id", post(admin_watch))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = aegis_db::status(&st.pool).await.map(|s| s.ok).unwrap_or(false);
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            db_ok,
        }),
    )
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

pub(crate) async fn register(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let principal_id = auth::register(
        &st.pool,
        st.otp_delivery.as_ref(),
        auth::Registration {
            kind: PrincipalKind::EndUser,
            email: &body.email,
            phone: &body.phone,
            password: &body.password,
            firm_id: None,
            firm_role: None,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!({"principal_id": principal_id}))))
}

pub(crate) async fn confirm(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    auth::confirm_registration(&st.pool, &body.phone, &body.code).await?;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn login(
    State(st): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let pair = auth::login(&st.pool, &st.signer, &st.lockout, &body.email, &body.password).await?;
    Ok(Json(pair))
}

pub(crate) async fn refresh(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let pair = auth::refresh(&st.pool, &st.signer, &body.refresh_token).await?;
    Ok(Json(pair))
}

pub(crate) async fn revoke(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RevokeBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    auth::revoke(&st.pool, &st.signer, &body.token).await?;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn me(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    Ok(Json(claims))
}

pub(crate) async fn account_status(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    Ok(Json(auth::account_status(&st.pool, claims.sub).await?))
}

pub(crate) async fn unlock_request(
    State(st): State<Arc<AppState>>,
    Json(body): Json<UnlockRequestBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    auth::request_unlock_otp(
        &st.pool,
        st.otp_delivery.as_ref(),
        &st.lockout,
        &body.identifier,
        body.channel,
    )
    .await?;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn unlock_verify(
    State(st): State<Arc<AppState>>,
    Json(body): Json<UnlockVerifyBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    auth::verify_unlock_otp(&st.pool, &body.identifier, &body.code).await?;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn verify_token(
    State(st): State<Arc<AppState>>,
    Json(body): Json<VerifyTokenBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    match auth::verify_access(&st.pool, &st.signer, &body.token).await {
        Ok(claims) => Ok(Json(json!({"valid": true, "claims": claims}))),
        Err(_) => Ok(Json(json!({"valid": false}))),
    }
}

// ---------------------------------------------------------------------------
// Firm administration
// ---------------------------------------------------------------------------

fn internal_store(e: anyhow::Error) -> ApiFailure {
    tracing::error!("storage failure: {e:#}");
    ApiFailure(ApiError::new(ErrorCode::SysStoreError, "temporary storage failure"))
}

fn require_admin(claims: &aegis_auth::Claims) -> Result<(), ApiFailure> {
    if claims.kind == PrincipalKind::PlatformAdmin {
        Ok(())
    } else {
        Err(ApiFailure(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "platform admins only",
        )))
    }
}

pub(crate) async fn create_firm(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateFirmBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    require_admin(&claims)?;
    let firm_id = Uuid::new_v4();
    aegis_db::firms::insert_firm(&st.pool, firm_id, &body.name, &body.registration_number)
        .await
        .map_err(internal_store)?;
    Ok((StatusCode::CREATED, Json(json!({"firm_id": firm_id}))))
}

pub(crate) async fn approve_firm(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    require_admin(&claims)?;
    aegis_db::firms::set_firm_verification(
        &st.pool,
        firm_id,
        aegis_types::FirmVerification::Approved,
    )
    .await
    .map_err(internal_store)?;
    Ok(Json(OkBody { ok: true }))
}

/// Rings are normalised (auto-closed) and validated here; a bad ring never
/// reaches the store.
pub(crate) async fn create_area(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
    Json(body): Json<CreateAreaBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    require_firm(&claims, firm_id)?;

    let ring = aegis_geo::validate_ring(&body.ring).map_err(|e| {
        let mut err = ApiError::new(ErrorCode::InvalidCoordinates, "invalid polygon");
        err.details = json!({"violation": e.to_string()});
        ApiFailure(err)
    })?;

    let area_id = Uuid::new_v4();
    aegis_db::firms::insert_coverage_area(&st.pool, area_id, firm_id, &body.name, &ring)
        .await
        .map_err(internal_store)?;
    Ok((StatusCode::CREATED, Json(json!({"area_id": area_id}))))
}

pub(crate) async fn set_area_active(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(area_id): Path<Uuid>,
    Json(body): Json<SetActiveBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let owning_firm = aegis_db::firms::fetch_area_firm(&st.pool, area_id)
        .await
        .map_err(internal_store)?
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::ReqNotFound, "area not found")))?;
    require_firm(&claims, owning_firm)?;
    aegis_db::firms::set_area_active(&st.pool, area_id, body.active)
        .await
        .map_err(internal_store)?;
    Ok(Json(OkBody { ok: true }))
}

/// A responder's unit reports its position; the next cache warm feeds it
/// into the nearest-provider ranking.
pub(crate) async fn update_provider_position(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider_id): Path<Uuid>,
    Json(body): Json<ProviderPositionBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let provider = aegis_db::firms::fetch_provider(&st.pool, provider_id)
        .await
        .map_err(internal_store)?
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::ReqNotFound, "provider not found")))?;
    require_firm(&claims, provider.firm_id)?;
    aegis_db::firms::update_provider_position(&st.pool, provider_id, body.point)
        .await
        .map_err(internal_store)?;
    Ok(Json(OkBody { ok: true }))
}

// ---------------------------------------------------------------------------
// POST /v1/panic
// ---------------------------------------------------------------------------

/// Panic submission authenticates by phone membership, not bearer token;
/// this is the emergency-override path, so a locked (or token-less)
/// principal still gets through. Attestation headers, when present, are
/// verified.
pub(crate) async fn create_panic(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PanicBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    check_attestation(&st, &headers).await?;

    let input = PanicInput {
        requester_phone: body.requester_phone,
        group_id: body.group_id,
        service_type: body.service_type,
        point: body.point,
        address: body.address,
        description: body.description,
    };

    let receipt = {
        let coverage = st.coverage.read().await;
        dispatch::ingest_panic(&st.pool, &coverage, &st.settings, &input).await?
    };

    if let Some(req) = aegis_db::requests::fetch_request(&st.pool, receipt.request_id)
        .await
        .ok()
        .flatten()
    {
        publish_request_event(
            &st.pool,
            &st.directory,
            &req,
            EnvelopeKind::RequestCreated,
            json!({"status": receipt.status, "service_type": req.service_type}),
        )
        .await;
    }

    Ok((
        StatusCode::CREATED,
        Json(PanicResponse {
            request_id: receipt.request_id,
            status: receipt.status.as_str().to_string(),
            silent_mode: receipt.silent_mode.then_some("on"),
            grace_alert: receipt.grace_alert,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

async fn load_request(
    st: &AppState,
    id: Uuid,
) -> Result<aegis_db::requests::PanicRequestRow, ApiFailure> {
    aegis_db::requests::fetch_request(&st.pool, id)
        .await
        .map_err(|e| {
            tracing::error!("fetch_request failed: {e:#}");
            ApiFailure(ApiError::new(ErrorCode::SysStoreError, "temporary storage failure"))
        })?
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::ReqNotFound, "request not found")))
}

pub(crate) async fn get_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    require_auth(&st, &headers).await?;
    let req = load_request(&st, id).await?;
    Ok(Json(json!({
        "request_id": req.request_id,
        "status": req.status,
        "service_type": req.service_type,
        "group_id": req.group_id,
        "point": req.point,
        "address": req.address,
        "assigned_team_id": req.assigned_team_id,
        "assigned_provider_id": req.assigned_provider_id,
        "grace_alert": req.grace_alert,
        "created_at": req.created_at_utc,
        "completed_at": req.completed_at_utc,
    })))
}

pub(crate) async fn get_updates(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    require_auth(&st, &headers).await?;
    let updates = aegis_db::requests::list_status_updates(&st.pool, id)
        .await
        .map_err(|e| {
            tracing::error!("list_status_updates failed: {e:#}");
            ApiFailure(ApiError::new(ErrorCode::SysStoreError, "temporary storage failure"))
        })?;
    let body: Vec<_> = updates
        .into_iter()
        .map(|u| {
            json!({
                "status": u.status,
                "message": u.message,
                "responder_id": u.responder_id,
                "ts": u.created_at_utc,
            })
        })
        .collect();
    Ok(Json(body))
}

pub(crate) async fn allocate_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<AllocateBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let target = allocation_target(&body)?;
    let receipt = dispatch::allocate(
        &st.pool,
        &actor_of(&claims),
        id,
        target,
        body.notes.as_deref(),
        body.position,
    )
    .await?;

    let req = load_request(&st, id).await?;
    publish_request_event(
        &st.pool,
        &st.directory,
        &req,
        EnvelopeKind::RequestAllocated,
        serde_json::to_value(&receipt).unwrap_or_default(),
    )
    .await;
    if let Some(eta) = receipt.eta_minutes {
        publish_request_event(
            &st.pool,
            &st.directory,
            &req,
            EnvelopeKind::EtaUpdate,
            json!({"eta_minutes": eta, "distance_km": receipt.distance_km}),
        )
        .await;
    }
    Ok(Json(receipt))
}

fn allocation_target(body: &AllocateBody) -> Result<AllocationTarget, ApiFailure> {
    match (body.team_id, body.provider_id) {
        (Some(team), None) => Ok(AllocationTarget::Team(team)),
        (None, Some(provider)) => Ok(AllocationTarget::Provider(provider)),
        _ => Err(ApiFailure(ApiError::new(
            ErrorCode::ReqInvalidAssignment,
            "exactly one of team_id or provider_id is required",
        ))),
    }
}

pub(crate) async fn reassign_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<AllocateBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let target = allocation_target(&body)?;
    let receipt =
        dispatch::reassign(&st.pool, &actor_of(&claims), id, target, body.notes.as_deref()).await?;

    let req = load_request(&st, id).await?;
    publish_request_event(
        &st.pool,
        &st.directory,
        &req,
        EnvelopeKind::RequestAllocated,
        serde_json::to_value(&receipt).unwrap_or_default(),
    )
    .await;
    // Reassignment recomputes and rebroadcasts the ETA.
    if let Some(eta) = receipt.eta_minutes {
        publish_request_event(
            &st.pool,
            &st.directory,
            &req,
            EnvelopeKind::EtaUpdate,
            json!({"eta_minutes": eta, "distance_km": receipt.distance_km}),
        )
        .await;
    }
    Ok(Json(receipt))
}

async fn progress(
    st: &Arc<AppState>,
    headers: &HeaderMap,
    id: Uuid,
    to: RequestStatus,
    body: ProgressBody,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(st, headers).await?;
    dispatch::progress_request(
        &st.pool,
        &actor_of(&claims),
        id,
        to,
        body.position,
        body.message.as_deref(),
    )
    .await?;

    let req = load_request(st, id).await?;
    publish_request_event(
        &st.pool,
        &st.directory,
        &req,
        EnvelopeKind::RequestStatusUpdate,
        json!({"status": to}),
    )
    .await;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn accept_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ProgressBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    progress(&st, &headers, id, RequestStatus::Accepted, body).await
}

pub(crate) async fn en_route_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ProgressBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    progress(&st, &headers, id, RequestStatus::EnRoute, body).await
}

pub(crate) async fn arrive_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ProgressBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    progress(&st, &headers, id, RequestStatus::Arrived, body).await
}

pub(crate) async fn start_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ProgressBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    progress(&st, &headers, id, RequestStatus::InProgress, body).await
}

pub(crate) async fn complete_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let receipt = dispatch::complete(
        &st.pool,
        &st.fine_policy,
        &actor_of(&claims),
        id,
        &Feedback {
            is_prank: body.is_prank,
            rating: body.rating,
            comments: body.comments,
        },
    )
    .await?;

    let req = load_request(&st, id).await?;
    publish_request_event(
        &st.pool,
        &st.directory,
        &req,
        EnvelopeKind::Completed,
        json!({"status": "completed"}),
    )
    .await;
    Ok(Json(json!({
        "request_id": receipt.request_id,
        "status": receipt.status,
        "prank_recorded": receipt.prank.is_some(),
    })))
}

pub(crate) async fn cancel_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    dispatch::cancel_request(&st.pool, Some(&actor_of(&claims)), id, &body.reason).await?;

    let req = load_request(&st, id).await?;
    publish_request_event(
        &st.pool,
        &st.directory,
        &req,
        EnvelopeKind::Cancelled,
        json!({"reason": body.reason}),
    )
    .await;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn handle_call_request(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    dispatch::handle_call(&st.pool, &actor_of(&claims), id).await?;

    let req = load_request(&st, id).await?;
    publish_request_event(
        &st.pool,
        &st.directory,
        &req,
        EnvelopeKind::RequestAllocated,
        json!({"call_queue": true}),
    )
    .await;
    Ok(Json(OkBody { ok: true }))
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

pub(crate) async fn post_location(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<LocationBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    ingest_location(
        &st.pool,
        &st.directory,
        claims.sub,
        &LocationIngest {
            request_id: id,
            point: body.point,
            accuracy_m: body.accuracy_m,
            source: body.source,
            update_primary: body.update_primary,
        },
    )
    .await?;
    Ok(Json(OkBody { ok: true }))
}

pub(crate) async fn get_distance(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    require_auth(&st, &headers).await?;
    let req = load_request(&st, id).await?;
    let to = req.completed_at_utc.unwrap_or_else(chrono::Utc::now);
    let km = total_distance_km(&st.pool, id, req.created_at_utc, to).await?;
    Ok(Json(json!({"request_id": id, "distance_km": km})))
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

pub(crate) async fn nearest(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<NearestQuery>,
) -> Result<impl IntoResponse, ApiFailure> {
    require_auth(&st, &headers).await?;
    let coverage = st.coverage.read().await;
    let ranked = aegis_geo::nearest_providers(
        &coverage,
        GeoPoint::new(q.lon, q.lat),
        &q.provider_type,
        q.radius_km,
        q.limit,
    );
    let body: Vec<_> = ranked
        .iter()
        .map(|r| {
            json!({
                "provider_id": r.provider_id,
                "firm_id": r.firm_id,
                "distance_km": r.distance_km,
                "eta_minutes": r.eta_minutes,
            })
        })
        .collect();
    Ok(Json(body))
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

fn require_firm(claims: &aegis_auth::Claims, firm_id: Uuid) -> Result<(), ApiFailure> {
    let allowed = claims.kind == PrincipalKind::PlatformAdmin || claims.firm_id == Some(firm_id);
    if allowed {
        Ok(())
    } else {
        Err(ApiFailure(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "not a member of this firm",
        )))
    }
}

pub(crate) async fn purchase_credits(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
    Json(body): Json<PurchaseCreditsBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    require_firm(&claims, firm_id)?;
    let balance = aegis_ledger::purchase_credits(
        &st.pool,
        st.payment.as_ref(),
        firm_id,
        body.amount,
        body.price_cents,
        body.payment,
        &body.idempotency_key,
    )
    .await?;
    Ok(Json(json!({"firm_id": firm_id, "credit_balance": balance})))
}

pub(crate) async fn create_product(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
    Json(body): Json<CreateProductBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    require_firm(&claims, firm_id)?;
    let product_id = aegis_ledger::create_product(
        &st.pool,
        firm_id,
        &body.name,
        body.max_users,
        body.price_cents,
        body.credit_cost,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!({"product_id": product_id}))))
}

pub(crate) async fn purchase_subscription(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PurchaseSubscriptionBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let stored_id = aegis_ledger::purchase_subscription(
        &st.pool,
        st.payment.as_ref(),
        claims.sub,
        body.product_id,
        body.payment,
        &body.idempotency_key,
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"stored_subscription_id": stored_id})),
    ))
}

pub(crate) async fn apply_subscription(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ApplySubscriptionBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let receipt = {
        let coverage = st.coverage.read().await;
        aegis_ledger::apply_subscription(
            &st.pool,
            &coverage,
            &st.settings,
            claims.sub,
            body.stored_subscription_id,
            body.group_id,
        )
        .await?
    };
    Ok(Json(receipt))
}

pub(crate) async fn validate_subscription(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    require_auth(&st, &headers).await?;
    let standing = aegis_ledger::validate_subscription(&st.pool, &st.settings, group_id).await?;
    Ok(Json(standing))
}

pub(crate) async fn add_group_phone(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<Uuid>,
    Json(body): Json<AddPhoneBody>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let administers = aegis_db::groups::user_administers_group(&st.pool, group_id, claims.sub)
        .await
        .map_err(|e| {
            tracing::error!("membership check failed: {e:#}");
            ApiFailure(ApiError::new(ErrorCode::SysStoreError, "temporary storage failure"))
        })?;
    if !administers {
        return Err(ApiFailure(ApiError::new(
            ErrorCode::UserGroupNotOwned,
            "group not owned or administered",
        )));
    }

    let phone_id = Uuid::new_v4();
    if let Err(e) =
        aegis_db::groups::insert_group_phone(&st.pool, phone_id, group_id, &body.phone, body.kind)
            .await
    {
        if aegis_db::is_unique_constraint_violation(&e, "uq_group_phone") {
            return Err(ApiFailure(ApiError::new(
                ErrorCode::UserPhoneExists,
                "phone already registered to a group",
            )));
        }
        tracing::error!("insert_group_phone failed: {e:#}");
        return Err(ApiFailure(ApiError::new(
            ErrorCode::SysStoreError,
            "temporary storage failure",
        )));
    }
    Ok((StatusCode::CREATED, Json(json!({"phone_id": phone_id}))))
}

pub(crate) async fn list_credits(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    require_firm(&claims, firm_id)?;
    let firm = aegis_db::firms::fetch_firm(&st.pool, firm_id)
        .await
        .map_err(internal_store)?
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::ReqNotFound, "firm not found")))?;
    let transactions = aegis_db::firms::list_credit_transactions(&st.pool, firm_id)
        .await
        .map_err(internal_store)?;
    let rows: Vec<_> = transactions
        .iter()
        .map(|t| {
            json!({
                "delta": t.delta,
                "reason": t.reason,
                "external_ref": t.external_ref,
                "ts": t.created_at_utc,
            })
        })
        .collect();
    Ok(Json(json!({
        "credit_balance": firm.credit_balance,
        "transactions": rows,
    })))
}

pub(crate) async fn list_products(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    require_auth(&st, &headers).await?;
    let products = aegis_db::subscriptions::list_active_products_for_firm(&st.pool, firm_id)
        .await
        .map_err(internal_store)?;
    let rows: Vec<_> = products
        .iter()
        .map(|p| {
            json!({
                "product_id": p.product_id,
                "name": p.name,
                "max_users": p.max_users,
                "price_cents": p.price_cents,
                "credit_cost": p.credit_cost,
            })
        })
        .collect();
    Ok(Json(rows))
}

async fn owned_product(
    st: &AppState,
    claims: &aegis_auth::Claims,
    product_id: Uuid,
) -> Result<aegis_db::subscriptions::ProductRow, ApiFailure> {
    let product = aegis_db::subscriptions::fetch_product(&st.pool, product_id)
        .await
        .map_err(internal_store)?
        .ok_or_else(|| {
            ApiFailure(ApiError::new(ErrorCode::SubProductNotFound, "product not found"))
        })?;
    require_firm(claims, product.firm_id)?;
    Ok(product)
}

pub(crate) async fn set_product_active(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(product_id): Path<Uuid>,
    Json(body): Json<SetActiveBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    owned_product(&st, &claims, product_id).await?;
    aegis_db::subscriptions::set_product_active(&st.pool, product_id, body.active)
        .await
        .map_err(internal_store)?;
    Ok(Json(OkBody { ok: true }))
}

/// Deletable only while no stored subscription has ever referenced it.
pub(crate) async fn delete_product(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(product_id): Path<Uuid>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    owned_product(&st, &claims, product_id).await?;
    let deleted = aegis_db::subscriptions::delete_product_if_unreferenced(&st.pool, product_id)
        .await
        .map_err(internal_store)?;
    if !deleted {
        return Err(ApiFailure(ApiError::new(
            ErrorCode::SubAlreadyApplied,
            "product has subscriptions; deactivate it instead",
        )));
    }
    Ok(Json(OkBody { ok: true }))
}

// ---------------------------------------------------------------------------
// Fines
// ---------------------------------------------------------------------------

pub(crate) async fn pay_fine(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(fine_id): Path<Uuid>,
    Json(body): Json<PayFineBody>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    let fine = aegis_db::requests::fetch_fine(&st.pool, fine_id)
        .await
        .map_err(|e| {
            tracing::error!("fetch_fine failed: {e:#}");
            ApiFailure(ApiError::new(ErrorCode::SysStoreError, "temporary storage failure"))
        })?
        .ok_or_else(|| ApiFailure(ApiError::new(ErrorCode::ReqNotFound, "fine not found")))?;
    if fine.user_id != claims.sub && claims.kind != PrincipalKind::PlatformAdmin {
        return Err(ApiFailure(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "not your fine",
        )));
    }

    aegis_fines::pay_fine(&st.pool, st.payment.as_ref(), fine_id, body.payment).await?;
    Ok(Json(OkBody { ok: true }))
}

// ---------------------------------------------------------------------------
// Admin firm watch
// ---------------------------------------------------------------------------

pub(crate) async fn admin_watch(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(firm_id): Path<Uuid>,
) -> Result<Json<OkBody>, ApiFailure> {
    let claims = require_auth(&st, &headers).await?;
    if claims.kind != PrincipalKind::PlatformAdmin {
        return Err(ApiFailure(ApiError::new(
            ErrorCode::AuthInsufficientPermission,
            "platform admins only",
        )));
    }
    st.directory.subscribe_admin(firm_id, claims.sub);
    Ok(Json(OkBody { ok: true }))
}
