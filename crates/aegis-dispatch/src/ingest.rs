//! The ingest pipeline.
//!
//! Loads the requester's standing, the group's subscription, and the
//! coverage verdicts into an `IngestSnapshot`, lets `gates::evaluate_ingest`
//! decide, and only then persists. Rejected requests are never written.

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use aegis_db::{groups, requests};
use aegis_geo::{covering_firms, firm_covers_point, CoverageSnapshot};
use aegis_ledger::{evaluate_standing, subscription_firm_for_group};
use aegis_types::{ApiError, ErrorCode, GeoPoint, RequestStatus, ServiceType};

use crate::gates::{evaluate_ingest, IngestSnapshot, RequesterStanding};
use crate::retry::with_backoff;

#[derive(Debug, Clone)]
pub struct PanicInput {
    pub requester_phone: String,
    pub group_id: Uuid,
    pub service_type: ServiceType,
    pub point: GeoPoint,
    pub address: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReceipt {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub silent_mode: bool,
    pub grace_alert: bool,
    #[serde(skip)]
    pub requester_user_id: Uuid,
    #[serde(skip)]
    pub group_id: Uuid,
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!("ingest storage failure: {e:#}");
    ApiError::new(ErrorCode::SysStoreError, "temporary storage failure")
}

pub async fn ingest_panic(
    pool: &PgPool,
    coverage: &CoverageSnapshot,
    settings: &aegis_config::Settings,
    input: &PanicInput,
) -> Result<IngestReceipt, ApiError> {
    let now = Utc::now();

    if !(-180.0..=180.0).contains(&input.point.lon) || !(-90.0..=90.0).contains(&input.point.lat) {
        return Err(ApiError::new(
            ErrorCode::InvalidCoordinates,
            "point is outside WGS84 bounds",
        ));
    }

    // Load phase: no locks, no writes.
    let membership = groups::fetch_phone_membership(pool, &input.requester_phone, input.group_id)
        .await
        .map_err(internal)?;

    let group = groups::fetch_group(pool, input.group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::UnauthorizedRequester, "unknown group"))?;

    let standing = evaluate_standing(
        group.subscription_expires_at,
        settings.subscription.grace_days,
        now,
    );

    let subscription_firm = subscription_firm_for_group(pool, input.group_id)
        .await
        .map_err(internal)?;

    let (group_point_covered, request_point_covered) = match subscription_firm {
        Some(firm_id) => (
            firm_covers_point(coverage, firm_id, group.point),
            firm_covers_point(coverage, firm_id, input.point),
        ),
        None => (false, false),
    };
    let suggested_firms = covering_firms(coverage, input.point, input.service_type);

    let dedupe_since = now - Duration::minutes(settings.dispatch.dedupe_window_minutes);
    let burst_since = now - Duration::seconds(settings.dispatch.burst_window_seconds);
    let open_same_type = requests::count_open_requests_for_phone(
        pool,
        &input.requester_phone,
        input.service_type,
        dedupe_since,
    )
    .await
    .map_err(internal)?;
    let accepted_recently =
        requests::count_recent_requests_for_phone(pool, &input.requester_phone, burst_since)
            .await
            .map_err(internal)?;

    let snap = IngestSnapshot {
        requester: membership.map(|m| RequesterStanding {
            user_id: m.user_id,
            membership_active: m.membership_active,
            verified: m.verified,
            suspended: m.suspended,
            banned: m.banned,
            locked: matches!(m.locked_until, Some(until) if now < until),
        }),
        standing,
        subscription_firm,
        group_point_covered,
        request_point_covered,
        suggested_firms,
        open_same_type_in_window: open_same_type,
        accepted_in_burst_window: accepted_recently,
    };

    let admission = evaluate_ingest(&snap, input.service_type, &settings.dispatch)?;
    if let Some(r) = &snap.requester {
        if r.locked {
            info!(user_id = %r.user_id, "emergency override: locked principal admitted to panic path");
        }
    }

    // Persist phase, retried on transient store failure.
    let request_id = Uuid::new_v4();
    let new = requests::NewPanicRequest {
        request_id,
        requester_phone: input.requester_phone.clone(),
        requester_user_id: admission.requester_user_id,
        group_id: input.group_id,
        service_type: input.service_type,
        point: input.point,
        address: input.address.clone(),
        description: input.description.clone(),
        grace_alert: admission.grace_alert,
        silent_mode: admission.silent_mode,
    };
    with_backoff("insert_panic_request", || {
        let new = new.clone();
        async move { requests::insert_panic_request(pool, &new).await }
    })
    .await
    .map_err(internal)?;

    info!(
        %request_id,
        service = %input.service_type,
        group = %input.group_id,
        grace_alert = admission.grace_alert,
        "panic request created"
    );

    Ok(IngestReceipt {
        request_id,
        status: RequestStatus::Pending,
        silent_mode: admission.silent_mode,
        grace_alert: admission.grace_alert,
        requester_user_id: admission.requester_user_id,
        group_id: input.group_id,
    })
}
