//! Timeout classification and the sweep operations.
//!
//! `classify_timeout` is the pure rule; the sweeps re-check state under a
//! row-lock before acting, so a request that progressed between the scan
//! and the sweep is left alone.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use aegis_config::settings::DispatchSettings;
use aegis_db::requests::{self, PanicRequestRow};
use aegis_types::RequestStatus;

use crate::allocate::release_previous_provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// pending past the allocation window: auto-cancel.
    CancelNoAllocation,
    /// allocated but unaccepted: back to pending for re-dispatch.
    RevertToPending,
    /// accepted/en_route with no activity: alert firm supervisors.
    AlertSupervisors,
    None,
}

/// Which timeout (if any) applies to a request right now.
///
/// The pending window runs from creation; the allocation window runs from
/// `allocated_at` (when the request actually entered Allocated), so time
/// spent pending never eats into the assignee's acceptance window.
/// `last_activity` is the newest status update or location log.
pub fn classify_timeout(
    status: RequestStatus,
    created_at: DateTime<Utc>,
    allocated_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    limits: &DispatchSettings,
    now: DateTime<Utc>,
) -> TimeoutAction {
    match status {
        RequestStatus::Pending
            if now - created_at > Duration::minutes(limits.pending_timeout_minutes) =>
        {
            TimeoutAction::CancelNoAllocation
        }
        RequestStatus::Allocated => {
            let reference = allocated_at.unwrap_or(created_at);
            if now - reference > Duration::minutes(limits.allocation_timeout_minutes) {
                TimeoutAction::RevertToPending
            } else {
                TimeoutAction::None
            }
        }
        RequestStatus::Accepted | RequestStatus::EnRoute => {
            let reference = last_activity.unwrap_or(created_at);
            if now - reference > Duration::minutes(limits.progress_silence_minutes) {
                TimeoutAction::AlertSupervisors
            } else {
                TimeoutAction::None
            }
        }
        _ => TimeoutAction::None,
    }
}

/// Cancel pending requests that nobody allocated in time. Returns the ids
/// cancelled. Idempotent: a request that moved on is skipped.
pub async fn sweep_pending_timeouts(
    pool: &PgPool,
    limits: &DispatchSettings,
) -> Result<Vec<Uuid>> {
    let now = Utc::now();
    let cutoff = now - Duration::minutes(limits.pending_timeout_minutes);
    let stale = requests::list_requests_in_status_older_than(pool, RequestStatus::Pending, cutoff)
        .await?;

    let mut cancelled = Vec::new();
    for row in stale {
        let mut tx = pool.begin().await?;
        let Some(req) = requests::fetch_request_for_update(&mut tx, row.request_id).await? else {
            continue;
        };
        if req.status != RequestStatus::Pending {
            continue;
        }
        requests::write_request_status(&mut tx, req.request_id, RequestStatus::Cancelled, now)
            .await?;
        requests::append_status_update(
            &mut tx,
            req.request_id,
            RequestStatus::Cancelled,
            Some("no_allocation"),
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        info!(request_id = %req.request_id, "pending request timed out");
        cancelled.push(req.request_id);
    }
    Ok(cancelled)
}

/// Revert allocations nobody accepted inside the acceptance window
/// (measured from `allocated_at_utc`). Returns the ids reverted, for the
/// re-allocation broadcast.
pub async fn sweep_allocation_timeouts(
    pool: &PgPool,
    limits: &DispatchSettings,
) -> Result<Vec<Uuid>> {
    let now = Utc::now();
    let window = Duration::minutes(limits.allocation_timeout_minutes);
    let stale = requests::list_allocated_older_than(pool, now - window).await?;

    let mut reverted = Vec::new();
    for row in stale {
        let mut tx = pool.begin().await?;
        let Some(req) = requests::fetch_request_for_update(&mut tx, row.request_id).await? else {
            continue;
        };
        // Re-check both state and window under the lock: a reassignment
        // between scan and sweep refreshes allocated_at_utc and opens a
        // fresh acceptance window.
        if req.status != RequestStatus::Allocated {
            continue;
        }
        if now - req.allocated_at_utc.unwrap_or(req.created_at_utc) <= window {
            continue;
        }
        release_previous_provider(&mut tx, &req).await?;
        requests::write_request_assignment(&mut tx, req.request_id, None, None).await?;
        requests::write_request_status(&mut tx, req.request_id, RequestStatus::Pending, now)
            .await?;
        requests::append_status_update(
            &mut tx,
            req.request_id,
            RequestStatus::Pending,
            Some("allocation timed out; needs re-dispatch"),
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        info!(request_id = %req.request_id, "allocation timed out, reverted to pending");
        reverted.push(req.request_id);
    }
    Ok(reverted)
}

/// Requests whose responder has gone quiet. No state change; the caller
/// alerts the owning firm's supervisors.
pub async fn find_silent_requests(
    pool: &PgPool,
    limits: &DispatchSettings,
) -> Result<Vec<PanicRequestRow>> {
    let now = Utc::now();
    let mut silent = Vec::new();
    for req in requests::list_in_progress_requests(pool).await? {
        let last = requests::last_activity_at(pool, req.request_id).await?;
        if classify_timeout(
            req.status,
            req.created_at_utc,
            req.allocated_at_utc,
            last,
            limits,
            now,
        ) == TimeoutAction::AlertSupervisors
        {
            silent.push(req);
        }
    }
    Ok(silent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DispatchSettings {
        DispatchSettings::default()
    }

    fn t0() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn pending_cancels_after_fifteen_minutes() {
        let l = limits();
        assert_eq!(
            classify_timeout(RequestStatus::Pending, t0(), None, None, &l, t0() + Duration::minutes(14)),
            TimeoutAction::None
        );
        assert_eq!(
            classify_timeout(RequestStatus::Pending, t0(), None, None, &l, t0() + Duration::minutes(16)),
            TimeoutAction::CancelNoAllocation
        );
    }

    #[test]
    fn allocation_window_runs_from_allocation_time() {
        let l = limits();
        // Created at t0, allocated nine minutes later: the acceptance
        // window opens at t0+9m, so t0+15m is only six minutes in.
        let allocated = Some(t0() + Duration::minutes(9));
        assert_eq!(
            classify_timeout(RequestStatus::Allocated, t0(), allocated, None, &l, t0() + Duration::minutes(15)),
            TimeoutAction::None
        );
        assert_eq!(
            classify_timeout(RequestStatus::Allocated, t0(), allocated, None, &l, t0() + Duration::minutes(20)),
            TimeoutAction::RevertToPending
        );
        // Legacy rows without the timestamp fall back to creation.
        assert_eq!(
            classify_timeout(RequestStatus::Allocated, t0(), None, None, &l, t0() + Duration::minutes(11)),
            TimeoutAction::RevertToPending
        );
    }

    #[test]
    fn silence_alert_uses_last_activity() {
        let l = limits();
        let recent = Some(t0() + Duration::minutes(40));
        assert_eq!(
            classify_timeout(RequestStatus::EnRoute, t0(), None, recent, &l, t0() + Duration::minutes(60)),
            TimeoutAction::None
        );
        assert_eq!(
            classify_timeout(RequestStatus::EnRoute, t0(), None, recent, &l, t0() + Duration::minutes(75)),
            TimeoutAction::AlertSupervisors
        );
        // No activity at all: measured from creation.
        assert_eq!(
            classify_timeout(RequestStatus::Accepted, t0(), None, None, &l, t0() + Duration::minutes(31)),
            TimeoutAction::AlertSupervisors
        );
    }

    #[test]
    fn terminal_and_in_progress_states_never_time_out() {
        let l = limits();
        let much_later = t0() + Duration::hours(10);
        for status in [
            RequestStatus::InProgress,
            RequestStatus::Completed,
            RequestStatus::Cancelled,
            RequestStatus::Arrived,
        ] {
            assert_eq!(
                classify_timeout(status, t0(), None, None, &l, much_later),
                TimeoutAction::None,
                "{status} should not time out"
            );
        }
    }
}
