//! Ingest gate evaluation.
//!
//! Pure: `ingest.rs` loads the world into an `IngestSnapshot` and this
//! module decides. Gate order is contractual (authorisation, then
//! subscription, then coverage, then dedupe) so a caller with several
//! problems always sees the most fundamental one.

use uuid::Uuid;

use aegis_config::settings::DispatchSettings;
use aegis_ledger::SubscriptionStanding;
use aegis_types::{ApiError, ErrorCode, ServiceType};

/// The requester's phone resolved against the group roster.
#[derive(Debug, Clone)]
pub struct RequesterStanding {
    pub user_id: Uuid,
    pub membership_active: bool,
    pub verified: bool,
    pub suspended: bool,
    pub banned: bool,
    /// Locked principals pass: the emergency override applies to this path
    /// only. Carried for logging, never gating.
    pub locked: bool,
}

#[derive(Debug, Clone)]
pub struct IngestSnapshot {
    pub requester: Option<RequesterStanding>,
    pub standing: SubscriptionStanding,
    pub subscription_firm: Option<Uuid>,
    pub group_point_covered: bool,
    pub request_point_covered: bool,
    /// Firms that do cover the submitted point, for the rejection hint.
    pub suggested_firms: Vec<Uuid>,
    /// Non-terminal requests for (phone, service_type) inside the dedupe
    /// window.
    pub open_same_type_in_window: i64,
    /// Requests accepted from the phone inside the burst window.
    pub accepted_in_burst_window: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub requester_user_id: Uuid,
    pub grace_alert: bool,
    pub silent_mode: bool,
}

pub fn evaluate_ingest(
    snap: &IngestSnapshot,
    service: ServiceType,
    limits: &DispatchSettings,
) -> Result<Admission, ApiError> {
    // Gate 1: authorise the requester. Lockout is explicitly NOT a gate
    // here; banned and suspended are.
    let requester = snap
        .requester
        .as_ref()
        .filter(|r| r.membership_active && r.verified)
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::UnauthorizedRequester,
                "phone is not an active member of this group",
            )
        })?;
    if requester.banned {
        return Err(ApiError::new(ErrorCode::UserBanned, "account is banned"));
    }
    if requester.suspended {
        return Err(ApiError::new(
            ErrorCode::UserSuspended,
            "account is suspended pending fine payment",
        ));
    }

    // Gate 2: subscription.
    if !snap.standing.active && !snap.standing.grace {
        return Err(ApiError::new(
            ErrorCode::SubscriptionExpired,
            "group subscription has expired",
        ));
    }
    let grace_alert = !snap.standing.active;

    // Gate 3: coverage. Both the group's home point and the submitted
    // point must fall inside the subscribed firm's active polygons.
    if snap.subscription_firm.is_none()
        || !snap.group_point_covered
        || !snap.request_point_covered
    {
        return Err(ApiError::new(
            ErrorCode::LocationNotCovered,
            "location is outside the subscribed firm's coverage",
        )
        .with_suggested_firms(&snap.suggested_firms));
    }

    // Gate 4: dedupe and burst limit.
    if snap.open_same_type_in_window > 0 {
        return Err(ApiError::new(
            ErrorCode::DuplicateRequest,
            "an equivalent request is already in flight",
        ));
    }
    if snap.accepted_in_burst_window >= limits.max_requests_per_window as i64 {
        return Err(ApiError::new(
            ErrorCode::DuplicateRequest,
            "too many requests from this phone",
        )
        .with_retry_after_seconds(limits.burst_window_seconds));
    }

    Ok(Admission {
        requester_user_id: requester.user_id,
        grace_alert,
        silent_mode: service == ServiceType::Call,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn ok_snapshot() -> IngestSnapshot {
        IngestSnapshot {
            requester: Some(RequesterStanding {
                user_id: Uuid::new_v4(),
                membership_active: true,
                verified: true,
                suspended: false,
                banned: false,
                locked: false,
            }),
            standing: SubscriptionStanding {
                active: true,
                grace: true,
                expires_at: Some(Utc::now() + Duration::days(10)),
            },
            subscription_firm: Some(Uuid::new_v4()),
            group_point_covered: true,
            request_point_covered: true,
            suggested_firms: vec![],
            open_same_type_in_window: 0,
            accepted_in_burst_window: 0,
        }
    }

    fn limits() -> DispatchSettings {
        DispatchSettings::default()
    }

    #[test]
    fn clean_snapshot_admits() {
        let adm = evaluate_ingest(&ok_snapshot(), ServiceType::Security, &limits()).unwrap();
        assert!(!adm.grace_alert);
        assert!(!adm.silent_mode);
    }

    #[test]
    fn call_requests_get_silent_mode() {
        let adm = evaluate_ingest(&ok_snapshot(), ServiceType::Call, &limits()).unwrap();
        assert!(adm.silent_mode);
    }

    #[test]
    fn unknown_or_inactive_phone_is_unauthorized() {
        let mut snap = ok_snapshot();
        snap.requester = None;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::UnauthorizedRequester);

        let mut snap = ok_snapshot();
        snap.requester.as_mut().unwrap().membership_active = false;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::UnauthorizedRequester);
    }

    #[test]
    fn locked_requester_is_admitted() {
        let mut snap = ok_snapshot();
        snap.requester.as_mut().unwrap().locked = true;
        assert!(evaluate_ingest(&snap, ServiceType::Security, &limits()).is_ok());
    }

    #[test]
    fn suspended_and_banned_are_rejected() {
        let mut snap = ok_snapshot();
        snap.requester.as_mut().unwrap().suspended = true;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::UserSuspended);

        let mut snap = ok_snapshot();
        snap.requester.as_mut().unwrap().banned = true;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::UserBanned);
    }

    #[test]
    fn expired_subscription_rejected_grace_admits_with_alert() {
        let mut snap = ok_snapshot();
        snap.standing = SubscriptionStanding {
            active: false,
            grace: false,
            expires_at: Some(Utc::now() - Duration::days(20)),
        };
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::SubscriptionExpired);

        let mut snap = ok_snapshot();
        snap.standing = SubscriptionStanding {
            active: false,
            grace: true,
            expires_at: Some(Utc::now() - Duration::days(2)),
        };
        let adm = evaluate_ingest(&snap, ServiceType::Fire, &limits()).unwrap();
        assert!(adm.grace_alert);
    }

    #[test]
    fn coverage_failure_carries_suggestions() {
        let alt = Uuid::new_v4();
        let mut snap = ok_snapshot();
        snap.request_point_covered = false;
        snap.suggested_firms = vec![alt];
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::LocationNotCovered);
        assert_eq!(err.details["suggested_firms"][0], alt.to_string());
    }

    #[test]
    fn dedupe_and_burst_rejections() {
        let mut snap = ok_snapshot();
        snap.open_same_type_in_window = 1;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::DuplicateRequest);
        assert!(err.details.get("retry_after_seconds").is_none());

        let mut snap = ok_snapshot();
        snap.accepted_in_burst_window = 5;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::DuplicateRequest);
        assert_eq!(err.details["retry_after_seconds"], 60);
    }

    #[test]
    fn gate_order_authorization_before_subscription() {
        let mut snap = ok_snapshot();
        snap.requester = None;
        snap.standing.active = false;
        snap.standing.grace = false;
        let err = evaluate_ingest(&snap, ServiceType::Security, &limits()).unwrap_err();
        assert_eq!(err.error_code, ErrorCode::UnauthorizedRequester);
    }
}
