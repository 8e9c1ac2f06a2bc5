//! Expiry and grace arithmetic.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct SubscriptionStanding {
    /// expires_at is strictly in the future.
    pub active: bool,
    /// now is within the grace window past expiry. Implied true while
    /// active.
    pub grace: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Standing of a group given its expiry column.
pub fn evaluate_standing(
    expires_at: Option<DateTime<Utc>>,
    grace_days: i64,
    now: DateTime<Utc>,
) -> SubscriptionStanding {
    match expires_at {
        None => SubscriptionStanding {
            active: false,
            grace: false,
            expires_at: None,
        },
        Some(exp) => SubscriptionStanding {
            active: exp > now,
            grace: now <= exp + Duration::days(grace_days),
            expires_at: Some(exp),
        },
    }
}

/// Applying a subscription extends from the later of now and the current
/// expiry, so stacking entitlements never loses paid-for time.
pub fn extended_expiry(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_days: i64,
) -> DateTime<Utc> {
    let base = match current {
        Some(cur) if cur > now => cur,
        _ => now,
    };
    base + Duration::days(window_days)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn active_until_expiry_then_grace() {
        let exp = t0() + Duration::days(10);
        let s = evaluate_standing(Some(exp), 7, t0());
        assert!(s.active && s.grace);

        let s = evaluate_standing(Some(exp), 7, exp + Duration::days(3));
        assert!(!s.active && s.grace);

        let s = evaluate_standing(Some(exp), 7, exp + Duration::days(8));
        assert!(!s.active && !s.grace);
    }

    #[test]
    fn grace_boundary_is_inclusive() {
        let exp = t0();
        let s = evaluate_standing(Some(exp), 7, exp + Duration::days(7));
        assert!(s.grace);
    }

    #[test]
    fn never_subscribed_has_no_standing() {
        let s = evaluate_standing(None, 7, t0());
        assert!(!s.active && !s.grace);
    }

    #[test]
    fn extension_stacks_on_active_subscription() {
        let now = t0();
        let current = now + Duration::days(12);
        assert_eq!(extended_expiry(Some(current), now, 30), current + Duration::days(30));
    }

    #[test]
    fn extension_restarts_after_lapse() {
        let now = t0();
        let lapsed = now - Duration::days(40);
        assert_eq!(extended_expiry(Some(lapsed), now, 30), now + Duration::days(30));
        assert_eq!(extended_expiry(None, now, 30), now + Duration::days(30));
    }
}
