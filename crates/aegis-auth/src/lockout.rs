//! Per-principal lockout state machine.
//!
//! Pure and deterministic: every function takes the current state plus a
//! clock instant and returns the next state and a verdict. Persistence is
//! the caller's job (one row-locked transaction per event).
//!
//! States: OK (failed_count), LOCKED(until), LOCKED + OTP_PENDING
//! (digest, expires, attempts_left). A lock whose deadline has passed
//! transitions back to OK before the incoming event is processed.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct LockoutConfig {
    pub threshold: u32,
    pub lock_duration: Duration,
    pub otp_lifetime: Duration,
    pub otp_attempts: u32,
}

impl LockoutConfig {
    pub fn from_settings(s: &aegis_config::Settings) -> Self {
        Self {
            threshold: s.lockout.threshold,
            lock_duration: Duration::minutes(s.lockout.duration_minutes),
            otp_lifetime: Duration::minutes(s.otp.lifetime_minutes),
            otp_attempts: s.otp.attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OtpChallenge {
    pub digest: String,
    pub expires_at: DateTime<Utc>,
    pub attempts_left: u32,
}

/// Mirrors the principal row's lockout columns one-to-one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockoutState {
    pub failed_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub otp: Option<OtpChallenge>,
}

impl LockoutState {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if now < until)
    }

    /// Expired locks collapse to OK before any event is processed.
    fn normalized(mut self, now: DateTime<Utc>) -> Self {
        if let Some(until) = self.locked_until {
            if now >= until {
                self.failed_count = 0;
                self.locked_until = None;
                self.otp = None;
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginGate {
    /// Credentials may be checked.
    Allowed(LockoutState),
    /// Locked; no counter change.
    Locked { retry_after_minutes: i64 },
}

/// Gate an incoming login attempt.
pub fn evaluate_login(state: LockoutState, now: DateTime<Utc>) -> LoginGate {
    let state = state.normalized(now);
    match state.locked_until {
        Some(until) => LoginGate::Locked {
            // Ceiling so "29m59s left" reads as 30, never 0 near expiry.
            retry_after_minutes: remaining_minutes(until, now),
        },
        None => LoginGate::Allowed(state),
    }
}

fn remaining_minutes(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (until - now).num_seconds().max(0);
    (secs + 59) / 60
}

/// A failed credential check. Returns the next state and whether this
/// failure tripped the lock (the caller emits the lockout event).
pub fn on_login_failure(
    cfg: &LockoutConfig,
    state: LockoutState,
    now: DateTime<Utc>,
) -> (LockoutState, bool) {
    let mut state = state.normalized(now);
    state.failed_count += 1;
    if state.failed_count >= cfg.threshold {
        state.locked_until = Some(now + cfg.lock_duration);
        state.otp = None;
        (state, true)
    } else {
        (state, false)
    }
}

/// A successful credential check while OK.
pub fn on_login_success(state: LockoutState, now: DateTime<Utc>) -> LockoutState {
    let mut state = state.normalized(now);
    state.failed_count = 0;
    state
}

#[derive(Debug, Clone, PartialEq)]
pub enum OtpIssue {
    /// New challenge installed (replacing any prior one). The lock deadline
    /// is untouched.
    Issued(LockoutState),
    /// Principal is not locked; there is nothing to unlock.
    NotLocked,
}

/// Install a fresh OTP challenge. `digest` is the stored form of the code;
/// code generation and hashing live in `otp.rs`.
pub fn issue_otp(
    cfg: &LockoutConfig,
    state: LockoutState,
    now: DateTime<Utc>,
    digest: String,
) -> OtpIssue {
    let mut state = state.normalized(now);
    if !state.is_locked(now) {
        return OtpIssue::NotLocked;
    }
    state.otp = Some(OtpChallenge {
        digest,
        expires_at: now + cfg.otp_lifetime,
        attempts_left: cfg.otp_attempts,
    });
    OtpIssue::Issued(state)
}

#[derive(Debug, Clone, PartialEq)]
pub enum OtpVerdict {
    /// Unlocked: OK with failed_count zeroed.
    Unlocked(LockoutState),
    /// Wrong code; attempts remain.
    WrongCode {
        state: LockoutState,
        attempts_remaining: u32,
    },
    /// Wrong code and no attempts remain: back to plain LOCKED, fresh OTP
    /// request required.
    AttemptsExhausted(LockoutState),
    /// No live challenge (never issued, already consumed, or expired).
    Expired,
}

/// Verify a submitted code against the stored digest.
pub fn verify_otp(
    state: LockoutState,
    now: DateTime<Utc>,
    submitted_digest: &str,
) -> OtpVerdict {
    let mut state = state.normalized(now);

    let Some(challenge) = state.otp.clone() else {
        return OtpVerdict::Expired;
    };
    if now >= challenge.expires_at {
        state.otp = None;
        return OtpVerdict::Expired;
    }

    if challenge.digest == submitted_digest {
        return OtpVerdict::Unlocked(LockoutState::default());
    }

    let attempts_remaining = challenge.attempts_left.saturating_sub(1);
    if attempts_remaining == 0 {
        state.otp = None;
        OtpVerdict::AttemptsExhausted(state)
    } else {
        state.otp = Some(OtpChallenge {
            attempts_left: attempts_remaining,
            ..challenge
        });
        OtpVerdict::WrongCode {
            state,
            attempts_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LockoutConfig {
        LockoutConfig {
            threshold: 5,
            lock_duration: Duration::minutes(30),
            otp_lifetime: Duration::minutes(10),
            otp_attempts: 3,
        }
    }

    fn t0() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn five_failures_trip_the_lock() {
        let mut state = LockoutState::default();
        let now = t0();
        for i in 1..=4 {
            let (next, locked) = on_login_failure(&cfg(), state, now);
            assert!(!locked, "failure {i} must not lock yet");
            state = next;
        }
        let (state, locked) = on_login_failure(&cfg(), state, now);
        assert!(locked);
        assert_eq!(state.locked_until, Some(now + Duration::minutes(30)));
        match evaluate_login(state, now + Duration::minutes(1)) {
            LoginGate::Locked {
                retry_after_minutes,
            } => assert_eq!(retry_after_minutes, 29),
            other => panic!("expected locked, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_counter() {
        let (state, _) = on_login_failure(&cfg(), LockoutState::default(), t0());
        let state = on_login_success(state, t0());
        assert_eq!(state.failed_count, 0);
    }

    #[test]
    fn expired_lock_collapses_before_processing() {
        let now = t0();
        let state = LockoutState {
            failed_count: 5,
            locked_until: Some(now),
            otp: None,
        };
        // now >= until: the lock is over.
        match evaluate_login(state, now) {
            LoginGate::Allowed(s) => {
                assert_eq!(s.failed_count, 0);
                assert!(s.locked_until.is_none());
            }
            other => panic!("expected allowed, got {other:?}"),
        }
    }

    fn locked_state(now: DateTime<Utc>) -> LockoutState {
        LockoutState {
            failed_count: 5,
            locked_until: Some(now + Duration::minutes(30)),
            otp: None,
        }
    }

    #[test]
    fn otp_flow_unlocks() {
        let now = t0();
        let state = locked_state(now);
        let OtpIssue::Issued(state) = issue_otp(&cfg(), state, now, "digest-a".to_string())
        else {
            panic!("expected issue");
        };
        match verify_otp(state, now + Duration::minutes(1), "digest-a") {
            OtpVerdict::Unlocked(s) => {
                assert_eq!(s.failed_count, 0);
                assert!(s.locked_until.is_none());
                assert!(s.otp.is_none());
            }
            other => panic!("expected unlock, got {other:?}"),
        }
    }

    #[test]
    fn three_wrong_codes_revert_to_locked() {
        let now = t0();
        let OtpIssue::Issued(mut state) =
            issue_otp(&cfg(), locked_state(now), now, "digest-a".to_string())
        else {
            panic!("expected issue");
        };

        for expected_remaining in [2u32, 1] {
            match verify_otp(state, now, "wrong") {
                OtpVerdict::WrongCode {
                    state: next,
                    attempts_remaining,
                } => {
                    assert_eq!(attempts_remaining, expected_remaining);
                    state = next;
                }
                other => panic!("expected wrong code, got {other:?}"),
            }
        }

        match verify_otp(state, now, "wrong") {
            OtpVerdict::AttemptsExhausted(s) => {
                assert!(s.otp.is_none(), "challenge consumed");
                assert!(s.is_locked(now), "still locked");
                // A further verify without a fresh request is Expired.
                assert_eq!(verify_otp(s, now, "digest-a"), OtpVerdict::Expired);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn expired_challenge_is_rejected() {
        let now = t0();
        let OtpIssue::Issued(state) =
            issue_otp(&cfg(), locked_state(now), now, "digest-a".to_string())
        else {
            panic!("expected issue");
        };
        assert_eq!(
            verify_otp(state, now + Duration::minutes(11), "digest-a"),
            OtpVerdict::Expired
        );
    }

    #[test]
    fn reissue_replaces_prior_challenge() {
        let now = t0();
        let OtpIssue::Issued(state) =
            issue_otp(&cfg(), locked_state(now), now, "digest-a".to_string())
        else {
            panic!("expected issue");
        };
        let OtpIssue::Issued(state) = issue_otp(&cfg(), state, now, "digest-b".to_string())
        else {
            panic!("expected reissue");
        };
        // Old code no longer verifies; new one does.
        match verify_otp(state.clone(), now, "digest-a") {
            OtpVerdict::WrongCode { .. } => {}
            other => panic!("expected wrong code, got {other:?}"),
        }
        assert!(matches!(
            verify_otp(state, now, "digest-b"),
            OtpVerdict::Unlocked(_)
        ));
    }

    #[test]
    fn otp_issue_requires_lock() {
        assert_eq!(
            issue_otp(&cfg(), LockoutState::default(), t0(), "d".to_string()),
            OtpIssue::NotLocked
        );
    }
}
