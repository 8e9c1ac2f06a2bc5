//! Typed settings block.
//!
//! Every tunable the platform reads at process start, with the documented
//! defaults. The daemon deserializes this once from the merged config tree
//! and threads it through as plain data; nothing reads the environment after
//! boot except the store DSN.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP/WS bind address.
    pub bind_addr: String,
    /// Development mode relaxes attestation (`unsupported` passes).
    pub development_mode: bool,
    pub tokens: TokenSettings,
    pub lockout: LockoutSettings,
    pub otp: OtpSettings,
    pub fines: FineSettings,
    pub subscription: SubscriptionSettings,
    pub dispatch: DispatchSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8700".to_string(),
            development_mode: false,
            tokens: TokenSettings::default(),
            lockout: LockoutSettings::default(),
            otp: OtpSettings::default(),
            fines: FineSettings::default(),
            subscription: SubscriptionSettings::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub access_lifetime_minutes: i64,
    pub refresh_lifetime_days: i64,
    /// HMAC signing secret. Overridden per deployment; the default only
    /// exists so dev boots without a config file.
    pub signing_secret: String,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            access_lifetime_minutes: 60,
            refresh_lifetime_days: 7,
            signing_secret: "dev-only-insecure-secret".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutSettings {
    pub threshold: u32,
    pub duration_minutes: i64,
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            duration_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtpSettings {
    pub lifetime_minutes: i64,
    pub attempts: u32,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            lifetime_minutes: 10,
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FineSettings {
    /// Base fine in cents.
    pub base_cents: i64,
    pub multiplier: f64,
    /// Cap in cents.
    pub cap_cents: i64,
    /// Recent pranks (rolling 30 days) before the first fine.
    pub fine_threshold: u32,
    /// Total pranks before suspension (with an unpaid fine).
    pub suspend_threshold: u32,
    /// Total pranks before a permanent ban.
    pub ban_threshold: u32,
    /// Rolling window for "recent" pranks.
    pub recent_window_days: i64,
}

impl Default for FineSettings {
    fn default() -> Self {
        Self {
            base_cents: 5_000,
            multiplier: 1.5,
            cap_cents: 50_000,
            fine_threshold: 3,
            suspend_threshold: 5,
            ban_threshold: 10,
            recent_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub window_days: i64,
    pub grace_days: i64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            window_days: 30,
            grace_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// In-flight duplicate window per (phone, service_type).
    pub dedupe_window_minutes: i64,
    /// Max accepted panics per phone inside the burst window.
    pub max_requests_per_window: u32,
    pub burst_window_seconds: i64,
    /// pending older than this auto-cancels.
    pub pending_timeout_minutes: i64,
    /// allocated without acceptance reverts to pending after this.
    pub allocation_timeout_minutes: i64,
    /// accepted/en_route silence before supervisors are alerted.
    pub progress_silence_minutes: i64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            dedupe_window_minutes: 2,
            max_requests_per_window: 5,
            burst_window_seconds: 60,
            pending_timeout_minutes: 15,
            allocation_timeout_minutes: 10,
            progress_silence_minutes: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.tokens.access_lifetime_minutes, 60);
        assert_eq!(s.tokens.refresh_lifetime_days, 7);
        assert_eq!(s.lockout.threshold, 5);
        assert_eq!(s.lockout.duration_minutes, 30);
        assert_eq!(s.otp.lifetime_minutes, 10);
        assert_eq!(s.otp.attempts, 3);
        assert_eq!(s.fines.base_cents, 5_000);
        assert_eq!(s.fines.cap_cents, 50_000);
        assert_eq!(s.fines.fine_threshold, 3);
        assert_eq!(s.fines.suspend_threshold, 5);
        assert_eq!(s.fines.ban_threshold, 10);
        assert_eq!(s.subscription.window_days, 30);
        assert_eq!(s.subscription.grace_days, 7);
        assert_eq!(s.dispatch.dedupe_window_minutes, 2);
        assert_eq!(s.dispatch.max_requests_per_window, 5);
        assert_eq!(s.dispatch.pending_timeout_minutes, 15);
        assert_eq!(s.dispatch.allocation_timeout_minutes, 10);
        assert_eq!(s.dispatch.progress_silence_minutes, 30);
    }

    #[test]
    fn partial_tree_fills_from_defaults() {
        let v = serde_json::json!({"lockout": {"threshold": 7}});
        let s: Settings = serde_json::from_value(v).unwrap();
        assert_eq!(s.lockout.threshold, 7);
        assert_eq!(s.lockout.duration_minutes, 30);
        assert_eq!(s.otp.attempts, 3);
    }
}
