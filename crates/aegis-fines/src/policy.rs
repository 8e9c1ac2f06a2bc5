//! Progressive fine arithmetic.

use aegis_config::settings::FineSettings;

#[derive(Debug, Clone)]
pub struct FinePolicy {
    pub base_cents: i64,
    pub multiplier: f64,
    pub cap_cents: i64,
    pub fine_threshold: u32,
    pub suspend_threshold: u32,
    pub ban_threshold: u32,
    pub recent_window_days: i64,
}

impl FinePolicy {
    pub fn from_settings(s: &FineSettings) -> Self {
        Self {
            base_cents: s.base_cents,
            multiplier: s.multiplier,
            cap_cents: s.cap_cents,
            fine_threshold: s.fine_threshold,
            suspend_threshold: s.suspend_threshold,
            ban_threshold: s.ban_threshold,
            recent_window_days: s.recent_window_days,
        }
    }

    /// Fine for the Nth recent prank: none below the threshold, then
    /// `base × multiplier^(recent − threshold)` capped.
    pub fn fine_amount_cents(&self, recent_count: u32) -> Option<i64> {
        if recent_count < self.fine_threshold {
            return None;
        }
        let steps = recent_count - self.fine_threshold;
        let raw = self.base_cents as f64 * self.multiplier.powi(steps as i32);
        Some((raw.round() as i64).min(self.cap_cents))
    }

    /// Standing after a prank event, given the lifetime total and whether
    /// any fine remains unpaid once this event's fine (if any) lands.
    pub fn evaluate(&self, total_count: u32, recent_count: u32, unpaid_after: bool) -> FineDecision {
        FineDecision {
            fine_cents: self.fine_amount_cents(recent_count),
            suspend: total_count >= self.suspend_threshold && unpaid_after,
            ban: total_count >= self.ban_threshold,
        }
    }
}

impl Default for FinePolicy {
    fn default() -> Self {
        Self::from_settings(&FineSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FineDecision {
    pub fine_cents: Option<i64>,
    pub suspend: bool,
    pub ban: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_no_fine() {
        let p = FinePolicy::default();
        assert_eq!(p.fine_amount_cents(0), None);
        assert_eq!(p.fine_amount_cents(2), None);
    }

    #[test]
    fn progression_50_75_112_50() {
        let p = FinePolicy::default();
        assert_eq!(p.fine_amount_cents(3), Some(5_000));
        assert_eq!(p.fine_amount_cents(4), Some(7_500));
        assert_eq!(p.fine_amount_cents(5), Some(11_250));
    }

    #[test]
    fn cap_applies() {
        let p = FinePolicy::default();
        // 50 * 1.5^9 is about 1923, well past the $500 cap.
        assert_eq!(p.fine_amount_cents(12), Some(50_000));
    }

    #[test]
    fn suspension_needs_both_count_and_unpaid() {
        let p = FinePolicy::default();
        assert!(!p.evaluate(4, 4, true).suspend);
        assert!(!p.evaluate(5, 5, false).suspend);
        assert!(p.evaluate(5, 5, true).suspend);
    }

    #[test]
    fn ban_at_ten_regardless_of_payment() {
        let p = FinePolicy::default();
        assert!(!p.evaluate(9, 3, true).ban);
        assert!(p.evaluate(10, 3, false).ban);
    }
}
