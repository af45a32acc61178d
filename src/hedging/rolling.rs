//! Rolling-hedge decision: buffer band with hysteresis plus the renew gate.

use chrono::{DateTime, Duration, Utc};

use crate::models::{HedgeAction, HedgeDecision};

/// Buffer below target grows the hedge; buffer above target + hysteresis
/// shrinks it; the band between holds.
pub fn decide_buffer(buffer_pct: f64, target_pct: f64, hysteresis_pct: f64) -> (HedgeAction, &'static str) {
    if buffer_pct < target_pct {
        (HedgeAction::Increase, "buffer_below_target")
    } else if buffer_pct > target_pct + hysteresis_pct {
        (HedgeAction::Decrease, "buffer_above_target")
    } else {
        (HedgeAction::Hold, "buffer_in_band")
    }
}

/// renew <=> now >= expiry - window
pub fn should_renew(now: DateTime<Utc>, expiry: DateTime<Utc>, window_minutes: i64) -> bool {
    now >= expiry - Duration::minutes(window_minutes.max(0))
}

pub fn decide(
    buffer_pct: f64,
    target_pct: f64,
    hysteresis_pct: f64,
    now: DateTime<Utc>,
    expiry: DateTime<Utc>,
    renew_window_minutes: i64,
) -> HedgeDecision {
    let (action, reason) = decide_buffer(buffer_pct, target_pct, hysteresis_pct);
    HedgeDecision {
        action,
        reason,
        renew: should_renew(now, expiry, renew_window_minutes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_bands() {
        // 1.2% buffer vs 5% target: increase.
        let (action, reason) = decide_buffer(0.012, 0.05, 0.02);
        assert_eq!(action, HedgeAction::Increase);
        assert_eq!(reason, "buffer_below_target");

        // inside [target, target+hysteresis]: hold.
        let (action, _) = decide_buffer(0.06, 0.05, 0.02);
        assert_eq!(action, HedgeAction::Hold);

        let (action, reason) = decide_buffer(0.08, 0.05, 0.02);
        assert_eq!(action, HedgeAction::Decrease);
        assert_eq!(reason, "buffer_above_target");
    }

    #[test]
    fn test_band_edges() {
        // Exactly at target holds; exactly at target+hysteresis holds.
        assert_eq!(decide_buffer(0.05, 0.05, 0.02).0, HedgeAction::Hold);
        assert_eq!(decide_buffer(0.07, 0.05, 0.02).0, HedgeAction::Hold);
    }

    #[test]
    fn test_renew_window_boundary() {
        let expiry = Utc::now() + Duration::minutes(10);
        assert!(should_renew(Utc::now(), expiry, 15));
        assert!(!should_renew(Utc::now(), expiry, 5));
        // exactly at the boundary renews
        let now = expiry - Duration::minutes(15);
        assert!(should_renew(now, expiry, 15));
    }
}
