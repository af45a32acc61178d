//! Protection fee engine.
//!
//! A pure function of (tier, days, leverage, iv): min-fee floor, duration
//! uplift, IV-regime multiplier, leverage multiplier, the Bronze low-lev
//! fixed price, and the CTC safety-replication floor. Returns `None` only
//! when arithmetic degenerates; callers map that to `no_quote`.

use crate::config::RiskControls;
use crate::models::{FeeRegime, Tier};
use crate::money::Usd;

pub const BRONZE_TIER: &str = "Pro (Bronze)";
pub const BRONZE_FIXED_FEE_USDC: i64 = 20;
pub const BRONZE_MAX_LEVERAGE: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct FeeBreakdown {
    pub fee: Usd,
    pub regime: Option<FeeRegime>,
    /// `base`, `bronze_fixed` or `ctc_safety`.
    pub reason: &'static str,
}

pub fn is_bronze_low_leverage(tier: &Tier, leverage: f64) -> bool {
    tier.name == BRONZE_TIER && leverage <= BRONZE_MAX_LEVERAGE
}

/// Classify the ladder-normalized IV into a fee regime. The volatility
/// throttle acts as a second high-water mark so operators can force the
/// high regime without moving the regime thresholds.
pub fn classify_regime(controls: &RiskControls, iv: f64) -> FeeRegime {
    let high_mark = controls
        .fee_iv_regime_thresholds
        .high
        .min(controls.volatility_throttle_iv);
    if iv >= high_mark {
        FeeRegime::High
    } else if iv <= controls.fee_iv_regime_thresholds.low {
        FeeRegime::Low
    } else {
        FeeRegime::Normal
    }
}

pub fn compute_fee(
    controls: &RiskControls,
    tier: &Tier,
    days: u32,
    leverage: f64,
    iv: Option<f64>,
    ctc_cost: Option<Usd>,
) -> Option<FeeBreakdown> {
    // 1. min-fee floor over the tier's fixed price
    let base = tier.fixed_price_usdc;
    let mut fee = match controls.min_fee_for_tier(&tier.name) {
        Some(min_fee) => base.max(min_fee),
        None => base,
    };

    // 2. duration uplift
    let extra_days = days.saturating_sub(controls.duration_fee_base_days) as f64;
    let uplift = (controls.duration_fee_per_day_pct * extra_days).min(controls.duration_fee_max_pct);
    fee = fee.mul_ratio(1.0 + uplift)?;

    // 3/4. IV regime multiplier, else the tier-specific uplift
    let mut regime = None;
    if let Some(iv) = iv.filter(|v| v.is_finite() && *v > 0.0) {
        let r = classify_regime(controls, iv);
        regime = Some(r);
        let multiplier = controls
            .fee_iv_regime_multipliers_by_tier
            .get(&tier.name)
            .and_then(|m| m.get(r.as_str()))
            .copied();
        match multiplier {
            Some(m) => fee = fee.mul_ratio(m)?,
            None => {
                let threshold = controls
                    .fee_iv_uplift_threshold_by_tier
                    .get(&tier.name)
                    .copied();
                if let Some(threshold) = threshold {
                    if iv > threshold {
                        let m = controls
                            .fee_iv_uplift_multiplier_by_tier
                            .get(&tier.name)
                            .copied()
                            .unwrap_or(1.0);
                        fee = fee.mul_ratio(m)?;
                    }
                }
            }
        }
    }

    // 5. leverage multiplier by largest bucket <= leverage
    fee = fee.mul_ratio(controls.leverage_multiplier(leverage))?;

    // 6. Bronze at low leverage is a flat price, applied exactly once
    if is_bronze_low_leverage(tier, leverage) {
        return Some(FeeBreakdown {
            fee: Usd::from_i64(BRONZE_FIXED_FEE_USDC),
            regime,
            reason: "bronze_fixed",
        });
    }

    // 7. CTC safety replication is an internal floor
    if controls.ctc_enabled {
        if let Some(ctc) = ctc_cost {
            if ctc > fee {
                return Some(FeeBreakdown {
                    fee: ctc,
                    regime,
                    reason: "ctc_safety",
                });
            }
        }
    }

    Some(FeeBreakdown {
        fee,
        regime,
        reason: "base",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(name: &str, fixed: i64) -> Tier {
        Tier {
            name: name.to_string(),
            deposit: Usd::from_i64(500),
            funding: Usd::from_i64(2_500),
            profit_target: Usd::from_i64(250),
            drawdown_limit_pct: 0.2,
            fixed_price_usdc: Usd::from_i64(fixed),
            expiry_days: Some(7),
            renew_window_minutes: Some(15),
            buffer_alert_pct: None,
        }
    }

    fn controls() -> RiskControls {
        let mut c = RiskControls::default();
        c.min_fee_usdc_by_tier
            .insert("Pro (Silver)".to_string(), 15.0);
        c.duration_fee_per_day_pct = 0.05;
        c.duration_fee_max_pct = 0.5;
        c.duration_fee_base_days = 1;
        c.fee_leverage_multipliers_by_x.extend([
            ("2".to_string(), 1.0),
            ("5".to_string(), 1.5),
            ("10".to_string(), 2.5),
        ]);
        c
    }

    #[test]
    fn test_bronze_low_leverage_is_flat_twenty() {
        let c = controls();
        let breakdown =
            compute_fee(&c, &tier(BRONZE_TIER, 10), 7, 2.0, None, None).unwrap();
        assert_eq!(breakdown.fee.fmt_2dp(), "20.00");
        assert_eq!(breakdown.reason, "bronze_fixed");
    }

    #[test]
    fn test_min_fee_floor_applies() {
        let c = controls();
        // fixed price 5 < min fee 15, 1 day so no uplift, 1x leverage
        let breakdown =
            compute_fee(&c, &tier("Pro (Silver)", 5), 1, 1.0, None, None).unwrap();
        assert_eq!(breakdown.fee.fmt_2dp(), "15.00");
    }

    #[test]
    fn test_duration_uplift_capped() {
        let c = controls();
        // 30 days: raw uplift 1.45 capped at 0.5 -> 15 * 1.5
        let breakdown =
            compute_fee(&c, &tier("Pro (Silver)", 5), 30, 1.0, None, None).unwrap();
        assert_eq!(breakdown.fee.fmt_2dp(), "22.50");
    }

    #[test]
    fn test_fee_monotone_in_leverage_bucket() {
        let c = controls();
        let t = tier("Pro (Silver)", 10);
        let mut last = Usd::ZERO;
        for leverage in [1.0, 2.0, 3.0, 5.0, 8.0, 10.0, 20.0] {
            let fee = compute_fee(&c, &t, 3, leverage, None, None).unwrap().fee;
            assert!(fee >= last, "fee not monotone at {leverage}x");
            last = fee;
        }
    }

    #[test]
    fn test_high_regime_multiplier() {
        let mut c = controls();
        c.volatility_throttle_iv = 0.8;
        c.fee_iv_regime_multipliers_by_tier.insert(
            "Pro (Silver)".to_string(),
            [("high".to_string(), 1.6), ("low".to_string(), 0.9)]
                .into_iter()
                .collect(),
        );
        let t = tier("Pro (Silver)", 5);
        let breakdown = compute_fee(&c, &t, 1, 1.0, Some(0.95), None).unwrap();
        assert_eq!(breakdown.regime, Some(FeeRegime::High));
        assert_eq!(breakdown.fee.fmt_2dp(), "24.00");
    }

    #[test]
    fn test_ctc_floor_replaces_smaller_fee() {
        let mut c = controls();
        c.ctc_enabled = true;
        let t = tier("Pro (Silver)", 5);
        let breakdown =
            compute_fee(&c, &t, 1, 1.0, None, Some(Usd::from_i64(40))).unwrap();
        assert_eq!(breakdown.fee.fmt_2dp(), "40.00");
        assert_eq!(breakdown.reason, "ctc_safety");

        let small = compute_fee(&c, &t, 1, 1.0, None, Some(Usd::from_i64(1)))
            .unwrap();
        assert_eq!(small.reason, "base");
    }

    #[test]
    fn test_bronze_high_leverage_not_flat() {
        let c = controls();
        let breakdown =
            compute_fee(&c, &tier(BRONZE_TIER, 10), 1, 5.0, None, None).unwrap();
        assert_eq!(breakdown.fee.fmt_2dp(), "15.00"); // 10 * 1.5x bucket
        assert_eq!(breakdown.reason, "base");
    }
}
