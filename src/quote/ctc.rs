//! CTC safety-replication cost.
//!
//! Replicates the user's floor with three put legs from the IV ladder and
//! prices the replication as an internal fee floor. Not applicable for
//! Bronze at low leverage or when the ladder has no usable legs.

use crate::config::RiskControls;
use crate::marketdata::LadderSnapshot;
use crate::models::Tier;
use crate::money::Usd;
use crate::quote::fees::is_bronze_low_leverage;

/// (target tenor days, weight); weights sum to 1.
const LEG_WEIGHTS: [(f64, f64); 3] = [(1.0, 0.2), (3.0, 0.3), (7.0, 0.5)];
/// Tenor distance dominates bucket distance when scoring ladder legs.
const TENOR_SCORE_WEIGHT: f64 = 10.0;

pub fn ctc_replication_cost(
    controls: &RiskControls,
    tier: &Tier,
    leverage: f64,
    ladder: Option<&LadderSnapshot>,
    notional: Usd,
    drawdown_pct: f64,
    floor_price: f64,
) -> Option<Usd> {
    if !controls.ctc_enabled || is_bronze_low_leverage(tier, leverage) {
        return None;
    }
    let ladder = ladder?;
    if ladder.legs.is_empty() || floor_price <= 0.0 {
        return None;
    }

    let target_usd = notional
        .mul_ratio(drawdown_pct)?
        .mul_ratio(1.0 + controls.ctc_buffer_pct)?;

    let mut total = Usd::ZERO;
    for (tenor, weight) in LEG_WEIGHTS {
        let leg = ladder.legs.iter().min_by(|a, b| {
            let score_a = TENOR_SCORE_WEIGHT * (a.tenor_days - tenor).abs()
                + (drawdown_pct - a.floor_pct).abs();
            let score_b = TENOR_SCORE_WEIGHT * (b.tenor_days - tenor).abs()
                + (drawdown_pct - b.floor_pct).abs();
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        let intrinsic = leg.strike - floor_price;
        if intrinsic <= 0.0 {
            return None;
        }
        let leg_size = target_usd.mul_ratio(weight)?.to_f64() / intrinsic;
        let leg_cost = Usd::from_f64(leg_size * leg.mark_price_usd)?;
        total += leg_cost;
    }

    let margin_pct = controls
        .ctc_margin_pct_by_tier
        .get(&tier.name)
        .copied()
        .unwrap_or(0.0);
    let ops_buffer = controls
        .ctc_ops_buffer_usdc_by_tier
        .get(&tier.name)
        .and_then(|v| Usd::from_f64(*v))
        .unwrap_or(Usd::ZERO);

    Some(total.mul_ratio(1.0 + margin_pct)? + ops_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketdata::ladder::snapshot_from_legs;
    use crate::marketdata::LadderSnapshotLeg;

    fn tier(name: &str) -> Tier {
        Tier {
            name: name.to_string(),
            deposit: Usd::from_i64(500),
            funding: Usd::from_i64(2_500),
            profit_target: Usd::from_i64(250),
            drawdown_limit_pct: 0.2,
            fixed_price_usdc: Usd::from_i64(10),
            expiry_days: Some(7),
            renew_window_minutes: None,
            buffer_alert_pct: None,
        }
    }

    fn leg(tenor: f64, floor: f64, strike: f64, price: f64) -> LadderSnapshotLeg {
        LadderSnapshotLeg {
            instrument: format!("L-{tenor}-{floor}"),
            tenor_days: tenor,
            floor_pct: floor,
            strike,
            iv: 0.5,
            mark_price_usd: price,
        }
    }

    fn enabled_controls() -> RiskControls {
        let mut c = RiskControls::default();
        c.ctc_enabled = true;
        c.ctc_buffer_pct = 0.0;
        c
    }

    #[test]
    fn test_three_leg_cost() {
        let c = enabled_controls();
        // floor = 40_000; intrinsic 2_000 per leg
        let ladder = snapshot_from_legs(
            0.5,
            0.6,
            vec![
                leg(1.0, 0.2, 42_000.0, 100.0),
                leg(3.0, 0.2, 42_000.0, 150.0),
                leg(7.0, 0.2, 42_000.0, 200.0),
            ],
        );
        let cost = ctc_replication_cost(
            &c,
            &tier("Pro (Silver)"),
            3.0,
            Some(&ladder),
            Usd::from_i64(5_000),
            0.2,
            40_000.0,
        )
        .unwrap();
        // targetUsd = 1000; sizes 0.2/1000*.. : leg sizes = 1000*w/2000
        // costs: 0.1*100 + 0.15*150 + 0.25*200 = 10 + 22.5 + 50 = 82.5
        assert_eq!(cost.fmt_2dp(), "82.50");
    }

    #[test]
    fn test_not_applicable_paths() {
        let c = enabled_controls();
        let ladder = snapshot_from_legs(0.5, 0.6, vec![leg(1.0, 0.2, 42_000.0, 100.0)]);
        // Bronze at low leverage
        assert!(ctc_replication_cost(
            &c,
            &tier("Pro (Bronze)"),
            2.0,
            Some(&ladder),
            Usd::from_i64(5_000),
            0.2,
            40_000.0
        )
        .is_none());
        // No ladder
        assert!(ctc_replication_cost(
            &c,
            &tier("Pro (Silver)"),
            3.0,
            None,
            Usd::from_i64(5_000),
            0.2,
            40_000.0
        )
        .is_none());
        // Strike below the floor has no intrinsic to replicate with.
        let below = snapshot_from_legs(0.5, 0.6, vec![leg(1.0, 0.2, 39_000.0, 100.0)]);
        assert!(ctc_replication_cost(
            &c,
            &tier("Pro (Silver)"),
            3.0,
            Some(&below),
            Usd::from_i64(5_000),
            0.2,
            40_000.0
        )
        .is_none());
    }

    #[test]
    fn test_margin_and_ops_buffer() {
        let mut c = enabled_controls();
        c.ctc_margin_pct_by_tier
            .insert("Pro (Silver)".to_string(), 0.1);
        c.ctc_ops_buffer_usdc_by_tier
            .insert("Pro (Silver)".to_string(), 5.0);
        let ladder = snapshot_from_legs(
            0.5,
            0.6,
            vec![
                leg(1.0, 0.2, 42_000.0, 100.0),
                leg(3.0, 0.2, 42_000.0, 150.0),
                leg(7.0, 0.2, 42_000.0, 200.0),
            ],
        );
        let cost = ctc_replication_cost(
            &c,
            &tier("Pro (Silver)"),
            3.0,
            Some(&ladder),
            Usd::from_i64(5_000),
            0.2,
            40_000.0,
        )
        .unwrap();
        // 82.5 * 1.1 + 5 = 95.75
        assert_eq!(cost.fmt_2dp(), "95.75");
    }
}
