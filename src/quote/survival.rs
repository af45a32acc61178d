//! Floor-credit survival check.
//!
//! The chosen hedge must pay out at least `tolerance_pct` of the credit the
//! coverage owes if equity lands exactly on the drawdown floor.

use crate::models::{OptionType, SurvivalCheck};
use crate::money::Usd;

pub fn survival_check(
    spot: f64,
    drawdown_pct: f64,
    option_type: OptionType,
    strike: f64,
    hedge_size: f64,
    required_size: f64,
    tolerance_pct: f64,
) -> SurvivalCheck {
    let floor = match option_type {
        OptionType::Put => spot * (1.0 - drawdown_pct),
        OptionType::Call => spot * (1.0 + drawdown_pct),
    };

    let required_credit = (spot - floor).abs() * required_size;
    let intrinsic = match option_type {
        OptionType::Put => (strike - floor).max(0.0),
        OptionType::Call => (floor - strike).max(0.0),
    };
    let hedge_credit = intrinsic * hedge_size;

    let coverage_ratio = if required_credit > 0.0 {
        hedge_credit / required_credit
    } else {
        0.0
    };

    SurvivalCheck {
        pass: coverage_ratio >= tolerance_pct,
        coverage_ratio,
        required_credit: Usd::from_f64(required_credit).unwrap_or(Usd::ZERO),
        hedge_credit: Usd::from_f64(hedge_credit).unwrap_or(Usd::ZERO),
        floor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_at_floor_strike_passes() {
        // spot 50k, dd 20% -> floor 40k; strike at 40k has zero intrinsic
        // at the floor, so it cannot survive.
        let at_floor = survival_check(50_000.0, 0.2, OptionType::Put, 40_000.0, 0.1, 0.1, 0.98);
        assert!(!at_floor.pass);

        // Strike above spot fully covers the drop.
        let deep = survival_check(50_000.0, 0.2, OptionType::Put, 50_000.0, 0.1, 0.1, 0.98);
        assert!(deep.pass);
        assert!((deep.coverage_ratio - 1.0).abs() < 1e-9);
        assert_eq!(deep.required_credit.fmt_2dp(), "1000.00");
    }

    #[test]
    fn test_put_partial_strike() {
        // strike 49k: intrinsic at floor 9k vs required 10k per unit
        let check = survival_check(50_000.0, 0.2, OptionType::Put, 49_000.0, 0.1, 0.1, 0.98);
        assert!((check.coverage_ratio - 0.9).abs() < 1e-9);
        assert!(!check.pass);
        let relaxed = survival_check(50_000.0, 0.2, OptionType::Put, 49_000.0, 0.1, 0.1, 0.9);
        assert!(relaxed.pass);
    }

    #[test]
    fn test_call_side_mirror() {
        // Short position: floor above spot, call strike below the floor pays.
        let check = survival_check(50_000.0, 0.2, OptionType::Call, 50_000.0, 0.1, 0.1, 0.98);
        assert_eq!(check.floor, 60_000.0);
        assert!((check.coverage_ratio - 1.0).abs() < 1e-9);
        assert!(check.pass);
    }

    #[test]
    fn test_oversized_hedge_overshoots() {
        let check = survival_check(50_000.0, 0.2, OptionType::Put, 50_000.0, 0.2, 0.1, 0.98);
        assert!(check.coverage_ratio > 1.9);
        assert!(check.pass);
    }
}
