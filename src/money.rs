//! USDC money arithmetic.
//!
//! Every monetary value in the engine is a `Usd` (fixed-scale decimal).
//! Floats are only used for IV, ratios and order-book sizes; converting a
//! float into `Usd` is an explicit, fallible step so NaN/inf never leak
//! into the ledger.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// Scale used when converting floats in; keeps sub-cent premium components.
const INGEST_SCALE: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Usd(Decimal);

impl Usd {
    pub const ZERO: Usd = Usd(Decimal::ZERO);

    pub fn new(mantissa: i64, scale: u32) -> Self {
        Usd(Decimal::new(mantissa, scale))
    }

    pub fn from_decimal(d: Decimal) -> Self {
        Usd(d)
    }

    /// Convert a float amount; `None` when non-finite.
    pub fn from_f64(v: f64) -> Option<Self> {
        if !v.is_finite() {
            return None;
        }
        Decimal::from_f64(v).map(|d| Usd(d.round_dp(INGEST_SCALE)))
    }

    pub fn from_i64(v: i64) -> Self {
        Usd(Decimal::from(v))
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }

    /// Multiply by a dimensionless ratio; `None` when the ratio is non-finite.
    pub fn mul_ratio(self, ratio: f64) -> Option<Self> {
        if !ratio.is_finite() {
            return None;
        }
        Decimal::from_f64(ratio).map(|r| Usd(self.0 * r))
    }

    /// Ratio of two amounts as a float; `None` when `other` is zero.
    pub fn ratio_to(self, other: Usd) -> Option<f64> {
        if other.0.is_zero() {
            return None;
        }
        (self.0 / other.0).to_f64()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn abs(self) -> Self {
        Usd(self.0.abs())
    }

    pub fn min(self, other: Usd) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Usd) -> Self {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    /// Wire form: 2-dp string, the contract for every USDC field. Half-cent
    /// values round away from zero, conventional money rounding.
    pub fn fmt_2dp(self) -> String {
        format!(
            "{:.2}",
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        )
    }
}

impl Add for Usd {
    type Output = Usd;
    fn add(self, rhs: Usd) -> Usd {
        Usd(self.0 + rhs.0)
    }
}

impl Sub for Usd {
    type Output = Usd;
    fn sub(self, rhs: Usd) -> Usd {
        Usd(self.0 - rhs.0)
    }
}

impl AddAssign for Usd {
    fn add_assign(&mut self, rhs: Usd) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Usd {
    fn sub_assign(&mut self, rhs: Usd) {
        self.0 -= rhs.0;
    }
}

impl Neg for Usd {
    type Output = Usd;
    fn neg(self) -> Usd {
        Usd(-self.0)
    }
}

impl Sum for Usd {
    fn sum<I: Iterator<Item = Usd>>(iter: I) -> Usd {
        iter.fold(Usd::ZERO, |acc, v| acc + v)
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fmt_2dp())
    }
}

impl Serialize for Usd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.fmt_2dp())
    }
}

impl<'de> Deserialize<'de> for Usd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        match v {
            serde_json::Value::String(s) => Decimal::from_str(s.trim())
                .map(Usd)
                .map_err(|_| serde::de::Error::custom("invalid USDC string")),
            serde_json::Value::Number(n) => n
                .as_f64()
                .and_then(Usd::from_f64)
                .ok_or_else(|| serde::de::Error::custom("invalid USDC number")),
            _ => Err(serde::de::Error::custom("expected USDC string or number")),
        }
    }
}

/// Hedge sizes travel as 4-dp strings.
pub fn fmt_size(size: f64) -> String {
    format!("{:.4}", size)
}

/// Base-asset unit quantities travel as 6-dp strings.
pub fn fmt_units(units: f64) -> String {
    format!("{:.6}", units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_two_dp() {
        assert_eq!(Usd::from_i64(20).fmt_2dp(), "20.00");
        assert_eq!(Usd::new(12345, 3).fmt_2dp(), "12.35");
        assert_eq!(Usd::ZERO.fmt_2dp(), "0.00");
    }

    #[test]
    fn test_from_f64_rejects_non_finite() {
        assert!(Usd::from_f64(f64::NAN).is_none());
        assert!(Usd::from_f64(f64::INFINITY).is_none());
        assert_eq!(Usd::from_f64(12.5).unwrap().fmt_2dp(), "12.50");
    }

    #[test]
    fn test_ledger_sum_is_exact() {
        // 0.1 + 0.2 drifts in f64; must not drift here.
        let total: Usd = (0..10).map(|_| Usd::new(1, 1)).sum();
        assert_eq!(total.fmt_2dp(), "1.00");
    }

    #[test]
    fn test_mul_ratio() {
        let fee = Usd::from_i64(10);
        assert_eq!(fee.mul_ratio(1.5).unwrap().fmt_2dp(), "15.00");
        assert!(fee.mul_ratio(f64::NAN).is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let v = Usd::new(2550, 2);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"25.50\"");
        let back: Usd = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        let from_num: Usd = serde_json::from_str("25.5").unwrap();
        assert_eq!(from_num.fmt_2dp(), "25.50");
    }
}
