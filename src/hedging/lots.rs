//! Hedge lot ledger.
//!
//! One signed lot per instrument with a USDC average cost. Same-direction
//! fills average cost; opposite-direction fills realize P&L against the
//! average and reduce size; a flat lot resets its average to zero. This is
//! the source of truth for realized and unrealized hedge MTM.

use serde::Serialize;
use std::collections::HashMap;

use crate::models::OrderSide;
use crate::money::Usd;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HedgeLot {
    /// Signed size: positive long, negative short.
    pub size: f64,
    pub avg_cost_usdc: Usd,
}

#[derive(Debug, Default)]
pub struct HedgeLotBook {
    lots: HashMap<String, HedgeLot>,
    realized_pnl: Usd,
}

impl HedgeLotBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one fill; returns the P&L realized by this fill (zero for
    /// same-direction adds).
    pub fn apply_fill(
        &mut self,
        instrument: &str,
        side: OrderSide,
        size: f64,
        price_usd: f64,
    ) -> Usd {
        if !(size > 0.0) || !price_usd.is_finite() {
            return Usd::ZERO;
        }
        let signed = match side {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        };
        let lot = self.lots.entry(instrument.to_string()).or_insert(HedgeLot {
            size: 0.0,
            avg_cost_usdc: Usd::ZERO,
        });

        let mut realized = Usd::ZERO;
        if lot.size == 0.0 || lot.size.signum() == signed.signum() {
            // Extending: weighted average cost.
            let total_cost = lot.avg_cost_usdc.to_f64() * lot.size.abs() + price_usd * size;
            let new_abs = lot.size.abs() + size;
            lot.avg_cost_usdc = Usd::from_f64(total_cost / new_abs).unwrap_or(lot.avg_cost_usdc);
            lot.size += signed;
        } else {
            // Reducing: realize against average cost. Long lots profit when
            // the exit is above cost; short lots when it is below.
            let closed = size.min(lot.size.abs());
            let per_unit = match lot.size > 0.0 {
                true => price_usd - lot.avg_cost_usdc.to_f64(),
                false => lot.avg_cost_usdc.to_f64() - price_usd,
            };
            realized = Usd::from_f64(per_unit * closed).unwrap_or(Usd::ZERO);
            self.realized_pnl += realized;

            let remainder = size - closed;
            lot.size += signed.signum() * closed;
            if lot.size.abs() < 1e-12 {
                lot.size = 0.0;
                lot.avg_cost_usdc = Usd::ZERO;
            }
            if remainder > 1e-12 {
                // Flipped through flat: remainder opens the opposite way.
                lot.size = signed.signum() * remainder;
                lot.avg_cost_usdc = Usd::from_f64(price_usd).unwrap_or(Usd::ZERO);
            }
        }
        realized
    }

    pub fn realized_pnl(&self) -> Usd {
        self.realized_pnl
    }

    /// Mark-to-market against per-instrument USD marks; instruments without
    /// a mark are skipped.
    pub fn unrealized(&self, marks: &HashMap<String, f64>) -> Usd {
        self.lots
            .iter()
            .filter(|(_, lot)| lot.size != 0.0)
            .filter_map(|(instrument, lot)| {
                let mark = marks.get(instrument)?;
                Usd::from_f64((mark - lot.avg_cost_usdc.to_f64()) * lot.size)
            })
            .sum()
    }

    pub fn get(&self, instrument: &str) -> Option<HedgeLot> {
        self.lots.get(instrument).copied()
    }

    pub fn open_lots(&self) -> Vec<(String, HedgeLot)> {
        let mut out: Vec<(String, HedgeLot)> = self
            .lots
            .iter()
            .filter(|(_, lot)| lot.size != 0.0)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn clear(&mut self) {
        self.lots.clear();
        self.realized_pnl = Usd::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_direction_averages_cost() {
        let mut book = HedgeLotBook::new();
        book.apply_fill("X", OrderSide::Buy, 1.0, 100.0);
        book.apply_fill("X", OrderSide::Buy, 1.0, 110.0);
        let lot = book.get("X").unwrap();
        assert_eq!(lot.size, 2.0);
        assert_eq!(lot.avg_cost_usdc.fmt_2dp(), "105.00");
        assert!(book.realized_pnl().is_zero());
    }

    #[test]
    fn test_reduce_realizes_and_resets_at_flat() {
        let mut book = HedgeLotBook::new();
        book.apply_fill("X", OrderSide::Buy, 2.0, 100.0);
        let realized = book.apply_fill("X", OrderSide::Sell, 1.0, 120.0);
        assert_eq!(realized.fmt_2dp(), "20.00");
        let lot = book.get("X").unwrap();
        assert_eq!(lot.size, 1.0);
        assert_eq!(lot.avg_cost_usdc.fmt_2dp(), "100.00");

        let realized = book.apply_fill("X", OrderSide::Sell, 1.0, 90.0);
        assert_eq!(realized.fmt_2dp(), "-10.00");
        let lot = book.get("X").unwrap();
        assert_eq!(lot.size, 0.0);
        assert_eq!(lot.avg_cost_usdc.fmt_2dp(), "0.00");
        assert_eq!(book.realized_pnl().fmt_2dp(), "10.00");
    }

    #[test]
    fn test_short_lot_realizes_inverted() {
        let mut book = HedgeLotBook::new();
        book.apply_fill("X", OrderSide::Sell, 1.0, 100.0);
        // Buying back below the short's average is a gain.
        let realized = book.apply_fill("X", OrderSide::Buy, 1.0, 80.0);
        assert_eq!(realized.fmt_2dp(), "20.00");
        assert!(book.get("X").unwrap().size == 0.0);
    }

    #[test]
    fn test_flip_through_flat_reopens() {
        let mut book = HedgeLotBook::new();
        book.apply_fill("X", OrderSide::Buy, 1.0, 100.0);
        let realized = book.apply_fill("X", OrderSide::Sell, 3.0, 110.0);
        assert_eq!(realized.fmt_2dp(), "10.00");
        let lot = book.get("X").unwrap();
        assert_eq!(lot.size, -2.0);
        assert_eq!(lot.avg_cost_usdc.fmt_2dp(), "110.00");
    }

    #[test]
    fn test_unrealized_marks() {
        let mut book = HedgeLotBook::new();
        book.apply_fill("LONG", OrderSide::Buy, 2.0, 100.0);
        book.apply_fill("SHORT", OrderSide::Sell, 1.0, 50.0);
        let marks = HashMap::from([("LONG".to_string(), 110.0), ("SHORT".to_string(), 45.0)]);
        // (110-100)*2 + (45-50)*(-1) = 20 + 5
        assert_eq!(book.unrealized(&marks).fmt_2dp(), "25.00");
    }
}
