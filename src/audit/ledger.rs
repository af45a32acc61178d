//! Liquidity and subsidy accounting.
//!
//! Revenue is recognized once per coverage at activation; hedge orders
//! spend premium (options) or post margin (perps); realized hedge P&L is
//! credited back. `profit = revenue - hedgeSpend - subsidy` holds after
//! every mutation.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::config::RiskControls;
use crate::money::Usd;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityLedger {
    pub liquidity_balance_usdc: Usd,
    pub revenue_usdc: Usd,
    pub hedge_spend_usdc: Usd,
    pub hedge_margin_usdc: Usd,
    pub subsidy_usdc: Usd,
    pub profit_usdc: Usd,
    pub reinvest_usdc: Usd,
    pub reserve_usdc: Usd,
}

impl LiquidityLedger {
    pub fn new(seed_liquidity: Usd) -> Self {
        Self {
            liquidity_balance_usdc: seed_liquidity,
            ..Default::default()
        }
    }

    fn recompute(&mut self, reserve_pct: f64) {
        self.profit_usdc = self.revenue_usdc - self.hedge_spend_usdc - self.subsidy_usdc;
        self.reserve_usdc = self
            .liquidity_balance_usdc
            .mul_ratio(reserve_pct)
            .unwrap_or(Usd::ZERO)
            .max(Usd::ZERO);
    }

    /// Book protection-fee revenue. Exactly once per coverage; the caller
    /// enforces the `fee_recognized` guard.
    pub fn recognize_fee(&mut self, fee: Usd, reserve_pct: f64) {
        self.revenue_usdc += fee;
        self.liquidity_balance_usdc += fee;
        self.recompute(reserve_pct);
    }

    pub fn book_subsidy(&mut self, subsidy: Usd, reserve_pct: f64) {
        self.subsidy_usdc += subsidy;
        self.recompute(reserve_pct);
    }

    /// Option hedge: premium leaves the pool as spend.
    pub fn book_option_spend(&mut self, premium: Usd, reserve_pct: f64) {
        self.hedge_spend_usdc += premium;
        self.liquidity_balance_usdc -= premium;
        self.recompute(reserve_pct);
    }

    /// Perp hedge: margin is parked, not spent.
    pub fn book_perp_margin(&mut self, margin: Usd, reserve_pct: f64) {
        self.hedge_margin_usdc += margin;
        self.liquidity_balance_usdc -= margin;
        self.recompute(reserve_pct);
    }

    /// Realized hedge P&L flows back into the pool.
    pub fn credit_realized(&mut self, pnl: Usd, reserve_pct: f64) {
        self.liquidity_balance_usdc += pnl;
        self.recompute(reserve_pct);
    }

    /// Budget available to the net-exposure planner:
    /// `max(liquidity - reserve, revenue * riskBudgetMax - hedgeSpend)`.
    pub fn hedge_budget_remaining(&self, controls: &RiskControls) -> Usd {
        let liquidity_budget = self.liquidity_balance_usdc - self.reserve_usdc;
        let revenue_budget = self
            .revenue_usdc
            .mul_ratio(controls.risk_budget_pct_max)
            .unwrap_or(Usd::ZERO)
            - self.hedge_spend_usdc;
        liquidity_budget.max(revenue_budget).max(Usd::ZERO)
    }

    /// Spend ratio against revenue for the overage attenuator.
    pub fn spend_ratio(&self) -> f64 {
        self.hedge_spend_usdc
            .ratio_to(self.revenue_usdc)
            .unwrap_or(0.0)
    }

    pub fn zero(&mut self) {
        *self = LiquidityLedger::default();
    }
}

/// Daily subsidy caps per tier and per account; the day rolls at UTC
/// midnight.
#[derive(Debug, Default)]
pub struct SubsidyBook {
    day: Option<NaiveDate>,
    by_tier: HashMap<String, Usd>,
    by_account: HashMap<String, Usd>,
}

impl SubsidyBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn roll(&mut self) {
        let today = Utc::now().date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.by_tier.clear();
            self.by_account.clear();
        }
    }

    /// Remaining headroom today for this tier + account pair.
    pub fn allowance(&mut self, controls: &RiskControls, tier: &str, account: &str) -> Usd {
        self.roll();
        let tier_cap =
            Usd::from_f64(controls.subsidy_daily_cap_for_tier(tier)).unwrap_or(Usd::ZERO);
        let account_cap =
            Usd::from_f64(controls.subsidy_daily_cap_usdc_per_account).unwrap_or(Usd::ZERO);
        let tier_left =
            (tier_cap - self.by_tier.get(tier).copied().unwrap_or(Usd::ZERO)).max(Usd::ZERO);
        let account_left = (account_cap
            - self.by_account.get(account).copied().unwrap_or(Usd::ZERO))
        .max(Usd::ZERO);
        tier_left.min(account_left)
    }

    pub fn record(&mut self, tier: &str, account: &str, amount: Usd) {
        self.roll();
        *self.by_tier.entry(tier.to_string()).or_insert(Usd::ZERO) += amount;
        *self
            .by_account
            .entry(account.to_string())
            .or_insert(Usd::ZERO) += amount;
    }

    pub fn clear(&mut self) {
        self.day = None;
        self.by_tier.clear();
        self.by_account.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_identity_holds() {
        let mut ledger = LiquidityLedger::new(Usd::from_i64(10_000));
        ledger.recognize_fee(Usd::from_i64(20), 0.3);
        ledger.book_option_spend(Usd::from_i64(15), 0.3);
        ledger.book_subsidy(Usd::from_i64(3), 0.3);
        assert_eq!(ledger.profit_usdc.fmt_2dp(), "2.00");
        assert_eq!(ledger.liquidity_balance_usdc.fmt_2dp(), "10005.00");
        // reserve tracks the live balance
        assert_eq!(ledger.reserve_usdc.fmt_2dp(), "3001.50");
    }

    #[test]
    fn test_perp_margin_not_spend() {
        let mut ledger = LiquidityLedger::new(Usd::from_i64(1_000));
        ledger.book_perp_margin(Usd::from_i64(100), 0.0);
        assert_eq!(ledger.hedge_spend_usdc.fmt_2dp(), "0.00");
        assert_eq!(ledger.hedge_margin_usdc.fmt_2dp(), "100.00");
        assert_eq!(ledger.liquidity_balance_usdc.fmt_2dp(), "900.00");
        assert_eq!(ledger.profit_usdc.fmt_2dp(), "0.00");
    }

    #[test]
    fn test_hedge_budget_remaining() {
        let mut ledger = LiquidityLedger::new(Usd::from_i64(1_000));
        let mut controls = RiskControls::default();
        controls.reserve_pct = 0.3;
        controls.risk_budget_pct_max = 0.5;
        ledger.recognize_fee(Usd::from_i64(200), controls.reserve_pct);
        // liquidity 1200, reserve 360 -> 840; revenue budget 100 - 0 = 100
        assert_eq!(ledger.hedge_budget_remaining(&controls).fmt_2dp(), "840.00");

        ledger.book_option_spend(Usd::from_i64(1_150), controls.reserve_pct);
        // liquidity 50, reserve 15 -> 35; revenue budget 100-1150 < 0
        assert_eq!(ledger.hedge_budget_remaining(&controls).fmt_2dp(), "35.00");
    }

    #[test]
    fn test_subsidy_allowance_min_of_caps() {
        let mut controls = RiskControls::default();
        controls
            .subsidy_daily_cap_usdc_by_tier
            .insert("Gold".to_string(), 100.0);
        controls.subsidy_daily_cap_usdc_per_account = 60.0;
        let mut book = SubsidyBook::new();
        assert_eq!(
            book.allowance(&controls, "Gold", "acct-1").fmt_2dp(),
            "60.00"
        );
        book.record("Gold", "acct-1", Usd::from_i64(50));
        assert_eq!(
            book.allowance(&controls, "Gold", "acct-1").fmt_2dp(),
            "10.00"
        );
        // A different account still has tier headroom 100-50=50, account 60.
        assert_eq!(
            book.allowance(&controls, "Gold", "acct-2").fmt_2dp(),
            "50.00"
        );
    }
}
