//! Core domain model for the drawdown-protection control plane.
//!
//! Coverages, tiers, quotes and hedge decisions are plain data; all state
//! machines that act on them live in `quote`, `hedging` and `engine`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Usd;

/// Supported underlying assets. The engine is asset-generic but the
/// production instantiation is BTC-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
        }
    }

    pub fn parse(s: &str) -> Option<Asset> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Some(Asset::Btc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// Sign applied to notionals when netting exposure.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Put,
    Call,
}

impl OptionType {
    pub fn code(&self) -> char {
        match self {
            OptionType::Put => 'P',
            OptionType::Call => 'C',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HedgeType {
    Option,
    Perp,
}

/// A user perpetual position the product protects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub asset: Asset,
    pub side: Side,
    pub margin_usd: Usd,
    pub leverage: f64,
    pub entry_price: f64,
}

impl Position {
    /// notional = margin x leverage
    pub fn notional_usd(&self) -> Usd {
        self.margin_usd
            .mul_ratio(self.leverage)
            .unwrap_or(Usd::ZERO)
    }

    /// size = notional / entryPrice, in base-asset units.
    pub fn size(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.notional_usd().to_f64() / self.entry_price
    }
}

/// A funded level: fixes the drawdown floor and the base protection fee.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub name: String,
    pub deposit: Usd,
    pub funding: Usd,
    pub profit_target: Usd,
    pub drawdown_limit_pct: f64,
    pub fixed_price_usdc: Usd,
    #[serde(default)]
    pub expiry_days: Option<u32>,
    #[serde(default)]
    pub renew_window_minutes: Option<i64>,
    #[serde(default)]
    pub buffer_alert_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageHedge {
    pub instrument: String,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub option_type: Option<OptionType>,
    pub hedge_size: f64,
    pub venue: String,
    pub hedge_type: HedgeType,
}

/// A protection contract instance, live until `expiry_iso`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    pub coverage_id: String,
    pub tier_name: String,
    pub expiry_iso: DateTime<Utc>,
    pub positions: Vec<Position>,
    pub hedge: CoverageHedge,
    pub fee_usd: Usd,
    pub premium_usd: Usd,
    pub subsidy_usd: Usd,
    pub notional_usdc: Usd,
    pub reason: String,
    /// Set when revenue was booked at activation; guards double recognition.
    #[serde(default)]
    pub fee_recognized: bool,
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl Coverage {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry_iso
    }

    /// Signed notional for platform-level netting.
    pub fn signed_notional(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| p.side.sign() * p.notional_usd().to_f64())
            .sum()
    }
}

/// Canonical coverage key: `tier:YYYY-MM-DD:positionId`.
pub fn coverage_key(tier_name: &str, expiry: DateTime<Utc>, position_id: &str) -> String {
    format!("{}:{}:{}", tier_name, expiry.format("%Y-%m-%d"), position_id)
}

/// Implied-vol reading normalized across feeds; Deribit reports percent-ish
/// values, the ladder reports fractions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IvSnapshot {
    pub raw: f64,
    pub scaled: f64,
}

impl IvSnapshot {
    pub fn from_raw(raw: f64) -> Self {
        let scaled = if raw > 1.5 { raw / 100.0 } else { raw };
        IvSnapshot { raw, scaled }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeRegime {
    Low,
    Normal,
    High,
}

impl FeeRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeRegime::Low => "low",
            FeeRegime::Normal => "normal",
            FeeRegime::High => "high",
        }
    }
}

/// One leg of a split execution across venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLeg {
    pub venue: String,
    pub instrument: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: f64,
}

/// Outcome of the floor-credit survival check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurvivalCheck {
    pub pass: bool,
    pub coverage_ratio: f64,
    pub required_credit: Usd,
    pub hedge_credit: Usd,
    pub floor: f64,
}

/// What the expiry/strike search saw when it picked the winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSnapshot {
    pub spot: f64,
    pub expiry_tag: String,
    pub picked_days: u32,
    pub target_days: u32,
    pub strikes_scanned: u32,
    pub venues: Vec<String>,
}

/// Terminal state of the quote machine. A closed set; wire form is the
/// snake_case tag plus flattened payload fields.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteStatus {
    Ok,
    Subsidized,
    CoverageOverride { cap_breached: bool },
    PassThrough,
    PassThroughCapped,
    PremiumFloor,
    Partial { coverage_pct: f64, discounted_fee: Usd },
    PerpFallback,
    NoQuote,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Ok => "ok",
            QuoteStatus::Subsidized => "subsidized",
            QuoteStatus::CoverageOverride { .. } => "coverage_override",
            QuoteStatus::PassThrough => "pass_through",
            QuoteStatus::PassThroughCapped => "pass_through_capped",
            QuoteStatus::PremiumFloor => "premium_floor",
            QuoteStatus::Partial { .. } => "partial",
            QuoteStatus::PerpFallback => "perp_fallback",
            QuoteStatus::NoQuote => "no_quote",
        }
    }

    /// Terminal statuses carry no executable hedge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QuoteStatus::PremiumFloor | QuoteStatus::PerpFallback | QuoteStatus::NoQuote
        )
    }
}

/// A fully resolved protection quote.
#[derive(Debug, Clone)]
pub struct Quote {
    pub quote_id: String,
    pub expires_at: DateTime<Utc>,
    pub instrument: String,
    pub strike: Option<f64>,
    pub option_type: Option<OptionType>,
    pub premium_per_unit_usdc: Usd,
    pub premium_total_usdc: Usd,
    pub hedge_size: f64,
    pub roll_multiplier: u32,
    pub all_in_premium_usdc: Usd,
    pub fee_usdc: Usd,
    pub fee_regime: Option<FeeRegime>,
    pub subsidy_usdc: Usd,
    pub status: QuoteStatus,
    pub reason: String,
    pub execution_plan: Vec<ExecutionLeg>,
    pub survival_check: Option<SurvivalCheck>,
    pub selection_snapshot: Option<SelectionSnapshot>,
}

/// Buffer-band hedge decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HedgeAction {
    Increase,
    Decrease,
    Hold,
}

impl HedgeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HedgeAction::Increase => "increase",
            HedgeAction::Decrease => "decrease",
            HedgeAction::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HedgeDecision {
    pub action: HedgeAction,
    pub reason: &'static str,
    pub renew: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_position_notional_and_size() {
        let p = Position {
            id: "pos-1".into(),
            asset: Asset::Btc,
            side: Side::Long,
            margin_usd: Usd::from_i64(2_500),
            leverage: 2.0,
            entry_price: 50_000.0,
        };
        assert_eq!(p.notional_usd().fmt_2dp(), "5000.00");
        assert!((p.size() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_coverage_key_format() {
        let expiry = Utc.with_ymd_and_hms(2026, 8, 7, 8, 0, 0).unwrap();
        assert_eq!(
            coverage_key("Pro (Bronze)", expiry, "pos-1"),
            "Pro (Bronze):2026-08-07:pos-1"
        );
    }

    #[test]
    fn test_iv_snapshot_scaling() {
        // Percent-ish feeds get divided down, fractional feeds pass through.
        assert!((IvSnapshot::from_raw(55.0).scaled - 0.55).abs() < 1e-12);
        assert!((IvSnapshot::from_raw(0.55).scaled - 0.55).abs() < 1e-12);
        assert!((IvSnapshot::from_raw(1.4).scaled - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_quote_status_tags() {
        assert_eq!(QuoteStatus::PassThroughCapped.as_str(), "pass_through_capped");
        assert!(QuoteStatus::NoQuote.is_terminal());
        assert!(!QuoteStatus::Subsidized.is_terminal());
    }

    #[test]
    fn test_signed_notional_nets_sides() {
        let mk = |side: Side| Position {
            id: "p".into(),
            asset: Asset::Btc,
            side,
            margin_usd: Usd::from_i64(1_000),
            leverage: 3.0,
            entry_price: 50_000.0,
        };
        let cov = Coverage {
            coverage_id: "c".into(),
            tier_name: "t".into(),
            expiry_iso: Utc::now(),
            positions: vec![mk(Side::Long), mk(Side::Short)],
            hedge: CoverageHedge {
                instrument: "BTC-PERPETUAL".into(),
                strike: None,
                option_type: None,
                hedge_size: 0.0,
                venue: "deribit".into(),
                hedge_type: HedgeType::Perp,
            },
            fee_usd: Usd::ZERO,
            premium_usd: Usd::ZERO,
            subsidy_usd: Usd::ZERO,
            notional_usdc: Usd::ZERO,
            reason: String::new(),
            fee_recognized: false,
            renewed_at: None,
        };
        assert!(cov.signed_notional().abs() < 1e-9);
    }
}
