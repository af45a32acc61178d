//! Net-exposure planner.
//!
//! Per tick: net the signed notionals of all live coverages per asset,
//! attenuate the hedge factor (risk-budget overage, cap breach, high IV,
//! unfavourable funding), then buy protection through a wall-clock-bounded
//! option ladder, falling back to a perpetual when the ladder is dry.
//! Every executed or rejected leg is reported back so the engine can audit
//! it under the platform-risk coverage id.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RiskControls;
use crate::models::{Asset, Coverage, HedgeType, OptionType, OrderSide};
use crate::money::Usd;
use crate::pricing::{aggregate, fetch_books, passes_gates, GateThresholds, QuoteDiag};
use crate::venues::instrument::{format_option, format_perp};
use crate::venues::{InstrumentKind, OrderRequest, OrderType, VenueRegistry};

pub const PLATFORM_COVERAGE_ID: &str = "platform-risk";

/// Fraction of net exposure actually hedged at the platform level.
const EXPOSURE_FACTOR: f64 = 0.7;
/// Strike shortlist band around the target floor.
const STRIKE_BAND: (f64, f64) = (0.88, 1.12);
/// Candidate tenors for the platform ladder.
const LADDER_DAYS: [u32; 5] = [1, 2, 3, 5, 7];
/// Ranked candidates attempted before giving up on options.
const MAX_EXEC_ATTEMPTS: usize = 3;
const BOOK_TIMEOUT: Duration = Duration::from_secs(4);
const LIST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default platform floor when live coverages carry no usable drawdown.
const DEFAULT_FLOOR_PCT: f64 = 0.16;

#[derive(Debug, Clone)]
pub struct ExposurePlan {
    pub asset: Asset,
    /// Signed sum of coverage notionals.
    pub net_notional_usd: f64,
    pub option_type: OptionType,
    pub perp_side: OrderSide,
    pub floor_pct: f64,
    pub hedge_factor: f64,
    pub attenuators: Vec<&'static str>,
    pub target_units: f64,
}

#[derive(Debug, Clone)]
pub struct ExecutedLeg {
    pub instrument: String,
    pub venue: String,
    pub side: OrderSide,
    pub size: f64,
    pub price_usd: f64,
    pub premium_usd: Usd,
    pub hedge_type: HedgeType,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct RejectedLeg {
    pub instrument: String,
    pub venue: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct PlanOutcome {
    pub executed: Vec<ExecutedLeg>,
    pub rejected: Vec<RejectedLeg>,
    pub diag: QuoteDiag,
    pub ladder_exhausted: bool,
}

struct LadderCandidate {
    instrument: String,
    days: u32,
    strike: f64,
    fill_units: f64,
    premium_usd: f64,
    distance_pct: f64,
    spread_pct: f64,
    plan_legs: Vec<crate::models::ExecutionLeg>,
}

pub struct NetExposurePlanner {
    registry: VenueRegistry,
    controls: Arc<RiskControls>,
}

impl NetExposurePlanner {
    pub fn new(registry: VenueRegistry, controls: Arc<RiskControls>) -> Self {
        Self { registry, controls }
    }

    /// Net live coverages per asset into attenuated hedge plans.
    #[allow(clippy::too_many_arguments)]
    pub fn build_plans(
        &self,
        coverages: &[Coverage],
        now: DateTime<Utc>,
        spot_by_asset: &HashMap<Asset, f64>,
        iv: Option<f64>,
        spend_ratio: f64,
        funding_rate: Option<f64>,
        ample_buffer: bool,
    ) -> Vec<ExposurePlan> {
        let mut net_by_asset: HashMap<Asset, f64> = HashMap::new();
        let mut dd_weight: HashMap<Asset, (f64, f64)> = HashMap::new();
        let mut cap_by_asset: HashMap<Asset, f64> = HashMap::new();
        let mut tiers_seen: Vec<String> = Vec::new();

        for coverage in coverages.iter().filter(|c| c.is_live(now)) {
            for position in &coverage.positions {
                let notional = position.side.sign() * position.notional_usd().to_f64();
                *net_by_asset.entry(position.asset).or_default() += notional;
                let w = dd_weight.entry(position.asset).or_default();
                // notional-weighted drawdown from the hedge leg's tier
                if let Some(strike) = coverage.hedge.strike {
                    if let Some(spot) = spot_by_asset.get(&position.asset) {
                        let dd = (1.0 - strike / spot).abs();
                        w.0 += dd * notional.abs();
                        w.1 += notional.abs();
                    }
                }
                if !tiers_seen.contains(&coverage.tier_name) {
                    tiers_seen.push(coverage.tier_name.clone());
                    if let Some(cap) = self.controls.net_exposure_cap_usdc.get(&coverage.tier_name)
                    {
                        *cap_by_asset.entry(position.asset).or_default() += cap;
                    }
                }
            }
        }

        let mut plans = Vec::new();
        for (asset, net) in net_by_asset {
            if net.abs() < 1.0 {
                continue;
            }
            let Some(spot) = spot_by_asset.get(&asset).copied().filter(|s| *s > 0.0) else {
                continue;
            };

            let mut factors: Vec<(f64, &'static str)> = Vec::new();

            // Risk-budget overage: 0.8 at the min threshold easing to 0.5
            // at the max.
            let (bmin, bmax) = (
                self.controls.risk_budget_pct_min,
                self.controls.risk_budget_pct_max,
            );
            if spend_ratio >= bmin && bmax > bmin {
                let t = ((spend_ratio - bmin) / (bmax - bmin)).clamp(0.0, 1.0);
                factors.push((0.8 - 0.3 * t, "risk_budget_overage"));
            }

            let cap = cap_by_asset.get(&asset).copied().unwrap_or(f64::INFINITY);
            if net.abs() > cap {
                factors.push((self.controls.hedge_reduction_factor, "net_exposure_cap"));
            }

            if let Some(iv) = iv {
                if iv >= self.controls.volatility_throttle_iv {
                    factors.push((self.controls.hedge_reduction_factor, "high_iv"));
                }
            }

            // Funding tilt: paying funding on the hedge side while buffers
            // are healthy halves the hedge.
            if let Some(funding) = funding_rate {
                let unfavourable = match net > 0.0 {
                    true => funding < 0.0,  // short-perp hedge pays when negative
                    false => funding > 0.0, // long-perp hedge pays when positive
                };
                if unfavourable && ample_buffer {
                    factors.push((0.5, "unfavourable_funding"));
                }
            }

            let (hedge_factor, attenuators) = match factors
                .iter()
                .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            {
                Some((factor, _)) => (
                    *factor,
                    factors.iter().map(|(_, name)| *name).collect::<Vec<_>>(),
                ),
                None => (1.0, Vec::new()),
            };

            let floor_pct = dd_weight
                .get(&asset)
                .filter(|(_, weight)| *weight > 0.0)
                .map(|(acc, weight)| acc / weight)
                .filter(|dd| *dd > 0.0 && *dd < 1.0)
                .unwrap_or(DEFAULT_FLOOR_PCT);

            let target_units = net.abs() / spot * hedge_factor * EXPOSURE_FACTOR;
            plans.push(ExposurePlan {
                asset,
                net_notional_usd: net,
                option_type: if net > 0.0 {
                    OptionType::Put
                } else {
                    OptionType::Call
                },
                perp_side: if net > 0.0 {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                floor_pct,
                hedge_factor,
                attenuators,
                target_units,
            });
        }
        plans.sort_by(|a, b| {
            b.net_notional_usd
                .abs()
                .partial_cmp(&a.net_notional_usd.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        plans
    }

    /// Run the budget-bounded option ladder, then the perp fallback.
    pub async fn execute(&self, plan: &ExposurePlan, spot: f64, budget: Usd) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        if plan.target_units <= 0.0 || spot <= 0.0 {
            return outcome;
        }
        let budget_usd = budget.to_f64();
        if budget_usd <= 0.0 {
            outcome.diag.budget_too_small += 1;
            outcome.ladder_exhausted = true;
            self.perp_fallback(plan, spot, &mut outcome).await;
            return outcome;
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.controls.option_search_budget_ms.max(1));
        let candidates = self
            .ladder_candidates(plan, spot, budget_usd, deadline, &mut outcome.diag)
            .await;

        let mut attempted = 0usize;
        for candidate in candidates {
            if attempted >= MAX_EXEC_ATTEMPTS {
                break;
            }
            attempted += 1;
            match self.execute_candidate(&candidate, spot).await {
                Ok(mut legs) => {
                    outcome.executed.append(&mut legs);
                    return outcome;
                }
                Err((venue, reason)) => {
                    let retryable = reason.contains("paper_rejected");
                    outcome.rejected.push(RejectedLeg {
                        instrument: candidate.instrument.clone(),
                        venue,
                        reason: reason.clone(),
                    });
                    if !retryable {
                        warn!(reason = %reason, "ladder execution stopped on hard failure");
                        return outcome;
                    }
                    debug!(instrument = %candidate.instrument, reason = %reason, "ladder leg rejected; trying next");
                }
            }
        }

        outcome.ladder_exhausted = true;
        self.perp_fallback(plan, spot, &mut outcome).await;
        outcome
    }

    async fn ladder_candidates(
        &self,
        plan: &ExposurePlan,
        spot: f64,
        budget_usd: f64,
        deadline: Instant,
        diag: &mut QuoteDiag,
    ) -> Vec<LadderCandidate> {
        let mut candidates = Vec::new();
        let strikes_by_expiry = self.listed_strikes(plan.asset, plan.option_type).await;
        if strikes_by_expiry.is_empty() {
            diag.missing_book += 1;
            return candidates;
        }

        let floor_price = match plan.option_type {
            OptionType::Put => spot * (1.0 - plan.floor_pct),
            OptionType::Call => spot * (1.0 + plan.floor_pct),
        };
        let now = Utc::now();

        'days: for day in LADDER_DAYS {
            if Instant::now() >= deadline {
                diag.time_budget_hit += 1;
                break;
            }
            let target = now + chrono::Duration::days(day as i64);
            let Some((expiry, strikes)) = strikes_by_expiry
                .iter()
                .min_by_key(|(e, _)| (**e - target).num_seconds().abs())
            else {
                continue;
            };
            let gates = GateThresholds {
                max_spread_pct: self.controls.max_spread_pct_for(day),
                max_slippage_pct: self.controls.max_slippage_pct_for(day),
            };
            for strike in strikes
                .iter()
                .filter(|s| **s >= STRIKE_BAND.0 * floor_price && **s <= STRIKE_BAND.1 * floor_price)
            {
                if Instant::now() >= deadline {
                    diag.time_budget_hit += 1;
                    break 'days;
                }
                let instrument = format_option(plan.asset, *expiry, *strike, plan.option_type);
                let books = fetch_books(
                    &self.registry,
                    &instrument,
                    spot,
                    true,
                    BOOK_TIMEOUT,
                    diag,
                )
                .await;
                let Some(agg) = aggregate(
                    &instrument,
                    &books,
                    OrderSide::Buy,
                    plan.target_units,
                    self.controls.max_quote_venues,
                ) else {
                    if !books.is_empty() {
                        diag.no_bid_ask += 1;
                    }
                    continue;
                };
                if !passes_gates(&agg, OrderSide::Buy, plan.target_units, gates, diag) {
                    continue;
                }
                if agg.avg_price <= 0.0 {
                    continue;
                }
                let affordable = budget_usd / agg.avg_price;
                let fill_units = agg.depth.min(plan.target_units).min(affordable);
                if fill_units < self.controls.min_option_size {
                    diag.budget_too_small += 1;
                    continue;
                }
                let scale = fill_units / agg.filled_size.max(f64::EPSILON);
                let plan_legs = agg
                    .plan
                    .iter()
                    .map(|leg| {
                        let mut leg = leg.clone();
                        leg.size = (leg.size * scale).min(leg.size);
                        leg
                    })
                    .filter(|leg| leg.size > 0.0)
                    .collect();
                candidates.push(LadderCandidate {
                    instrument,
                    days: day,
                    strike: *strike,
                    fill_units,
                    premium_usd: agg.avg_price * fill_units,
                    distance_pct: (strike - floor_price).abs() / floor_price,
                    spread_pct: agg.spread_pct,
                    plan_legs,
                });
            }
        }

        candidates.sort_by(|a, b| {
            a.premium_usd
                .partial_cmp(&b.premium_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    a.distance_pct
                        .partial_cmp(&b.distance_pct)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(
                    a.spread_pct
                        .partial_cmp(&b.spread_pct)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        candidates
    }

    async fn execute_candidate(
        &self,
        candidate: &LadderCandidate,
        spot: f64,
    ) -> Result<Vec<ExecutedLeg>, (String, String)> {
        info!(
            instrument = %candidate.instrument,
            days = candidate.days,
            strike = candidate.strike,
            units = candidate.fill_units,
            "executing ladder candidate"
        );
        let mut executed = Vec::new();
        for leg in &candidate.plan_legs {
            let req = OrderRequest {
                instrument: leg.instrument.clone(),
                side: leg.side,
                amount: leg.size,
                order_type: OrderType::Market,
                price: None,
            };
            match self.registry.place_order(&leg.venue, &req).await {
                Ok(ack) => {
                    // Option fills come back in base units; book USD.
                    let price_usd = ack.avg_price * spot;
                    let premium =
                        Usd::from_f64(price_usd * ack.filled_size).unwrap_or(Usd::ZERO);
                    executed.push(ExecutedLeg {
                        instrument: leg.instrument.clone(),
                        venue: ack.venue,
                        side: leg.side,
                        size: ack.filled_size,
                        price_usd,
                        premium_usd: premium,
                        hedge_type: HedgeType::Option,
                        order_id: ack.order_id,
                    });
                }
                Err(e) => {
                    return Err((leg.venue.clone(), e.to_string()));
                }
            }
        }
        Ok(executed)
    }

    async fn perp_fallback(&self, plan: &ExposurePlan, spot: f64, outcome: &mut PlanOutcome) {
        let instrument = format_perp(plan.asset);
        let mut diag = QuoteDiag::default();
        let books = fetch_books(&self.registry, &instrument, spot, false, BOOK_TIMEOUT, &mut diag)
            .await;
        outcome.diag.merge(&diag);
        let Some(agg) = aggregate(
            &instrument,
            &books,
            plan.perp_side,
            plan.target_units,
            self.controls.max_quote_venues,
        ) else {
            outcome.diag.no_bid_ask += 1;
            return;
        };
        for leg in &agg.plan {
            let req = OrderRequest {
                instrument: leg.instrument.clone(),
                side: leg.side,
                amount: leg.size,
                order_type: OrderType::Market,
                price: None,
            };
            match self.registry.place_order(&leg.venue, &req).await {
                Ok(ack) => {
                    outcome.executed.push(ExecutedLeg {
                        instrument: instrument.clone(),
                        venue: ack.venue,
                        side: leg.side,
                        size: ack.filled_size,
                        price_usd: ack.avg_price,
                        premium_usd: Usd::ZERO,
                        hedge_type: HedgeType::Perp,
                        order_id: ack.order_id,
                    });
                }
                Err(e) => {
                    outcome.rejected.push(RejectedLeg {
                        instrument: instrument.clone(),
                        venue: leg.venue.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn listed_strikes(
        &self,
        asset: Asset,
        option_type: OptionType,
    ) -> HashMap<DateTime<Utc>, Vec<f64>> {
        let now = Utc::now();
        let mut by_expiry: HashMap<DateTime<Utc>, Vec<f64>> = HashMap::new();
        for name in self.registry.names() {
            let Some(connector) = self.registry.get(&name) else {
                continue;
            };
            let listed =
                match tokio::time::timeout(LIST_TIMEOUT, connector.list_instruments(asset)).await {
                    Ok(Ok(listed)) => listed,
                    _ => continue,
                };
            for info in listed {
                if info.kind != InstrumentKind::Option || info.option_type != Some(option_type) {
                    continue;
                }
                let (Some(expiry), Some(strike)) = (info.expiry, info.strike) else {
                    continue;
                };
                if expiry <= now {
                    continue;
                }
                let strikes = by_expiry.entry(expiry).or_default();
                if !strikes.iter().any(|s| (*s - strike).abs() < 1e-9) {
                    strikes.push(strike);
                }
            }
        }
        by_expiry
    }
}
