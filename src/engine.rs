//! Coverage engine.
//!
//! The one effectful value in the process: quote cache, active coverage
//! map, hedge lots, liquidity ledger and audit trail, mutated only from
//! request handlers and the loop ticker. Everything below it (quote
//! machine, planner, caches) is stateless or internally synchronized.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, LiquidityLedger, SubsidyBook};
use crate::config::{AccountConfig, AccountsLoader, AppConfig, RiskControls};
use crate::error::{EngineError, EngineResult};
use crate::hedging::net_exposure::{NetExposurePlanner, PLATFORM_COVERAGE_ID};
use crate::hedging::rolling;
use crate::hedging::HedgeLotBook;
use crate::marketdata::{AtmIvCache, PutLadderCache};
use crate::models::{
    coverage_key, Asset, Coverage, CoverageHedge, HedgeType, OrderSide, Position, Quote,
    QuoteStatus, Side, Tier,
};
use crate::money::Usd;
use crate::quote::{CacheLookup, MarketView, QuoteCache, QuoteMachine, QuoteParams};
use crate::venues::instrument::parse_instrument;
use crate::venues::{OrderRequest, OrderType, VenueRegistry};

const SPOT_TIMEOUT: Duration = Duration::from_secs(3);
/// Synchronous quote computation must answer inside this.
const QUOTE_COMPUTE_TIMEOUT: Duration = Duration::from_secs(6);
/// Background preview refreshes get a little longer before they are cut.
const PREVIEW_WATCHDOG: Duration = Duration::from_secs(8);

/// Venue option fills are priced in base-asset units; everything the ledger
/// and lots see must be USD.
fn fill_price_usd(instrument: &str, raw_price: f64, spot: f64) -> f64 {
    match parse_instrument(instrument) {
        Some(crate::venues::instrument::ParsedInstrument::Option { .. }) => raw_price * spot,
        _ => raw_price,
    }
}
/// Activation refuses quotes whose selection spot drifted further than this.
const MAX_ACTIVATION_DRIFT_PCT: f64 = 0.02;
/// Quotes kept addressable by id for activation.
const RECENT_QUOTE_CAP: usize = 256;
const SNAPSHOT_PREFIX: &str = "audit-";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutQuoteRequest {
    pub tier_name: String,
    pub asset: String,
    pub side: Side,
    pub position_id: String,
    pub margin_usd: Usd,
    pub leverage: f64,
    pub entry_price: f64,
    #[serde(default)]
    pub spot: Option<f64>,
    #[serde(default)]
    pub target_days: Option<u32>,
    #[serde(default)]
    pub allow_premium_pass_through: Option<bool>,
    #[serde(default)]
    pub expiry_tag: Option<String>,
    #[serde(default)]
    pub position_delta: Option<f64>,
    #[serde(default)]
    pub option_delta: Option<f64>,
    #[serde(default)]
    pub contract_size: Option<f64>,
}

#[derive(Debug)]
pub enum PreviewResult {
    Fresh(Arc<Quote>),
    Stale(Arc<Quote>),
    Pending,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub quote_id: String,
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResult {
    pub status: &'static str,
    pub coverage_id: String,
    pub fee_usdc: Usd,
    pub premium_usdc: Usd,
    pub subsidy_usdc: Usd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioIngest {
    pub account_id: String,
    #[serde(default)]
    pub cash_usdc: Option<Usd>,
    #[serde(default)]
    pub position_pnl_usdc: Option<Usd>,
    #[serde(default)]
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub account_id: String,
    pub cash_usdc: Usd,
    pub position_pnl_usdc: Usd,
    pub positions: Vec<Position>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MtmSnapshot {
    pub unrealized_usdc: Usd,
    pub realized_usdc: Usd,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummary {
    pub equity_usdc: Usd,
    pub drawdown_floor_usdc: Usd,
    pub buffer_usdc: Usd,
    pub buffer_pct: f64,
    pub hedge_mtm_usdc: Usd,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub account_id: String,
    pub buffer_pct: f64,
    pub hedge_action: &'static str,
    pub reason: &'static str,
    pub renew: bool,
    pub renewed: bool,
}

struct QuoteRecord {
    quote: Arc<Quote>,
    params: QuoteParams,
}

pub struct CoverageEngine {
    pub app: AppConfig,
    pub controls: Arc<RiskControls>,
    pub tiers: HashMap<String, Tier>,
    pub registry: VenueRegistry,
    pub audit: Arc<AuditLog>,
    pub ladder: Arc<PutLadderCache>,
    pub atm_iv: Arc<AtmIvCache>,
    pub accounts: AccountsLoader,
    machine: QuoteMachine,
    planner: NetExposurePlanner,
    quote_cache: Arc<QuoteCache>,
    coverages: RwLock<HashMap<String, Coverage>>,
    expired_emitted: Mutex<HashSet<String>>,
    lots: Mutex<HedgeLotBook>,
    ledger: Mutex<LiquidityLedger>,
    subsidies: Mutex<SubsidyBook>,
    portfolios: RwLock<HashMap<String, PortfolioSnapshot>>,
    mtm: RwLock<Option<MtmSnapshot>>,
    last_spot: RwLock<HashMap<Asset, f64>>,
    recent_quotes: Mutex<HashMap<String, QuoteRecord>>,
    quote_order: Mutex<Vec<String>>,
    renewed_keys: Mutex<HashSet<String>>,
    http: reqwest::Client,
}

impl CoverageEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app: AppConfig,
        tiers: HashMap<String, Tier>,
        controls: Arc<RiskControls>,
        registry: VenueRegistry,
        audit: Arc<AuditLog>,
        ladder: Arc<PutLadderCache>,
        atm_iv: Arc<AtmIvCache>,
        accounts: AccountsLoader,
    ) -> Arc<Self> {
        let machine = QuoteMachine::new(registry.clone(), controls.clone());
        let planner = NetExposurePlanner::new(registry.clone(), controls.clone());
        let quote_cache = QuoteCache::new(
            app.quote_cache_ttl_ms,
            app.quote_cache_stale_ms,
            app.quote_cache_hard_ms,
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            app,
            controls,
            tiers,
            registry,
            audit,
            ladder,
            atm_iv,
            accounts,
            machine,
            planner,
            quote_cache,
            coverages: RwLock::new(HashMap::new()),
            expired_emitted: Mutex::new(HashSet::new()),
            lots: Mutex::new(HedgeLotBook::new()),
            ledger: Mutex::new(LiquidityLedger::default()),
            subsidies: Mutex::new(SubsidyBook::new()),
            portfolios: RwLock::new(HashMap::new()),
            mtm: RwLock::new(None),
            last_spot: RwLock::new(HashMap::new()),
            recent_quotes: Mutex::new(HashMap::new()),
            quote_order: Mutex::new(Vec::new()),
            renewed_keys: Mutex::new(HashSet::new()),
            http,
        })
    }

    pub async fn seed_audit(&self) {
        if let Some(seed) = &self.app.audit_seed {
            self.audit
                .append(AuditEvent::AuditSeed, json!({ "seed": seed }))
                .await;
        }
    }

    // ---- market helpers ----

    async fn spot(&self, asset: Asset) -> Option<f64> {
        for name in self.registry.names() {
            let Some(connector) = self.registry.get(&name) else {
                continue;
            };
            match tokio::time::timeout(SPOT_TIMEOUT, connector.get_index_price(asset)).await {
                Ok(Ok(spot)) if spot > 0.0 => {
                    self.last_spot.write().insert(asset, spot);
                    return Some(spot);
                }
                _ => continue,
            }
        }
        // Reuse the last known spot when every venue is failing.
        self.last_spot.read().get(&asset).copied()
    }

    async fn market_view(&self, asset: Asset, spot: f64, tier: &str, account: &str) -> MarketView {
        let ladder = self.ladder.snapshot();
        let atm_iv = if ladder.is_none() {
            Some(self.atm_iv.get(asset, spot).await)
        } else {
            None
        };
        // No subsidy above the IV cutoff.
        let iv = ladder
            .as_ref()
            .map(|l| l.hedge_iv)
            .or(atm_iv.map(|s| s.scaled));
        let allowance = if iv.map(|v| v > self.controls.subsidy_iv_cutoff).unwrap_or(false) {
            Usd::ZERO
        } else {
            self.subsidies.lock().allowance(&self.controls, tier, account)
        };
        MarketView {
            ladder,
            atm_iv,
            subsidy_allowance: allowance,
        }
    }

    fn build_params(
        &self,
        req: &PutQuoteRequest,
        asset: Asset,
        tier: Tier,
        spot: f64,
    ) -> EngineResult<QuoteParams> {
        if req.entry_price <= 0.0 || !req.margin_usd.is_positive() {
            return Err(EngineError::InvalidPayload(
                "marginUsd and entryPrice must be positive".into(),
            ));
        }
        let notional = req
            .margin_usd
            .mul_ratio(req.leverage)
            .ok_or_else(|| EngineError::InvalidPayload("non-finite leverage".into()))?;
        let position_size = notional.to_f64() / req.entry_price;
        let target_days = req
            .target_days
            .or(tier.expiry_days)
            .unwrap_or(self.controls.default_target_days)
            .clamp(1, self.controls.fallback_target_days.max(1));
        let expiry_guess = Utc::now() + ChronoDuration::days(target_days as i64);
        Ok(QuoteParams {
            coverage_id: coverage_key(&tier.name, expiry_guess, &req.position_id),
            drawdown_floor_pct: tier.drawdown_limit_pct,
            tier,
            asset,
            side: req.side,
            spot,
            position_size,
            position_delta: req.position_delta,
            option_delta: req.option_delta,
            contract_size: req.contract_size.unwrap_or(1.0),
            leverage: req.leverage,
            target_days,
            allow_premium_pass_through: req.allow_premium_pass_through.unwrap_or(false),
            pinned_expiry_tag: req.expiry_tag.clone(),
        })
    }

    /// Cache key: JSON of the normalized inputs.
    fn cache_key(params: &QuoteParams) -> String {
        json!({
            "tier": params.tier.name,
            "asset": params.asset.as_str(),
            "side": params.side.as_str(),
            "spot": format!("{:.2}", params.spot),
            "dd": format!("{:.4}", params.drawdown_floor_pct),
            "size": format!("{:.4}", params.position_size),
            "leverage": format!("{:.2}", params.leverage),
            "days": params.target_days,
            "passThrough": params.allow_premium_pass_through,
            "tag": params.pinned_expiry_tag,
        })
        .to_string()
    }

    fn resolve_tier(&self, name: &str) -> EngineResult<Tier> {
        self.tiers
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::InvalidPayload(format!("unknown tier {name}")))
    }

    fn resolve_asset(name: &str) -> EngineResult<Asset> {
        Asset::parse(name).ok_or_else(|| EngineError::UnsupportedAsset(name.to_string()))
    }

    async fn prepare(&self, req: &PutQuoteRequest) -> EngineResult<(QuoteParams, String)> {
        let asset = Self::resolve_asset(&req.asset)?;
        let tier = self.resolve_tier(&req.tier_name)?;
        let spot = match req.spot.filter(|s| *s > 0.0) {
            Some(spot) => spot,
            None => self
                .spot(asset)
                .await
                .ok_or_else(|| EngineError::RequestFailed("index price unavailable".into()))?,
        };
        let params = self.build_params(req, asset, tier, spot)?;
        let key = Self::cache_key(&params);
        Ok((params, key))
    }

    fn remember_quote(&self, quote: Arc<Quote>, params: QuoteParams) {
        let mut order = self.quote_order.lock();
        let mut recent = self.recent_quotes.lock();
        order.push(quote.quote_id.clone());
        recent.insert(quote.quote_id.clone(), QuoteRecord { quote, params });
        while order.len() > RECENT_QUOTE_CAP {
            let oldest = order.remove(0);
            recent.remove(&oldest);
        }
    }

    async fn compute_quote(self: &Arc<Self>, params: QuoteParams, key: &str) -> EngineResult<Arc<Quote>> {
        let engine = self.clone();
        let params_for_compute = params.clone();
        let quote = self
            .quote_cache
            .compute_single_flight(key, move || async move {
                let account = params_for_compute.coverage_id.clone();
                let market = engine
                    .market_view(
                        params_for_compute.asset,
                        params_for_compute.spot,
                        &params_for_compute.tier.name,
                        &account,
                    )
                    .await;
                let outcome = engine.machine.quote(&params_for_compute, &market).await?;
                let event = match outcome.quote.status {
                    QuoteStatus::PerpFallback | QuoteStatus::NoQuote => AuditEvent::PutQuoteFailed,
                    _ => AuditEvent::PutQuote,
                };
                engine
                    .audit
                    .append(
                        event,
                        json!({
                            "coverageId": params_for_compute.coverage_id,
                            "quoteId": outcome.quote.quote_id,
                            "status": outcome.quote.status.as_str(),
                            "reason": outcome.quote.reason,
                            "feeUsdc": outcome.quote.fee_usdc,
                            "allInPremiumUsdc": outcome.quote.all_in_premium_usdc,
                            "diag": outcome.diag,
                        }),
                    )
                    .await;
                Ok(outcome.quote)
            })
            .await?;
        self.remember_quote(quote.clone(), params);
        Ok(quote)
    }

    // ---- quote surface ----

    /// `/put/preview`: fresh -> serve; stale -> serve and refresh in the
    /// background; cold -> pending with one compute in flight.
    pub async fn preview(self: &Arc<Self>, req: &PutQuoteRequest) -> EngineResult<PreviewResult> {
        let (params, key) = self.prepare(req).await?;
        match self.quote_cache.lookup(&key) {
            CacheLookup::Fresh(quote) => Ok(PreviewResult::Fresh(quote)),
            CacheLookup::Stale(quote) => {
                if !self.quote_cache.is_inflight(&key) {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(
                            PREVIEW_WATCHDOG,
                            engine.compute_quote(params, &key),
                        )
                        .await;
                    });
                }
                Ok(PreviewResult::Stale(quote))
            }
            CacheLookup::Miss => {
                if !self.quote_cache.is_inflight(&key) {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(
                            PREVIEW_WATCHDOG,
                            engine.compute_quote(params, &key),
                        )
                        .await;
                    });
                }
                Ok(PreviewResult::Pending)
            }
        }
    }

    /// `/put/quote`: fresh -> serve; anything else computes synchronously
    /// under the call-level timeout.
    pub async fn quote(self: &Arc<Self>, req: &PutQuoteRequest) -> EngineResult<Arc<Quote>> {
        let (params, key) = self.prepare(req).await?;
        if let CacheLookup::Fresh(quote) = self.quote_cache.lookup(&key) {
            return Ok(quote);
        }
        tokio::time::timeout(QUOTE_COMPUTE_TIMEOUT, self.compute_quote(params, &key))
            .await
            .map_err(|_| EngineError::Timeout("quote compute".into()))?
    }

    // ---- activation ----

    pub async fn activate(self: &Arc<Self>, req: &ActivateRequest) -> EngineResult<ActivateResult> {
        let record = {
            let recent = self.recent_quotes.lock();
            let Some(record) = recent.get(&req.quote_id) else {
                return Err(EngineError::QuoteUnknown(req.quote_id.clone()));
            };
            QuoteRecord {
                quote: record.quote.clone(),
                params: record.params.clone(),
            }
        };
        let quote = record.quote;
        let params = record.params;
        let now = Utc::now();

        if now > quote.expires_at {
            return Err(EngineError::QuoteExpired);
        }
        if quote.status.is_terminal() {
            return Err(EngineError::NoQuote(format!(
                "quote is not executable: {}",
                quote.status.as_str()
            )));
        }
        if let Some(spot) = self.spot(params.asset).await {
            let drift = (spot - params.spot).abs() / params.spot;
            if drift > MAX_ACTIVATION_DRIFT_PCT {
                return Err(EngineError::QuoteDrift);
            }
        }

        let parsed = parse_instrument(&quote.instrument);
        let expiry = parsed
            .and_then(|p| p.expiry())
            .unwrap_or(now + ChronoDuration::days(params.target_days as i64));
        let coverage_id = coverage_key(&params.tier.name, expiry, &quote.quote_id);
        let coverage_id = params
            .coverage_id
            .split(':')
            .nth(2)
            .map(|pos| coverage_key(&params.tier.name, expiry, pos))
            .unwrap_or(coverage_id);

        // Idempotency: a live duplicate returns without mutating state. The
        // coverage map guard must drop before the audit await.
        let duplicate = self
            .coverages
            .read()
            .get(&coverage_id)
            .filter(|c| c.is_live(now))
            .map(|c| (c.fee_usd, c.premium_usd, c.subsidy_usd));
        if let Some((fee_usdc, premium_usdc, subsidy_usdc)) = duplicate {
            self.audit
                .append(
                    AuditEvent::CoverageDuplicate,
                    json!({ "coverageId": coverage_id }),
                )
                .await;
            return Ok(ActivateResult {
                status: "duplicate",
                coverage_id,
                fee_usdc,
                premium_usdc,
                subsidy_usdc,
            });
        }

        self.audit
            .append(
                AuditEvent::HedgeAction,
                json!({
                    "coverageId": coverage_id,
                    "action": "open",
                    "instrument": quote.instrument,
                    "hedgeSize": quote.hedge_size,
                    "plan": quote.execution_plan,
                }),
            )
            .await;

        // Execute the split plan; live mode requires explicit approval.
        let can_execute = self.app.deribit_paper || self.app.foxify_approved;
        let mut premium_paid = Usd::ZERO;
        if can_execute {
            for leg in &quote.execution_plan {
                let order = OrderRequest {
                    instrument: leg.instrument.clone(),
                    side: leg.side,
                    amount: leg.size,
                    order_type: OrderType::Market,
                    price: None,
                };
                let ack = match self.registry.place_order(&leg.venue, &order).await {
                    Ok(ack) => ack,
                    Err(e) => {
                        self.audit
                            .append(
                                AuditEvent::OptionExecFailed,
                                json!({
                                    "coverageId": coverage_id,
                                    "venue": leg.venue,
                                    "instrument": leg.instrument,
                                    "reason": e.to_string(),
                                }),
                            )
                            .await;
                        return Err(e);
                    }
                };
                let price_usd = fill_price_usd(&leg.instrument, ack.avg_price, params.spot);
                let leg_premium =
                    Usd::from_f64(price_usd * ack.filled_size).unwrap_or(Usd::ZERO);
                premium_paid += leg_premium;
                let realized = self.lots.lock().apply_fill(
                    &leg.instrument,
                    leg.side,
                    ack.filled_size,
                    price_usd,
                );
                if !realized.is_zero() {
                    self.ledger
                        .lock()
                        .credit_realized(realized, self.controls.reserve_pct);
                    self.audit
                        .append(
                            AuditEvent::MtmCredit,
                            json!({ "instrument": leg.instrument, "realizedUsdc": realized }),
                        )
                        .await;
                }
                self.audit
                    .append(
                        AuditEvent::HedgeOrder,
                        json!({
                            "coverageId": coverage_id,
                            "orderId": ack.order_id,
                            "venue": ack.venue,
                            "instrument": leg.instrument,
                            "side": leg.side.as_str(),
                            "size": ack.filled_size,
                            "priceUsdc": price_usd,
                            "premiumUsdc": leg_premium,
                            "feeRecognized": true,
                            "hedgeType": "option",
                        }),
                    )
                    .await;
            }
        } else {
            debug!(coverage_id = %coverage_id, "live execution gated; booking quote premium");
            premium_paid = quote.all_in_premium_usdc;
        }

        // Ledger mutations precede the response.
        {
            let mut ledger = self.ledger.lock();
            ledger.recognize_fee(quote.fee_usdc, self.controls.reserve_pct);
            ledger.book_option_spend(premium_paid, self.controls.reserve_pct);
            if quote.subsidy_usdc.is_positive() {
                ledger.book_subsidy(quote.subsidy_usdc, self.controls.reserve_pct);
            }
        }
        if quote.subsidy_usdc.is_positive() {
            self.subsidies.lock().record(
                &params.tier.name,
                &coverage_id,
                quote.subsidy_usdc,
            );
        }
        let ledger_snapshot = self.ledger.lock().clone();
        self.audit
            .append(
                AuditEvent::LiquidityUpdate,
                json!({
                    "coverageId": coverage_id,
                    "ledger": ledger_snapshot,
                }),
            )
            .await;

        let notional = Usd::from_f64(params.position_size * params.spot).unwrap_or(Usd::ZERO);
        let coverage = Coverage {
            coverage_id: coverage_id.clone(),
            tier_name: params.tier.name.clone(),
            expiry_iso: expiry,
            positions: vec![Position {
                id: params
                    .coverage_id
                    .split(':')
                    .nth(2)
                    .unwrap_or("pos")
                    .to_string(),
                asset: params.asset,
                side: params.side,
                margin_usd: notional
                    .mul_ratio(1.0 / params.leverage.max(1.0))
                    .unwrap_or(Usd::ZERO),
                leverage: params.leverage,
                entry_price: params.spot,
            }],
            hedge: CoverageHedge {
                instrument: quote.instrument.clone(),
                strike: quote.strike,
                option_type: quote.option_type,
                hedge_size: quote.hedge_size,
                venue: quote
                    .execution_plan
                    .first()
                    .map(|l| l.venue.clone())
                    .unwrap_or_else(|| "deribit".to_string()),
                hedge_type: HedgeType::Option,
            },
            fee_usd: quote.fee_usdc,
            premium_usd: premium_paid,
            subsidy_usd: quote.subsidy_usdc,
            notional_usdc: notional,
            reason: quote.reason.clone(),
            fee_recognized: true,
            renewed_at: None,
        };
        self.coverages
            .write()
            .insert(coverage_id.clone(), coverage.clone());
        self.audit
            .append(
                AuditEvent::CoverageActivated,
                serde_json::to_value(&coverage).unwrap_or_else(|_| json!({})),
            )
            .await;

        info!(coverage_id = %coverage_id, fee = %quote.fee_usdc, "coverage activated");
        Ok(ActivateResult {
            status: "ok",
            coverage_id,
            fee_usdc: quote.fee_usdc,
            premium_usdc: premium_paid,
            subsidy_usdc: quote.subsidy_usdc,
        })
    }

    // ---- audit export (external activation ingest) ----

    pub async fn audit_export(&self, payload: serde_json::Value) -> EngineResult<serde_json::Value> {
        let coverage_id = payload
            .get("coverageId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::InvalidPayload("coverageId required".into()))?
            .to_string();
        let expiry = payload
            .get("expiryIso")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| EngineError::InvalidPayload("expiryIso required".into()))?;
        let now = Utc::now();

        let duplicate = self
            .coverages
            .read()
            .get(&coverage_id)
            .map(|c| c.is_live(now))
            .unwrap_or(false);
        if duplicate {
            self.audit
                .append(
                    AuditEvent::CoverageDuplicate,
                    json!({ "coverageId": coverage_id, "source": "audit_export" }),
                )
                .await;
            return Ok(json!({ "status": "duplicate", "coverageId": coverage_id }));
        }

        let fee = payload
            .get("feeUsd")
            .or(payload.get("feeUsdc"))
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .and_then(Usd::from_f64)
            .unwrap_or(Usd::ZERO);
        let coverage = Coverage {
            coverage_id: coverage_id.clone(),
            tier_name: payload
                .get("tierName")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            expiry_iso: expiry,
            positions: serde_json::from_value(
                payload.get("positions").cloned().unwrap_or(json!([])),
            )
            .unwrap_or_default(),
            hedge: serde_json::from_value(payload.get("hedge").cloned().unwrap_or(json!(null)))
                .unwrap_or(CoverageHedge {
                    instrument: String::new(),
                    strike: None,
                    option_type: None,
                    hedge_size: 0.0,
                    venue: "deribit".to_string(),
                    hedge_type: HedgeType::Option,
                }),
            fee_usd: fee,
            premium_usd: Usd::ZERO,
            subsidy_usd: Usd::ZERO,
            notional_usdc: Usd::ZERO,
            reason: "audit_export".to_string(),
            fee_recognized: true,
            renewed_at: None,
        };

        // Revenue recognition happens exactly once, here at activation.
        self.ledger
            .lock()
            .recognize_fee(fee, self.controls.reserve_pct);
        self.coverages
            .write()
            .insert(coverage_id.clone(), coverage.clone());
        self.audit
            .append(
                AuditEvent::CoverageActivated,
                serde_json::to_value(&coverage).unwrap_or_else(|_| json!({})),
            )
            .await;

        self.write_snapshot().await;
        Ok(json!({ "status": "ok", "coverageId": coverage_id }))
    }

    async fn write_snapshot(&self) {
        let path = self
            .audit
            .path()
            .with_file_name(format!("{}{}.json", SNAPSHOT_PREFIX, Utc::now().timestamp_millis()));
        let snapshot = json!({
            "coverages": self.coverages.read().values().cloned().collect::<Vec<_>>(),
            "ledger": self.ledger.lock().clone(),
        });
        if let Ok(body) = serde_json::to_vec_pretty(&snapshot) {
            if let Err(e) = tokio::fs::write(&path, body).await {
                warn!(error = %e, "audit snapshot write failed");
            }
        }
    }

    // ---- portfolio / risk ----

    pub async fn ingest_portfolio(&self, req: PortfolioIngest) -> serde_json::Value {
        let snapshot = PortfolioSnapshot {
            account_id: req.account_id.clone(),
            cash_usdc: req.cash_usdc.unwrap_or(Usd::ZERO),
            position_pnl_usdc: req.position_pnl_usdc.unwrap_or(Usd::ZERO),
            positions: req.positions,
            ts: Utc::now(),
        };
        let count = snapshot.positions.len();
        self.portfolios
            .write()
            .insert(req.account_id.clone(), snapshot);
        self.audit
            .append(
                AuditEvent::PortfolioIngest,
                json!({ "accountId": req.account_id, "positions": count }),
            )
            .await;
        json!({ "status": "ok", "positions": count })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn risk_summary(
        &self,
        cash: Option<Usd>,
        position_pnl: Option<Usd>,
        hedge_mtm: Option<Usd>,
        drawdown_limit: Option<Usd>,
        initial_balance: Option<Usd>,
        max_mtm_age_ms: Option<i64>,
    ) -> EngineResult<RiskSummary> {
        let (cash, drawdown_limit, initial_balance) = match (cash, drawdown_limit, initial_balance)
        {
            (Some(c), Some(d), Some(i)) => (c, d, i),
            _ => {
                return Err(EngineError::MissingDrawdownInputs(
                    "cashUsdc, drawdownLimitUsdc and initialBalanceUsdc are required".into(),
                ))
            }
        };
        let position_pnl = position_pnl.unwrap_or(Usd::ZERO);

        let hedge_mtm = match hedge_mtm {
            Some(v) => v,
            None => {
                let max_age = max_mtm_age_ms.unwrap_or(120_000);
                let cached = *self.mtm.read();
                let fresh = cached.filter(|m| {
                    (Utc::now() - m.ts).num_milliseconds() <= max_age
                });
                match fresh {
                    Some(m) => m.unrealized_usdc,
                    None => self.refresh_mtm().await.unrealized_usdc,
                }
            }
        };

        let equity = cash + position_pnl + hedge_mtm;
        let floor = initial_balance - drawdown_limit;
        let buffer = equity - floor;
        let buffer_pct = buffer.ratio_to(initial_balance).unwrap_or(0.0);
        let status = if !buffer.is_positive() {
            "critical"
        } else if buffer_pct < 0.05 {
            "warning"
        } else {
            "ok"
        };
        Ok(RiskSummary {
            equity_usdc: equity,
            drawdown_floor_usdc: floor,
            buffer_usdc: buffer,
            buffer_pct,
            hedge_mtm_usdc: hedge_mtm,
            status,
        })
    }

    pub async fn refresh_mtm(&self) -> MtmSnapshot {
        let open = self.lots.lock().open_lots();
        let mut marks: HashMap<String, f64> = HashMap::new();
        for (instrument, _) in &open {
            for name in self.registry.names() {
                let Some(connector) = self.registry.get(&name) else {
                    continue;
                };
                let ticker =
                    match tokio::time::timeout(SPOT_TIMEOUT, connector.get_ticker(instrument))
                        .await
                    {
                        Ok(Ok(t)) => t,
                        _ => continue,
                    };
                // Option marks come in base units; convert with index.
                let is_option = matches!(
                    parse_instrument(instrument),
                    Some(crate::venues::instrument::ParsedInstrument::Option { .. })
                );
                let mark = if is_option {
                    ticker.mark_price * ticker.index_price.unwrap_or(0.0)
                } else {
                    ticker.mark_price
                };
                if mark > 0.0 {
                    marks.insert(instrument.clone(), mark);
                    break;
                }
            }
        }
        let (unrealized, realized) = {
            let lots = self.lots.lock();
            (lots.unrealized(&marks), lots.realized_pnl())
        };
        let snapshot = MtmSnapshot {
            unrealized_usdc: unrealized,
            realized_usdc: realized,
            ts: Utc::now(),
        };
        *self.mtm.write() = Some(snapshot);
        snapshot
    }

    // ---- coverage queries ----

    pub fn active_coverages(&self, account_id: Option<&str>) -> Vec<Coverage> {
        let now = Utc::now();
        let mut out: Vec<Coverage> = self
            .coverages
            .read()
            .values()
            .filter(|c| c.is_live(now))
            .filter(|c| {
                account_id
                    .map(|account| c.positions.iter().any(|p| p.id == account) || c.coverage_id.contains(account))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.coverage_id.cmp(&b.coverage_id));
        out
    }

    pub fn coverage_report(&self, account_id: Option<&str>) -> serde_json::Value {
        let active = self.active_coverages(account_id);
        let ledger = self.ledger.lock().clone();
        let mtm = *self.mtm.read();
        json!({
            "activeCoverages": active.len(),
            "coverages": active,
            "ledger": ledger,
            "mtm": mtm,
        })
    }

    // ---- close guard ----

    pub async fn venue_order(
        &self,
        venue: &str,
        order: OrderRequest,
        intent: Option<&str>,
        drawdown_buffer: Option<Usd>,
    ) -> EngineResult<serde_json::Value> {
        if intent == Some("close") {
            let buffer = drawdown_buffer.ok_or_else(|| {
                EngineError::MissingDrawdownInputs("drawdownBufferUsdc required for close".into())
            })?;
            if buffer.is_positive() {
                self.audit
                    .append(
                        AuditEvent::CloseBlocked,
                        json!({
                            "instrument": order.instrument,
                            "bufferUsdc": buffer,
                            "reason": "drawdown_buffer_positive",
                        }),
                    )
                    .await;
                return Err(EngineError::DrawdownBufferPositive);
            }
        }
        let ack = self.registry.place_order(venue, &order).await?;
        let spot = parse_instrument(&order.instrument)
            .map(|p| p.asset())
            .and_then(|asset| self.last_spot.read().get(&asset).copied())
            .unwrap_or(1.0);
        let price_usd = fill_price_usd(&order.instrument, ack.avg_price, spot);
        let realized =
            self.lots
                .lock()
                .apply_fill(&order.instrument, order.side, ack.filled_size, price_usd);
        if !realized.is_zero() {
            self.ledger
                .lock()
                .credit_realized(realized, self.controls.reserve_pct);
            self.audit
                .append(
                    AuditEvent::MtmCredit,
                    json!({ "instrument": order.instrument, "realizedUsdc": realized }),
                )
                .await;
        }
        self.audit
            .append(
                AuditEvent::HedgeOrder,
                json!({
                    "orderId": ack.order_id,
                    "venue": ack.venue,
                    "instrument": order.instrument,
                    "side": order.side.as_str(),
                    "size": ack.filled_size,
                    "priceUsdc": price_usd,
                    "intent": intent,
                    "feeRecognized": false,
                }),
            )
            .await;
        Ok(json!({ "status": "ok", "orderId": ack.order_id, "filledSize": ack.filled_size }))
    }

    // ---- tick / renew / net exposure ----

    fn account_buffer_pct(&self, account: &AccountConfig) -> f64 {
        let portfolios = self.portfolios.read();
        let equity = match portfolios.get(&account.account_id) {
            Some(snapshot) => {
                snapshot.cash_usdc.to_f64() + snapshot.position_pnl_usdc.to_f64()
            }
            None => account.initial_balance_usdc,
        };
        let floor = account.initial_balance_usdc - account.drawdown_limit_usdc;
        if account.initial_balance_usdc <= 0.0 {
            return 0.0;
        }
        (equity - floor) / account.initial_balance_usdc
    }

    pub async fn tick_account(self: &Arc<Self>, account: &AccountConfig) -> TickReport {
        let now = Utc::now();
        let buffer_pct = self.account_buffer_pct(account);
        let decision = rolling::decide(
            buffer_pct,
            account.buffer_target_pct,
            account.hysteresis_pct,
            now,
            account.expiry_iso,
            account.renew_window_minutes as i64,
        );
        self.audit
            .append(
                AuditEvent::HedgeAction,
                json!({
                    "accountId": account.account_id,
                    "bufferPct": buffer_pct,
                    "action": decision.action.as_str(),
                    "reason": decision.reason,
                    "renew": decision.renew,
                }),
            )
            .await;

        if decision.action == crate::models::HedgeAction::Increase {
            self.fire_alert(account, buffer_pct).await;
        }

        let mut renewed = false;
        if decision.renew {
            renewed = self.auto_renew_account(account).await;
        }

        TickReport {
            account_id: account.account_id.clone(),
            buffer_pct,
            hedge_action: decision.action.as_str(),
            reason: decision.reason,
            renew: decision.renew,
            renewed,
        }
    }

    async fn fire_alert(&self, account: &AccountConfig, buffer_pct: f64) {
        let Some(url) = &account.alert_webhook_url else {
            return;
        };
        let body = json!({
            "accountId": account.account_id,
            "bufferPct": buffer_pct,
            "targetPct": account.buffer_target_pct,
        });
        // Fire-and-forget: alerting never blocks or fails a tick.
        let client = self.http.clone();
        let url = url.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(error = %e, "buffer alert webhook failed");
            }
        });
    }

    /// Replay-safe renewal: one renewal per (account, expiry) no matter how
    /// many ticks land inside the window.
    pub async fn auto_renew_account(self: &Arc<Self>, account: &AccountConfig) -> bool {
        let renew_key = format!(
            "{}:{}",
            account.account_id,
            account.expiry_iso.format("%Y-%m-%dT%H:%M")
        );
        if !self.renewed_keys.lock().insert(renew_key.clone()) {
            self.audit
                .append(
                    AuditEvent::PutRenewSkipped,
                    json!({ "accountId": account.account_id, "reason": "already_renewed" }),
                )
                .await;
            return false;
        }

        self.audit
            .append(
                AuditEvent::PutRenew,
                json!({
                    "accountId": account.account_id,
                    "instrument": account.hedge_instrument,
                    "hedgeSize": account.hedge_size,
                    "payload": account.renew_payload,
                }),
            )
            .await;

        // Roll the account hedge: re-buy the configured instrument size.
        let order = OrderRequest {
            instrument: account.hedge_instrument.clone(),
            side: OrderSide::Buy,
            amount: account.hedge_size,
            order_type: OrderType::Market,
            price: None,
        };
        let venues = self.registry.names();
        let Some(primary) = venues.first() else {
            self.audit
                .append(
                    AuditEvent::PutRenewFailed,
                    json!({ "accountId": account.account_id, "reason": "no_venues" }),
                )
                .await;
            self.renewed_keys.lock().remove(&renew_key);
            return false;
        };
        match self.registry.place_order(primary, &order).await {
            Ok(ack) => {
                let spot = parse_instrument(&account.hedge_instrument)
                    .map(|p| p.asset())
                    .and_then(|asset| self.last_spot.read().get(&asset).copied())
                    .unwrap_or(1.0);
                let price_usd = fill_price_usd(&account.hedge_instrument, ack.avg_price, spot);
                let premium = Usd::from_f64(price_usd * ack.filled_size).unwrap_or(Usd::ZERO);
                self.lots.lock().apply_fill(
                    &account.hedge_instrument,
                    OrderSide::Buy,
                    ack.filled_size,
                    price_usd,
                );
                self.ledger
                    .lock()
                    .book_option_spend(premium, self.controls.reserve_pct);
                self.audit
                    .append(
                        AuditEvent::HedgeOrder,
                        json!({
                            "accountId": account.account_id,
                            "orderId": ack.order_id,
                            "venue": ack.venue,
                            "instrument": account.hedge_instrument,
                            "side": "buy",
                            "size": ack.filled_size,
                            "priceUsdc": price_usd,
                            "premiumUsdc": premium,
                            "feeRecognized": false,
                            "hedgeType": "option",
                        }),
                    )
                    .await;
                self.audit
                    .append(
                        AuditEvent::CoverageRenewed,
                        json!({
                            "accountId": account.account_id,
                            "expiryIso": account.expiry_iso,
                            "renewedAt": Utc::now(),
                        }),
                    )
                    .await;
                true
            }
            Err(e) => {
                self.audit
                    .append(
                        AuditEvent::PutRenewFailed,
                        json!({ "accountId": account.account_id, "reason": e.to_string() }),
                    )
                    .await;
                self.renewed_keys.lock().remove(&renew_key);
                false
            }
        }
    }

    /// Sweep expired coverages, emitting `coverage_expired` exactly once.
    async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .coverages
            .read()
            .values()
            .filter(|c| !c.is_live(now))
            .map(|c| c.coverage_id.clone())
            .collect();
        for id in expired {
            if self.expired_emitted.lock().insert(id.clone()) {
                self.audit
                    .append(AuditEvent::CoverageExpired, json!({ "coverageId": id }))
                    .await;
            }
        }
    }

    pub async fn run_net_exposure(self: &Arc<Self>) -> serde_json::Value {
        let now = Utc::now();
        let coverages: Vec<Coverage> = self.coverages.read().values().cloned().collect();
        let mut spots = HashMap::new();
        if let Some(spot) = self.spot(Asset::Btc).await {
            spots.insert(Asset::Btc, spot);
        }
        let iv = self.ladder.snapshot().map(|s| s.hedge_iv);
        let spend_ratio = self.ledger.lock().spend_ratio();

        // Funding from the primary venue's perp ticker; ample buffer when
        // every configured account sits above its target.
        let funding = match self.registry.get(self.registry.names().first().map(String::as_str).unwrap_or("")) {
            Some(connector) => {
                match tokio::time::timeout(
                    SPOT_TIMEOUT,
                    connector.get_ticker(&crate::venues::instrument::format_perp(Asset::Btc)),
                )
                .await
                {
                    Ok(Ok(t)) => t.funding_rate,
                    _ => None,
                }
            }
            None => None,
        };
        let accounts = self.accounts.load();
        let ample_buffer = !accounts.accounts.is_empty()
            && accounts
                .accounts
                .iter()
                .all(|a| self.account_buffer_pct(a) > a.buffer_target_pct);

        let plans = self.planner.build_plans(
            &coverages,
            now,
            &spots,
            iv,
            spend_ratio,
            funding,
            ample_buffer,
        );

        let mut results = Vec::new();
        for plan in &plans {
            let Some(spot) = spots.get(&plan.asset).copied() else {
                continue;
            };
            let budget = self.ledger.lock().hedge_budget_remaining(&self.controls);
            let outcome = self.planner.execute(plan, spot, budget).await;

            self.audit
                .append(
                    AuditEvent::HedgeAction,
                    json!({
                        "coverageIds": [PLATFORM_COVERAGE_ID],
                        "asset": plan.asset.as_str(),
                        "netNotionalUsd": plan.net_notional_usd,
                        "hedgeFactor": plan.hedge_factor,
                        "attenuators": plan.attenuators,
                        "targetUnits": plan.target_units,
                        "optionLadderDiag": outcome.diag,
                        "ladderExhausted": outcome.ladder_exhausted,
                    }),
                )
                .await;

            for leg in &outcome.executed {
                let realized = self.lots.lock().apply_fill(
                    &leg.instrument,
                    leg.side,
                    leg.size,
                    leg.price_usd,
                );
                if !realized.is_zero() {
                    self.ledger
                        .lock()
                        .credit_realized(realized, self.controls.reserve_pct);
                    self.audit
                        .append(
                            AuditEvent::MtmCredit,
                            json!({ "instrument": leg.instrument, "realizedUsdc": realized }),
                        )
                        .await;
                }
                match leg.hedge_type {
                    HedgeType::Option => {
                        self.ledger
                            .lock()
                            .book_option_spend(leg.premium_usd, self.controls.reserve_pct);
                    }
                    HedgeType::Perp => {
                        // Fully-margined platform perp: margin = notional.
                        let margin =
                            Usd::from_f64(leg.size * leg.price_usd).unwrap_or(Usd::ZERO);
                        self.ledger
                            .lock()
                            .book_perp_margin(margin, self.controls.reserve_pct);
                    }
                }
                self.audit
                    .append(
                        AuditEvent::HedgeOrder,
                        json!({
                            "coverageIds": [PLATFORM_COVERAGE_ID],
                            "orderId": leg.order_id,
                            "venue": leg.venue,
                            "instrument": leg.instrument,
                            "side": leg.side.as_str(),
                            "size": leg.size,
                            "priceUsdc": leg.price_usd,
                            "premiumUsdc": leg.premium_usd,
                            "hedgeType": leg.hedge_type,
                            "feeRecognized": false,
                        }),
                    )
                    .await;
            }
            for rejected in &outcome.rejected {
                self.audit
                    .append(
                        AuditEvent::OptionExecFailed,
                        json!({
                            "coverageIds": [PLATFORM_COVERAGE_ID],
                            "venue": rejected.venue,
                            "instrument": rejected.instrument,
                            "reason": rejected.reason,
                        }),
                    )
                    .await;
            }
            if !outcome.executed.is_empty() {
                let ledger_snapshot = self.ledger.lock().clone();
                self.audit
                    .append(
                        AuditEvent::LiquidityUpdate,
                        json!({
                            "coverageIds": [PLATFORM_COVERAGE_ID],
                            "ledger": ledger_snapshot,
                        }),
                    )
                    .await;
            }

            results.push(json!({
                "asset": plan.asset.as_str(),
                "netNotionalUsd": plan.net_notional_usd,
                "executedLegs": outcome.executed.len(),
                "rejectedLegs": outcome.rejected.len(),
                "ladderExhausted": outcome.ladder_exhausted,
            }));
        }
        json!({ "plans": results })
    }

    /// One loop sweep: expiry sweep, per-account ticks, net exposure.
    pub async fn loop_tick(self: &Arc<Self>) -> serde_json::Value {
        self.sweep_expired().await;
        let accounts = self.accounts.load();
        let mut reports = Vec::new();
        for account in &accounts.accounts {
            reports.push(self.tick_account(account).await);
        }
        let net = self.run_net_exposure().await;
        let summary = json!({
            "accounts": reports,
            "netExposure": net,
        });
        self.audit
            .append(AuditEvent::LoopTick, summary.clone())
            .await;
        summary
    }

    // ---- audit views / reset ----

    pub fn audit_entries(&self, limit: usize) -> Vec<crate::audit::AuditEntry> {
        self.audit.recent(limit)
    }

    pub fn audit_summary(&self, mode: &str) -> serde_json::Value {
        let entries = self.audit.recent(2_000);
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for entry in &entries {
            *counts.entry(entry.event.as_str()).or_default() += 1;
        }
        let ledger = self.ledger.lock().clone();
        let mut summary = json!({
            "mode": mode,
            "eventCounts": counts,
            "ledger": ledger,
            "entryCount": entries.len(),
        });
        if mode == "internal" {
            let lots: Vec<_> = self
                .lots
                .lock()
                .open_lots()
                .into_iter()
                .map(|(instrument, lot)| json!({ "instrument": instrument, "lot": lot }))
                .collect();
            summary["lots"] = json!(lots);
            summary["activeCoverages"] = json!(self.active_coverages(None).len());
            summary["mtm"] = json!(*self.mtm.read());
        }
        summary
    }

    /// `/admin/reset`: delete audit artifacts, clear maps, zero the ledger.
    pub async fn admin_reset(&self) -> serde_json::Value {
        self.audit.reset().await;
        if let Some(dir) = self.audit.path().parent() {
            if let Ok(mut read_dir) = tokio::fs::read_dir(dir).await {
                while let Ok(Some(entry)) = read_dir.next_entry().await {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(".json") {
                        let _ = tokio::fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        self.coverages.write().clear();
        self.expired_emitted.lock().clear();
        self.lots.lock().clear();
        self.ledger.lock().zero();
        self.subsidies.lock().clear();
        self.portfolios.write().clear();
        *self.mtm.write() = None;
        self.recent_quotes.lock().clear();
        self.quote_order.lock().clear();
        self.renewed_keys.lock().clear();
        self.quote_cache.clear();
        info!("engine state reset");
        json!({ "status": "ok" })
    }
}
