//! End-to-end engine scenarios against a synthetic venue.
//!
//! The mock venue lists a 7-day put chain with controllable book prices;
//! the paper executor wraps it so activation and platform hedging fill for
//! real, driving the ledger, lots and audit trail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use collarbot_backend::audit::{AuditEvent, AuditLog};
use collarbot_backend::config::{AccountsLoader, AppConfig, RiskControls};
use collarbot_backend::engine::{ActivateRequest, CoverageEngine, PutQuoteRequest};
use collarbot_backend::marketdata::{AtmIvCache, PutLadderCache};
use collarbot_backend::models::{Asset, OptionType, OrderSide, QuoteStatus, Tier};
use collarbot_backend::money::Usd;
use collarbot_backend::venues::instrument::format_option;
use collarbot_backend::venues::paper::PaperVenue;
use collarbot_backend::venues::{
    BookLevel, InstrumentInfo, InstrumentKind, OrderAck, OrderRequest, OrderType, Ticker,
    VenueBook, VenueConnector, VenuePosition, VenueRegistry,
};

const SPOT: f64 = 50_000.0;

struct MockVenue {
    instruments: Vec<InstrumentInfo>,
    books: RwLock<HashMap<String, VenueBook>>,
}

impl MockVenue {
    /// 7-day put chain, strikes 40k..52k, all priced `ask_btc` per unit.
    fn with_put_chain(expiry: DateTime<Utc>, ask_btc: f64) -> Arc<Self> {
        let mut instruments = Vec::new();
        let mut books = HashMap::new();
        for strike in (40..=52).map(|k| (k * 1_000) as f64) {
            let name = format_option(Asset::Btc, expiry, strike, OptionType::Put);
            instruments.push(InstrumentInfo {
                name: name.clone(),
                asset: Asset::Btc,
                kind: InstrumentKind::Option,
                expiry: Some(expiry),
                strike: Some(strike),
                option_type: Some(OptionType::Put),
                contract_size: 1.0,
            });
            books.insert(
                name,
                VenueBook {
                    bids: vec![BookLevel {
                        price: ask_btc * 0.95,
                        size: 5.0,
                    }],
                    asks: vec![BookLevel {
                        price: ask_btc,
                        size: 5.0,
                    }],
                },
            );
        }
        instruments.push(InstrumentInfo {
            name: "BTC-PERPETUAL".to_string(),
            asset: Asset::Btc,
            kind: InstrumentKind::Perpetual,
            expiry: None,
            strike: None,
            option_type: None,
            contract_size: 1.0,
        });
        books.insert(
            "BTC-PERPETUAL".to_string(),
            VenueBook {
                bids: vec![BookLevel {
                    price: SPOT - 5.0,
                    size: 10.0,
                }],
                asks: vec![BookLevel {
                    price: SPOT + 5.0,
                    size: 10.0,
                }],
            },
        );
        Arc::new(Self {
            instruments,
            books: RwLock::new(books),
        })
    }
}

#[async_trait]
impl VenueConnector for MockVenue {
    fn name(&self) -> &'static str {
        "deribit"
    }

    async fn list_instruments(&self, _asset: Asset) -> Result<Vec<InstrumentInfo>> {
        Ok(self.instruments.clone())
    }

    async fn get_ticker(&self, instrument: &str) -> Result<Ticker> {
        let books = self.books.read();
        let book = books
            .get(instrument)
            .ok_or_else(|| anyhow!("unknown instrument {instrument}"))?;
        Ok(Ticker {
            instrument: instrument.to_string(),
            best_bid: book.best_bid().map(|l| l.price),
            best_ask: book.best_ask().map(|l| l.price),
            mark_price: book.best_ask().map(|l| l.price).unwrap_or(0.0),
            mark_iv: Some(55.0),
            index_price: Some(SPOT),
            funding_rate: Some(0.0001),
        })
    }

    async fn get_order_book(&self, instrument: &str) -> Result<VenueBook> {
        self.books
            .read()
            .get(instrument)
            .cloned()
            .ok_or_else(|| anyhow!("unknown instrument {instrument}"))
    }

    async fn get_index_price(&self, _asset: Asset) -> Result<f64> {
        Ok(SPOT)
    }

    async fn get_positions(&self, _asset: Asset) -> Result<Vec<VenuePosition>> {
        Ok(Vec::new())
    }

    async fn place_order(&self, _req: &OrderRequest) -> Result<OrderAck> {
        Err(anyhow!("mock venue does not execute; wrap with paper"))
    }
}

struct Harness {
    engine: Arc<CoverageEngine>,
    _tmp: tempfile::TempDir,
}

fn app_config(tmp: &tempfile::TempDir) -> AppConfig {
    AppConfig {
        loop_interval_ms: 15_000,
        mtm_interval_ms: 60_000,
        app_mode: "test".to_string(),
        foxify_approved: false,
        audit_seed: None,
        accounts_config_path: tmp.path().join("live_accounts.json"),
        quote_cache_ttl_ms: 4_000,
        quote_cache_stale_ms: 20_000,
        quote_cache_hard_ms: 120_000,
        deribit_env: "testnet".to_string(),
        deribit_paper: true,
        deribit_client_id: None,
        deribit_client_secret: None,
    }
}

fn bronze_tier() -> Tier {
    Tier {
        name: "Pro (Bronze)".to_string(),
        deposit: Usd::from_i64(500),
        funding: Usd::from_i64(2_500),
        profit_target: Usd::from_i64(250),
        drawdown_limit_pct: 0.2,
        fixed_price_usdc: Usd::from_i64(10),
        expiry_days: Some(7),
        renew_window_minutes: Some(15),
        buffer_alert_pct: Some(0.03),
    }
}

fn harness_with(ask_btc: f64, controls: RiskControls, accounts_json: &str) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("live_accounts.json"), accounts_json).unwrap();

    let expiry = Utc::now() + ChronoDuration::days(7);
    let mock = MockVenue::with_put_chain(expiry, ask_btc);
    let paper = PaperVenue::wrap(mock.clone());
    let mut registry = VenueRegistry::new();
    registry.register(paper);

    let ladder = PutLadderCache::new(5_000, 30_000, 0.05, "testnet");
    let atm_iv = Arc::new(AtmIvCache::new(mock, 15_000, 0.5));
    let audit = Arc::new(AuditLog::new(tmp.path().join("logs/audit.log")));
    let accounts = AccountsLoader::new(tmp.path().join("live_accounts.json"));

    let engine = CoverageEngine::new(
        app_config(&tmp),
        HashMap::from([(bronze_tier().name.clone(), bronze_tier())]),
        Arc::new(controls),
        registry,
        audit,
        ladder,
        atm_iv,
        accounts,
    );
    Harness { engine, _tmp: tmp }
}

fn harness(ask_btc: f64) -> Harness {
    harness_with(ask_btc, RiskControls::default(), r#"{"accounts":[]}"#)
}

fn quote_request(pass_through: bool) -> PutQuoteRequest {
    serde_json::from_value(serde_json::json!({
        "tierName": "Pro (Bronze)",
        "asset": "BTC",
        "side": "long",
        "positionId": "pos-1",
        "marginUsd": 2500,
        "leverage": 2.0,
        "entryPrice": SPOT,
        "spot": SPOT,
        "allowPremiumPassThrough": pass_through,
    }))
    .unwrap()
}

fn event_count(engine: &Arc<CoverageEngine>, event: AuditEvent) -> usize {
    engine
        .audit_entries(2_000)
        .iter()
        .filter(|e| e.event == event)
        .count()
}

#[tokio::test]
async fn test_healthy_books_quote_ok_with_bronze_fee() {
    // ~ $20/unit premium; fee is the Bronze flat 20 and premium stays
    // under it, so the quote is a plain ok.
    let h = harness(0.0004);
    let quote = h.engine.quote(&quote_request(false)).await.unwrap();

    assert_eq!(quote.status, QuoteStatus::Ok);
    assert_eq!(quote.fee_usdc.fmt_2dp(), "20.00");
    assert!(quote.all_in_premium_usdc <= Usd::from_i64(25));
    let survival = quote.survival_check.unwrap();
    assert!(survival.pass);
    // The selected strike must actually cover the floor credit.
    assert!(quote.strike.unwrap() >= 49_800.0);
    assert_eq!(quote.roll_multiplier, 1);
    assert!(!quote.execution_plan.is_empty());
}

#[tokio::test]
async fn test_premium_above_fee_is_subsidized() {
    // ~$22.5/unit -> all-in 2.25x fee? No: premium_total = 22.5 * 0.1 =
    // 2.25... scale so all-in lands between fee and floor ratio: ask
    // 0.0044 -> $220/unit -> total 22.0; ratio 1.1 < 1.25.
    let h = harness(0.0044);
    let quote = h.engine.quote(&quote_request(false)).await.unwrap();
    assert_eq!(quote.status, QuoteStatus::Subsidized);
    assert_eq!(quote.fee_usdc.fmt_2dp(), "20.00");
    assert_eq!(quote.subsidy_usdc.fmt_2dp(), "2.00");
}

#[tokio::test]
async fn test_premium_floor_without_pass_through() {
    // $300/unit -> all-in 30 vs fee 20: ratio 1.5 > 1.25.
    let h = harness(0.006);
    let quote = h.engine.quote(&quote_request(false)).await.unwrap();
    assert_eq!(quote.status, QuoteStatus::PremiumFloor);
    assert!(quote.status.is_terminal());
}

#[tokio::test]
async fn test_pass_through_conservation() {
    let h = harness(0.006);
    let quote = h.engine.quote(&quote_request(true)).await.unwrap();
    assert_eq!(quote.status, QuoteStatus::PassThrough);
    // I2: fee + subsidy == all-in premium.
    assert_eq!(
        (quote.fee_usdc + quote.subsidy_usdc).fmt_2dp(),
        quote.all_in_premium_usdc.fmt_2dp()
    );
}

#[tokio::test]
async fn test_quote_cache_serves_fresh() {
    let h = harness(0.0004);
    let first = h.engine.quote(&quote_request(false)).await.unwrap();
    let second = h.engine.quote(&quote_request(false)).await.unwrap();
    // Same cached compute: identical quote id.
    assert_eq!(first.quote_id, second.quote_id);
    assert_eq!(event_count(&h.engine, AuditEvent::PutQuote), 1);
}

#[tokio::test]
async fn test_activation_books_ledger_and_is_idempotent() {
    let h = harness(0.0004);
    let quote = h.engine.quote(&quote_request(false)).await.unwrap();

    let first = h
        .engine
        .activate(&ActivateRequest {
            quote_id: quote.quote_id.clone(),
            account_id: None,
        })
        .await
        .unwrap();
    assert_eq!(first.status, "ok");
    assert_eq!(first.fee_usdc.fmt_2dp(), "20.00");

    let second = h
        .engine
        .activate(&ActivateRequest {
            quote_id: quote.quote_id.clone(),
            account_id: None,
        })
        .await
        .unwrap();
    assert_eq!(second.status, "duplicate");

    // Exactly one activation + one duplicate; revenue booked once.
    assert_eq!(event_count(&h.engine, AuditEvent::CoverageActivated), 1);
    assert_eq!(event_count(&h.engine, AuditEvent::CoverageDuplicate), 1);
    let report = h.engine.coverage_report(None);
    assert_eq!(report["ledger"]["revenueUsdc"], "20.00");
    assert_eq!(report["activeCoverages"], 1);

    // Ordering: hedge_action precedes hedge_order precedes
    // liquidity_update precedes coverage_activated.
    let entries = h.engine.audit_entries(2_000);
    let pos = |event: AuditEvent| entries.iter().position(|e| e.event == event).unwrap();
    assert!(pos(AuditEvent::HedgeAction) < pos(AuditEvent::HedgeOrder));
    assert!(pos(AuditEvent::HedgeOrder) < pos(AuditEvent::LiquidityUpdate));
    assert!(pos(AuditEvent::LiquidityUpdate) < pos(AuditEvent::CoverageActivated));
}

#[tokio::test]
async fn test_audit_export_idempotency() {
    let h = harness(0.0004);
    let expiry = (Utc::now() + ChronoDuration::hours(24)).to_rfc3339();
    let payload = serde_json::json!({
        "coverageId": "Pro (Bronze):2099-01-01:pos-9",
        "expiryIso": expiry,
        "tierName": "Pro (Bronze)",
        "feeUsd": 20.0,
    });

    let first = h.engine.audit_export(payload.clone()).await.unwrap();
    assert_eq!(first["status"], "ok");
    let second = h.engine.audit_export(payload).await.unwrap();
    assert_eq!(second["status"], "duplicate");

    let report = h.engine.coverage_report(None);
    assert_eq!(report["ledger"]["revenueUsdc"], "20.00");
    assert_eq!(event_count(&h.engine, AuditEvent::CoverageActivated), 1);
    assert_eq!(event_count(&h.engine, AuditEvent::CoverageDuplicate), 1);
}

#[tokio::test]
async fn test_close_guard_blocks_positive_buffer() {
    let h = harness(0.0004);
    let order = OrderRequest {
        instrument: "BTC-PERPETUAL".to_string(),
        side: OrderSide::Sell,
        amount: 0.1,
        order_type: OrderType::Market,
        price: None,
    };
    let err = h
        .engine
        .venue_order(
            "deribit",
            order,
            Some("close"),
            Some(Usd::from_i64(500)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "drawdown_buffer_positive");
    assert_eq!(event_count(&h.engine, AuditEvent::CloseBlocked), 1);

    // Buffer at/below zero goes through.
    let order = OrderRequest {
        instrument: "BTC-PERPETUAL".to_string(),
        side: OrderSide::Sell,
        amount: 0.1,
        order_type: OrderType::Market,
        price: None,
    };
    let ok = h
        .engine
        .venue_order("deribit", order, Some("close"), Some(Usd::ZERO))
        .await
        .unwrap();
    assert_eq!(ok["status"], "ok");
}

fn accounts_json(expiry: DateTime<Utc>, put_instrument: &str) -> String {
    serde_json::json!({
        "accounts": [{
            "accountId": "acct-1",
            "drawdownLimitUsdc": 2000.0,
            "initialBalanceUsdc": 10000.0,
            "hedgeInstrument": put_instrument,
            "hedgeSize": 0.1,
            "bufferTargetPct": 0.05,
            "hysteresisPct": 0.02,
            "expiryIso": expiry.to_rfc3339(),
            "renewWindowMinutes": 15,
            "renewPayload": {}
        }]
    })
    .to_string()
}

#[tokio::test]
async fn test_tick_flags_thin_buffer_and_renews_once() {
    let chain_expiry = Utc::now() + ChronoDuration::days(7);
    let put = format_option(Asset::Btc, chain_expiry, 50_000.0, OptionType::Put);
    // Account expiry 10 minutes out with a 15-minute window: renew now.
    let account_expiry = Utc::now() + ChronoDuration::minutes(10);
    let h = harness_with(
        0.0004,
        RiskControls::default(),
        &accounts_json(account_expiry, &put),
    );

    // Equity 8120 vs floor 8000: buffer 1.2% below the 5% target.
    h.engine
        .ingest_portfolio(
            serde_json::from_value(serde_json::json!({
                "accountId": "acct-1",
                "cashUsdc": 8120.0,
                "positionPnlUsdc": 0.0,
            }))
            .unwrap(),
        )
        .await;

    let accounts = h.engine.accounts.load();
    let report = h.engine.tick_account(&accounts.accounts[0]).await;
    assert!((report.buffer_pct - 0.012).abs() < 1e-9);
    assert_eq!(report.hedge_action, "increase");
    assert_eq!(report.reason, "buffer_below_target");
    assert!(report.renew);
    assert!(report.renewed);
    assert_eq!(event_count(&h.engine, AuditEvent::CoverageRenewed), 1);

    // A second tick inside the same window must not renew again.
    let report = h.engine.tick_account(&accounts.accounts[0]).await;
    assert!(report.renew);
    assert!(!report.renewed);
    assert_eq!(event_count(&h.engine, AuditEvent::CoverageRenewed), 1);
    assert_eq!(event_count(&h.engine, AuditEvent::PutRenewSkipped), 1);
}

#[tokio::test]
async fn test_net_exposure_with_zero_budget_flags_and_falls_back() {
    let h = harness(0.0004);
    // Activate a long coverage so the platform carries net exposure; the
    // ledger starts at zero liquidity so the ladder budget is ~the fee.
    let quote = h.engine.quote(&quote_request(false)).await.unwrap();
    h.engine
        .activate(&ActivateRequest {
            quote_id: quote.quote_id.clone(),
            account_id: None,
        })
        .await
        .unwrap();

    let result = h.engine.run_net_exposure().await;
    let plans = result["plans"].as_array().unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0]["netNotionalUsd"], 5000.0);

    // Platform legs are audited under the platform-risk coverage id.
    let entries = h.engine.audit_entries(2_000);
    let platform_actions: Vec<_> = entries
        .iter()
        .filter(|e| {
            e.event == AuditEvent::HedgeAction
                && e.payload["coverageIds"][0] == "platform-risk"
        })
        .collect();
    assert_eq!(platform_actions.len(), 1);
    assert!(platform_actions[0].payload["optionLadderDiag"].is_object());
}

#[tokio::test]
async fn test_admin_reset_zeroes_everything() {
    let h = harness(0.0004);
    let quote = h.engine.quote(&quote_request(false)).await.unwrap();
    h.engine
        .activate(&ActivateRequest {
            quote_id: quote.quote_id.clone(),
            account_id: None,
        })
        .await
        .unwrap();

    let result = h.engine.admin_reset().await;
    assert_eq!(result["status"], "ok");
    let report = h.engine.coverage_report(None);
    assert_eq!(report["activeCoverages"], 0);
    assert_eq!(report["ledger"]["revenueUsdc"], "0.00");
    assert_eq!(h.engine.audit_entries(100).len(), 0);
}

#[tokio::test]
async fn test_risk_summary_math() {
    let h = harness(0.0004);
    let summary = h
        .engine
        .risk_summary(
            Usd::from_f64(9_000.0),
            Usd::from_f64(-500.0),
            Usd::from_f64(100.0),
            Usd::from_f64(2_000.0),
            Usd::from_f64(10_000.0),
            None,
        )
        .await
        .unwrap();
    // equity 8600, floor 8000, buffer 600 (6%)
    assert_eq!(summary.equity_usdc.fmt_2dp(), "8600.00");
    assert_eq!(summary.drawdown_floor_usdc.fmt_2dp(), "8000.00");
    assert_eq!(summary.buffer_usdc.fmt_2dp(), "600.00");
    assert!((summary.buffer_pct - 0.06).abs() < 1e-9);
    assert_eq!(summary.status, "ok");

    let missing = h
        .engine
        .risk_summary(None, None, None, None, None, None)
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), "missing_drawdown_inputs");
}
