//! CollarBot - drawdown-protection control plane
//!
//! Wires the venue registry, market-data caches and the coverage engine,
//! spawns the background loops (account sweep, MTM refresh, IV ladder) and
//! serves the HTTP surface on 0.0.0.0:4100.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collarbot_backend::api;
use collarbot_backend::audit::AuditLog;
use collarbot_backend::config::{
    load_funded_levels, load_risk_controls, AccountsLoader, AppConfig,
};
use collarbot_backend::engine::CoverageEngine;
use collarbot_backend::marketdata::{AtmIvCache, PutLadderCache};
use collarbot_backend::models::Asset;
use collarbot_backend::venues::bybit::BybitConnector;
use collarbot_backend::venues::deribit::DeribitConnector;
use collarbot_backend::venues::paper::PaperVenue;
use collarbot_backend::venues::{VenueConnector, VenueRegistry};

const BIND_ADDR: &str = "0.0.0.0:4100";
const AUDIT_LOG_PATH: &str = "logs/audit.log";
const ATM_IV_TTL_MS: u64 = 15_000;
const LADDER_MAX_AGE_MS: i64 = 5_000;
const LADDER_SNAPSHOT_MAX_AGE_MS: i64 = 30_000;
const LADDER_PRICE_BUFFER_PCT: f64 = 0.05;

fn config_path(env_var: &str, default: &str) -> PathBuf {
    std::env::var(env_var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collarbot_backend=info,collarbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = AppConfig::from_env();
    info!(
        mode = %app.app_mode,
        paper = app.deribit_paper,
        deribit_env = %app.deribit_env,
        "starting collarbot backend"
    );

    // Config load failures are fatal at startup.
    let tiers = load_funded_levels(&config_path(
        "FUNDED_LEVELS_PATH",
        "config/funded_levels.json",
    ))
    .context("load funded levels")?;
    let controls = Arc::new(
        load_risk_controls(&config_path(
            "RISK_CONTROLS_PATH",
            "config/risk_controls.json",
        ))
        .context("load risk controls")?,
    );

    // Venue registry: Deribit executes, Bybit contributes market data. In
    // paper mode both are wrapped so split legs fill in simulation.
    let deribit: Arc<dyn VenueConnector> = Arc::new(DeribitConnector::new(
        &app.deribit_env,
        app.deribit_client_id.clone(),
        app.deribit_client_secret.clone(),
    )?);
    let bybit: Arc<dyn VenueConnector> = Arc::new(BybitConnector::new()?);
    let mut registry = VenueRegistry::new();
    if app.deribit_paper {
        registry.register(PaperVenue::wrap(deribit.clone()));
        registry.register(PaperVenue::wrap(bybit));
    } else {
        registry.register(deribit.clone());
        registry.register(bybit);
    }

    let ladder = PutLadderCache::new(
        LADDER_MAX_AGE_MS,
        LADDER_SNAPSHOT_MAX_AGE_MS,
        LADDER_PRICE_BUFFER_PCT,
        &app.deribit_env,
    );
    ladder.spawn(deribit.clone(), Asset::Btc);

    let atm_iv = Arc::new(AtmIvCache::new(
        deribit,
        ATM_IV_TTL_MS,
        controls.atm_iv_fallback,
    ));
    let audit = Arc::new(AuditLog::new(AUDIT_LOG_PATH));
    let accounts = AccountsLoader::new(app.accounts_config_path.clone());

    let engine = CoverageEngine::new(
        app.clone(),
        tiers,
        controls,
        registry,
        audit,
        ladder,
        atm_iv,
        accounts,
    );
    engine.seed_audit().await;

    // Background loops: account sweep and MTM refresh.
    {
        let engine = engine.clone();
        let mut ticker = interval(Duration::from_millis(app.loop_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let _ = engine.loop_tick().await;
            }
        });
    }
    {
        let engine = engine.clone();
        let mut ticker = interval(Duration::from_millis(app.mtm_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let _ = engine.refresh_mtm().await;
            }
        });
    }

    let router = api::router(engine);
    let listener = TcpListener::bind(BIND_ADDR)
        .await
        .with_context(|| format!("bind {BIND_ADDR}"))?;
    info!(addr = BIND_ADDR, "control plane listening");
    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "server exited");
    }
    Ok(())
}
