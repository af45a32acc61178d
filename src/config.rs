//! Operator configuration.
//!
//! Three JSON files drive the engine: `funded_levels.json` (tiers),
//! `risk_controls.json` (every pricing/hedging knob) and
//! `live_accounts.json` (accounts swept by the loop). Numerics in operator
//! files may arrive as strings or numbers and must be finite. Startup
//! failure to load the first two is fatal; the accounts file is re-read on
//! mtime change so operators can edit it without a restart.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

use crate::models::Tier;
use crate::money::Usd;

/// String-or-number numeric field; rejects non-finite values.
fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    let parsed = match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(x) if x.is_finite() => Ok(x),
        _ => Err(serde::de::Error::custom("expected finite number")),
    }
}

fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => match n.as_f64() {
            Some(x) if x.is_finite() => Ok(Some(x)),
            _ => Err(serde::de::Error::custom("expected finite number")),
        },
        Some(serde_json::Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(x) if x.is_finite() => Ok(Some(x)),
            _ => Err(serde::de::Error::custom("expected finite number")),
        },
        _ => Err(serde::de::Error::custom("expected number or string")),
    }
}

#[derive(Debug, Deserialize)]
struct FundedLevelsFile {
    levels: Vec<FundedLevelRaw>,
}

#[derive(Debug, Deserialize)]
struct FundedLevelRaw {
    name: String,
    #[serde(deserialize_with = "de_f64")]
    deposit_usdc: f64,
    #[serde(deserialize_with = "de_f64")]
    funding_usdc: f64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    #[allow(dead_code)]
    points_target: Option<f64>,
    #[serde(deserialize_with = "de_f64")]
    profit_target_usdc: f64,
    #[serde(deserialize_with = "de_f64")]
    drawdown_limit_pct: f64,
    #[serde(deserialize_with = "de_f64")]
    fixed_price_usdc: f64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    expiry_days: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    renew_window_minutes: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    buffer_alert_pct: Option<f64>,
}

/// Load and validate funded levels. Tier invariants are enforced here so
/// downstream code never re-checks them.
pub fn load_funded_levels(path: &Path) -> Result<HashMap<String, Tier>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read funded levels {}", path.display()))?;
    let file: FundedLevelsFile =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

    let mut tiers = HashMap::with_capacity(file.levels.len());
    for lvl in file.levels {
        if !(lvl.drawdown_limit_pct > 0.0 && lvl.drawdown_limit_pct < 1.0) {
            bail!(
                "tier {}: drawdown_limit_pct {} outside (0, 1)",
                lvl.name,
                lvl.drawdown_limit_pct
            );
        }
        if lvl.fixed_price_usdc < 0.0 {
            bail!("tier {}: fixed_price_usdc is negative", lvl.name);
        }
        let tier = Tier {
            name: lvl.name.clone(),
            deposit: Usd::from_f64(lvl.deposit_usdc).unwrap_or(Usd::ZERO),
            funding: Usd::from_f64(lvl.funding_usdc).unwrap_or(Usd::ZERO),
            profit_target: Usd::from_f64(lvl.profit_target_usdc).unwrap_or(Usd::ZERO),
            drawdown_limit_pct: lvl.drawdown_limit_pct,
            fixed_price_usdc: Usd::from_f64(lvl.fixed_price_usdc).unwrap_or(Usd::ZERO),
            expiry_days: lvl.expiry_days.map(|d| d.max(1.0) as u32),
            renew_window_minutes: lvl.renew_window_minutes.map(|m| m as i64),
            buffer_alert_pct: lvl.buffer_alert_pct,
        };
        tiers.insert(lvl.name, tier);
    }
    info!(count = tiers.len(), "funded levels loaded");
    Ok(tiers)
}

#[derive(Debug, Clone, Deserialize)]
pub struct IvRegimeThresholds {
    #[serde(deserialize_with = "de_f64")]
    pub low: f64,
    #[serde(deserialize_with = "de_f64")]
    pub high: f64,
}

impl Default for IvRegimeThresholds {
    fn default() -> Self {
        Self {
            low: 0.35,
            high: 0.75,
        }
    }
}

/// Every pricing / hedging knob the operators tune. Serde defaults keep the
/// engine runnable from a sparse file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskControls {
    pub min_fee_usdc_by_tier: HashMap<String, f64>,
    pub duration_fee_per_day_pct: f64,
    pub duration_fee_max_pct: f64,
    pub duration_fee_base_days: u32,
    pub fee_iv_regime_thresholds: IvRegimeThresholds,
    /// tier -> { "low" | "normal" | "high" -> multiplier }
    pub fee_iv_regime_multipliers_by_tier: HashMap<String, HashMap<String, f64>>,
    /// tier -> threshold/multiplier used when no regime matched
    pub fee_iv_uplift_threshold_by_tier: HashMap<String, f64>,
    pub fee_iv_uplift_multiplier_by_tier: HashMap<String, f64>,
    /// leverage bucket (stringified int) -> multiplier; largest bucket <= leverage wins
    pub fee_leverage_multipliers_by_x: HashMap<String, f64>,
    pub pass_through_cap_by_leverage: HashMap<String, f64>,
    pub premium_floor_ratio: f64,
    pub partial_coverage_discount_pct: f64,
    pub net_exposure_cap_usdc: HashMap<String, f64>,
    pub risk_budget_pct_min: f64,
    pub risk_budget_pct_max: f64,
    pub hedge_reduction_factor: f64,
    pub volatility_throttle_iv: f64,
    pub reserve_pct: f64,
    pub max_leverage: f64,
    pub min_option_size: f64,
    pub max_spread_pct: f64,
    pub max_spread_pct_by_days: HashMap<String, f64>,
    pub max_slippage_pct: f64,
    pub max_slippage_pct_by_days: HashMap<String, f64>,
    pub liquidity_override_enabled: bool,
    pub liquidity_override_spread_pct: f64,
    pub liquidity_override_spread_pct_by_days: HashMap<String, f64>,
    pub liquidity_override_slippage_pct: f64,
    pub liquidity_override_slippage_pct_by_days: HashMap<String, f64>,
    pub coverage_override_tiers: Vec<String>,
    pub survival_tolerance_pct: f64,
    pub subsidy_daily_cap_usdc_by_tier: HashMap<String, f64>,
    pub subsidy_daily_cap_usdc_per_account: f64,
    pub subsidy_iv_cutoff: f64,
    pub ctc_enabled: bool,
    pub ctc_buffer_pct: f64,
    pub ctc_margin_pct_by_tier: HashMap<String, f64>,
    pub ctc_ops_buffer_usdc_by_tier: HashMap<String, f64>,
    pub default_target_days: u32,
    pub max_target_days: u32,
    pub fallback_target_days: u32,
    pub option_search_budget_ms: u64,
    pub max_quote_venues: usize,
    pub atm_iv_fallback: f64,
}

impl Default for RiskControls {
    fn default() -> Self {
        Self {
            min_fee_usdc_by_tier: HashMap::new(),
            duration_fee_per_day_pct: 0.05,
            duration_fee_max_pct: 0.5,
            duration_fee_base_days: 1,
            fee_iv_regime_thresholds: IvRegimeThresholds::default(),
            fee_iv_regime_multipliers_by_tier: HashMap::new(),
            fee_iv_uplift_threshold_by_tier: HashMap::new(),
            fee_iv_uplift_multiplier_by_tier: HashMap::new(),
            fee_leverage_multipliers_by_x: HashMap::new(),
            pass_through_cap_by_leverage: HashMap::new(),
            premium_floor_ratio: 1.25,
            partial_coverage_discount_pct: 0.2,
            net_exposure_cap_usdc: HashMap::new(),
            risk_budget_pct_min: 0.2,
            risk_budget_pct_max: 0.6,
            hedge_reduction_factor: 0.6,
            volatility_throttle_iv: 1.2,
            reserve_pct: 0.3,
            max_leverage: 25.0,
            min_option_size: 0.1,
            max_spread_pct: 0.25,
            max_spread_pct_by_days: HashMap::new(),
            max_slippage_pct: 0.08,
            max_slippage_pct_by_days: HashMap::new(),
            liquidity_override_enabled: true,
            liquidity_override_spread_pct: 0.45,
            liquidity_override_spread_pct_by_days: HashMap::new(),
            liquidity_override_slippage_pct: 0.15,
            liquidity_override_slippage_pct_by_days: HashMap::new(),
            coverage_override_tiers: Vec::new(),
            survival_tolerance_pct: 0.98,
            subsidy_daily_cap_usdc_by_tier: HashMap::new(),
            subsidy_daily_cap_usdc_per_account: 250.0,
            subsidy_iv_cutoff: 1.5,
            ctc_enabled: false,
            ctc_buffer_pct: 0.1,
            ctc_margin_pct_by_tier: HashMap::new(),
            ctc_ops_buffer_usdc_by_tier: HashMap::new(),
            default_target_days: 7,
            max_target_days: 7,
            fallback_target_days: 14,
            option_search_budget_ms: 1200,
            max_quote_venues: 3,
            atm_iv_fallback: 0.5,
        }
    }
}

fn by_days(map: &HashMap<String, f64>, days: u32, base: f64) -> f64 {
    map.get(&days.to_string()).copied().unwrap_or(base)
}

/// Largest numeric bucket <= needle, reading stringified-int keys.
fn largest_bucket(map: &HashMap<String, f64>, needle: f64) -> Option<f64> {
    map.iter()
        .filter_map(|(k, v)| k.trim().parse::<f64>().ok().map(|b| (b, *v)))
        .filter(|(b, _)| *b <= needle)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, v)| v)
}

impl RiskControls {
    pub fn max_spread_pct_for(&self, days: u32) -> f64 {
        by_days(&self.max_spread_pct_by_days, days, self.max_spread_pct)
    }

    pub fn max_slippage_pct_for(&self, days: u32) -> f64 {
        by_days(&self.max_slippage_pct_by_days, days, self.max_slippage_pct)
    }

    pub fn override_spread_pct_for(&self, days: u32) -> f64 {
        by_days(
            &self.liquidity_override_spread_pct_by_days,
            days,
            self.liquidity_override_spread_pct,
        )
    }

    pub fn override_slippage_pct_for(&self, days: u32) -> f64 {
        by_days(
            &self.liquidity_override_slippage_pct_by_days,
            days,
            self.liquidity_override_slippage_pct,
        )
    }

    pub fn min_fee_for_tier(&self, tier: &str) -> Option<Usd> {
        self.min_fee_usdc_by_tier
            .get(tier)
            .and_then(|v| Usd::from_f64(*v))
    }

    /// Largest leverage bucket <= leverage; 1.0 when none configured.
    pub fn leverage_multiplier(&self, leverage: f64) -> f64 {
        largest_bucket(&self.fee_leverage_multipliers_by_x, leverage).unwrap_or(1.0)
    }

    /// Pass-through cap multiple for a leverage; 3.0 when none configured.
    pub fn pass_through_cap(&self, leverage: f64) -> f64 {
        largest_bucket(&self.pass_through_cap_by_leverage, leverage).unwrap_or(3.0)
    }

    pub fn is_coverage_override_tier(&self, tier: &str) -> bool {
        self.coverage_override_tiers.iter().any(|t| t == tier)
    }

    pub fn subsidy_daily_cap_for_tier(&self, tier: &str) -> f64 {
        self.subsidy_daily_cap_usdc_by_tier
            .get(tier)
            .copied()
            .unwrap_or(self.subsidy_daily_cap_usdc_per_account)
    }
}

pub fn load_risk_controls(path: &Path) -> Result<RiskControls> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read risk controls {}", path.display()))?;
    let controls: RiskControls =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if !(controls.survival_tolerance_pct > 0.0 && controls.survival_tolerance_pct <= 1.0) {
        bail!("survival_tolerance_pct outside (0, 1]");
    }
    if controls.premium_floor_ratio <= 0.0 {
        bail!("premium_floor_ratio must be positive");
    }
    info!("risk controls loaded");
    Ok(controls)
}

/// One live trading account swept by the loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub account_id: String,
    #[serde(deserialize_with = "de_f64")]
    pub drawdown_limit_usdc: f64,
    #[serde(deserialize_with = "de_f64")]
    pub initial_balance_usdc: f64,
    pub hedge_instrument: String,
    #[serde(deserialize_with = "de_f64")]
    pub hedge_size: f64,
    #[serde(deserialize_with = "de_f64")]
    pub buffer_target_pct: f64,
    #[serde(deserialize_with = "de_f64")]
    pub hysteresis_pct: f64,
    pub expiry_iso: chrono::DateTime<chrono::Utc>,
    #[serde(deserialize_with = "de_f64")]
    pub renew_window_minutes: f64,
    #[serde(default)]
    pub renew_payload: serde_json::Value,
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveAccounts {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Accounts loader cached by file mtime; safe for concurrent readers.
pub struct AccountsLoader {
    path: PathBuf,
    cached: Mutex<Option<(SystemTime, Arc<LiveAccounts>)>>,
}

impl AccountsLoader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    /// Current accounts; re-reads only when the file mtime moved. A broken
    /// edit keeps the previous good snapshot.
    pub fn load(&self) -> Arc<LiveAccounts> {
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();

        let mut cached = self.cached.lock();
        if let (Some((seen, accounts)), Some(mtime)) = (cached.as_ref(), mtime) {
            if *seen == mtime {
                return accounts.clone();
            }
        }

        match std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<LiveAccounts>(&raw).map_err(Into::into))
        {
            Ok(parsed) => {
                let arc = Arc::new(parsed);
                if let Some(mtime) = mtime {
                    *cached = Some((mtime, arc.clone()));
                }
                arc
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "accounts config unreadable");
                cached
                    .as_ref()
                    .map(|(_, a)| a.clone())
                    .unwrap_or_else(|| Arc::new(LiveAccounts::default()))
            }
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Process-level environment knobs.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub loop_interval_ms: u64,
    pub mtm_interval_ms: u64,
    pub app_mode: String,
    pub foxify_approved: bool,
    pub audit_seed: Option<String>,
    pub accounts_config_path: PathBuf,
    pub quote_cache_ttl_ms: u64,
    pub quote_cache_stale_ms: u64,
    pub quote_cache_hard_ms: u64,
    pub deribit_env: String,
    pub deribit_paper: bool,
    pub deribit_client_id: Option<String>,
    pub deribit_client_secret: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            loop_interval_ms: env_u64("LOOP_INTERVAL_MS", 15_000),
            mtm_interval_ms: env_u64("MTM_INTERVAL_MS", 60_000),
            app_mode: std::env::var("APP_MODE").unwrap_or_else(|_| "paper".to_string()),
            foxify_approved: env_flag("FOXIFY_APPROVED", false),
            audit_seed: std::env::var("AUDIT_SEED").ok().filter(|s| !s.is_empty()),
            accounts_config_path: std::env::var("ACCOUNTS_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/live_accounts.json")),
            quote_cache_ttl_ms: env_u64("QUOTE_CACHE_TTL_MS", 4_000),
            quote_cache_stale_ms: env_u64("QUOTE_CACHE_STALE_MS", 20_000),
            quote_cache_hard_ms: env_u64("QUOTE_CACHE_HARD_MS", 120_000),
            deribit_env: std::env::var("DERIBIT_ENV").unwrap_or_else(|_| "testnet".to_string()),
            deribit_paper: env_flag("DERIBIT_PAPER", true),
            deribit_client_id: std::env::var("DERIBIT_CLIENT_ID").ok(),
            deribit_client_secret: std::env::var("DERIBIT_CLIENT_SECRET").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_funded_levels_accept_string_numerics() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"levels":[{{"name":"Pro (Bronze)","deposit_usdc":"500","funding_usdc":2500,
                "points_target":100,"profit_target_usdc":"250.0","drawdown_limit_pct":"0.2",
                "fixed_price_usdc":10,"expiry_days":7,"renew_window_minutes":"15"}}]}}"#
        )
        .unwrap();
        let tiers = load_funded_levels(f.path()).unwrap();
        let tier = &tiers["Pro (Bronze)"];
        assert_eq!(tier.funding.fmt_2dp(), "2500.00");
        assert_eq!(tier.drawdown_limit_pct, 0.2);
        assert_eq!(tier.renew_window_minutes, Some(15));
    }

    #[test]
    fn test_funded_levels_reject_bad_drawdown() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"levels":[{{"name":"X","deposit_usdc":1,"funding_usdc":1,
                "profit_target_usdc":1,"drawdown_limit_pct":1.5,"fixed_price_usdc":1}}]}}"#
        )
        .unwrap();
        assert!(load_funded_levels(f.path()).is_err());
    }

    #[test]
    fn test_leverage_buckets() {
        let mut controls = RiskControls::default();
        controls
            .fee_leverage_multipliers_by_x
            .extend([("2".to_string(), 1.0), ("5".to_string(), 1.4), ("10".to_string(), 2.0)]);
        assert_eq!(controls.leverage_multiplier(1.0), 1.0);
        assert_eq!(controls.leverage_multiplier(2.0), 1.0);
        assert_eq!(controls.leverage_multiplier(7.0), 1.4);
        assert_eq!(controls.leverage_multiplier(25.0), 2.0);
    }

    #[test]
    fn test_day_indexed_thresholds() {
        let mut controls = RiskControls::default();
        controls.max_spread_pct = 0.25;
        controls
            .max_spread_pct_by_days
            .insert("1".to_string(), 0.4);
        assert_eq!(controls.max_spread_pct_for(1), 0.4);
        assert_eq!(controls.max_spread_pct_for(7), 0.25);
    }

    #[test]
    fn test_accounts_loader_caches_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_accounts.json");
        std::fs::write(&path, r#"{"accounts":[]}"#).unwrap();
        let loader = AccountsLoader::new(path.clone());
        let first = loader.load();
        assert!(first.accounts.is_empty());
        // Unchanged mtime serves the same snapshot.
        let second = loader.load();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
