//! ATM implied-vol cache.
//!
//! Keyed by asset with a short TTL. The miss path scans listed options for
//! the nearest expiry, picks the strike closest to spot and reads the
//! venue's mark IV. Any failure serves the configured fallback without
//! poisoning the cache, so the next call retries.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::{Asset, IvSnapshot};
use crate::venues::{InstrumentKind, VenueConnector};

pub struct AtmIvCache {
    connector: Arc<dyn VenueConnector>,
    ttl: Duration,
    fallback: f64,
    cache: RwLock<HashMap<Asset, (Instant, IvSnapshot)>>,
}

impl AtmIvCache {
    pub fn new(connector: Arc<dyn VenueConnector>, ttl_ms: u64, fallback: f64) -> Self {
        Self {
            connector,
            ttl: Duration::from_millis(ttl_ms.max(1)),
            fallback,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn fallback_snapshot(&self) -> IvSnapshot {
        IvSnapshot::from_raw(self.fallback)
    }

    pub async fn get(&self, asset: Asset, spot: f64) -> IvSnapshot {
        if let Some((at, snapshot)) = self.cache.read().get(&asset) {
            if at.elapsed() < self.ttl {
                return *snapshot;
            }
        }

        match self.fetch(asset, spot).await {
            Some(snapshot) => {
                self.cache.write().insert(asset, (Instant::now(), snapshot));
                snapshot
            }
            None => {
                warn!(asset = asset.as_str(), "ATM IV unavailable, serving fallback");
                self.fallback_snapshot()
            }
        }
    }

    async fn fetch(&self, asset: Asset, spot: f64) -> Option<IvSnapshot> {
        let instruments = self.connector.list_instruments(asset).await.ok()?;
        let now = Utc::now();

        // Nearest future expiry, then the strike closest to spot within it.
        let nearest_expiry = instruments
            .iter()
            .filter(|i| i.kind == InstrumentKind::Option)
            .filter_map(|i| i.expiry)
            .filter(|e| *e > now)
            .min()?;

        let atm = instruments
            .iter()
            .filter(|i| i.kind == InstrumentKind::Option && i.expiry == Some(nearest_expiry))
            .filter(|i| i.strike.is_some())
            .min_by(|a, b| {
                let da = (a.strike.unwrap() - spot).abs();
                let db = (b.strike.unwrap() - spot).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })?;

        let ticker = self.connector.get_ticker(&atm.name).await.ok()?;
        let raw = ticker.mark_iv.filter(|iv| iv.is_finite() && *iv > 0.0)?;
        let snapshot = IvSnapshot::from_raw(raw);
        debug!(
            asset = asset.as_str(),
            instrument = %atm.name,
            iv = snapshot.scaled,
            "ATM IV refreshed"
        );
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::{
        InstrumentInfo, OrderAck, OrderRequest, Ticker, VenueBook, VenuePosition,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockVenue {
        instruments: Vec<InstrumentInfo>,
        iv_by_instrument: HashMap<String, f64>,
        ticker_calls: AtomicUsize,
    }

    #[async_trait]
    impl VenueConnector for MockVenue {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn list_instruments(&self, _asset: Asset) -> Result<Vec<InstrumentInfo>> {
            Ok(self.instruments.clone())
        }

        async fn get_ticker(&self, instrument: &str) -> Result<Ticker> {
            self.ticker_calls.fetch_add(1, Ordering::SeqCst);
            let iv = self
                .iv_by_instrument
                .get(instrument)
                .copied()
                .ok_or_else(|| anyhow!("no ticker"))?;
            Ok(Ticker {
                instrument: instrument.to_string(),
                mark_iv: Some(iv),
                mark_price: 0.01,
                ..Default::default()
            })
        }

        async fn get_order_book(&self, _instrument: &str) -> Result<VenueBook> {
            Ok(VenueBook::default())
        }

        async fn get_index_price(&self, _asset: Asset) -> Result<f64> {
            Ok(50_000.0)
        }

        async fn get_positions(&self, _asset: Asset) -> Result<Vec<VenuePosition>> {
            Ok(Vec::new())
        }

        async fn place_order(&self, _req: &OrderRequest) -> Result<OrderAck> {
            Err(anyhow!("not a trading venue"))
        }
    }

    fn option_info(name: &str, days: i64, strike: f64) -> InstrumentInfo {
        InstrumentInfo {
            name: name.to_string(),
            asset: Asset::Btc,
            kind: InstrumentKind::Option,
            expiry: Some(Utc::now() + ChronoDuration::days(days)),
            strike: Some(strike),
            option_type: Some(crate::models::OptionType::Put),
            contract_size: 1.0,
        }
    }

    #[tokio::test]
    async fn test_picks_nearest_expiry_atm_strike() {
        let venue = Arc::new(MockVenue {
            instruments: vec![
                option_info("NEAR-40K", 1, 40_000.0),
                option_info("NEAR-50K", 1, 50_000.0),
                option_info("FAR-50K", 7, 50_000.0),
            ],
            iv_by_instrument: HashMap::from([("NEAR-50K".to_string(), 55.0)]),
            ticker_calls: AtomicUsize::new(0),
        });
        let cache = AtmIvCache::new(venue.clone(), 15_000, 0.5);
        let snapshot = cache.get(Asset::Btc, 50_200.0).await;
        assert!((snapshot.scaled - 0.55).abs() < 1e-9);
        // Second read inside the TTL is served from cache.
        let again = cache.get(Asset::Btc, 50_200.0).await;
        assert!((again.scaled - 0.55).abs() < 1e-9);
        assert_eq!(venue.ticker_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_on_empty_listing() {
        let venue = Arc::new(MockVenue {
            instruments: Vec::new(),
            iv_by_instrument: HashMap::new(),
            ticker_calls: AtomicUsize::new(0),
        });
        let cache = AtmIvCache::new(venue, 15_000, 0.5);
        let snapshot = cache.get(Asset::Btc, 50_000.0).await;
        assert!((snapshot.scaled - 0.5).abs() < 1e-9);
    }
}
