//! Quote cache: fresh / stale / hard TTL tiers with single-flight compute.
//!
//! Keys are the JSON of normalized quote inputs. `preview` serves fresh
//! immediately, serves stale while kicking one async refresh, and answers
//! `pending` when cold; `quote` serves fresh else computes synchronously.
//! Concurrent computes for one key share a single future's outcome.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::Quote;

#[derive(Debug)]
pub enum CacheLookup {
    /// Within the fresh TTL: serve as-is.
    Fresh(Arc<Quote>),
    /// Usable but aging: serve and refresh in the background.
    Stale(Arc<Quote>),
    Miss,
}

struct Entry {
    quote: Arc<Quote>,
    computed_at: Instant,
}

type SharedResult = Result<Arc<Quote>, String>;

pub struct QuoteCache {
    ttl: Duration,
    stale: Duration,
    hard: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    inflight: Mutex<HashMap<String, broadcast::Sender<SharedResult>>>,
}

impl QuoteCache {
    pub fn new(ttl_ms: u64, stale_ms: u64, hard_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            ttl: Duration::from_millis(ttl_ms.max(1)),
            stale: Duration::from_millis(stale_ms.max(1)),
            hard: Duration::from_millis(hard_ms.max(1)),
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Classify a key. Entries beyond the hard window are evicted here.
    pub fn lookup(&self, key: &str) -> CacheLookup {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return CacheLookup::Miss;
        };
        let age = entry.computed_at.elapsed();
        if age <= self.ttl {
            CacheLookup::Fresh(entry.quote.clone())
        } else if age <= self.hard.max(self.stale) {
            // stale-usable through the hard window; refresh responsibility
            // is the caller's
            CacheLookup::Stale(entry.quote.clone())
        } else {
            entries.remove(key);
            CacheLookup::Miss
        }
    }

    pub fn insert(&self, key: &str, quote: Arc<Quote>) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                quote,
                computed_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Whether a compute/refresh for this key is already running.
    pub fn is_inflight(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    /// Run `compute` unless another caller already is; everyone awaiting the
    /// key observes the same outcome. Successful quotes land in the cache.
    pub async fn compute_single_flight<F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> EngineResult<Arc<Quote>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Quote>>,
    {
        let existing_rx = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = existing_rx {
            debug!(key, "joining in-flight quote compute");
            return match rx.recv().await {
                Ok(Ok(quote)) => Ok(quote),
                Ok(Err(msg)) => Err(EngineError::RequestFailed(msg)),
                Err(_) => Err(EngineError::RequestFailed(
                    "quote compute abandoned".to_string(),
                )),
            };
        }

        // If this future is dropped (caller timeout), the in-flight entry
        // must go with it or later callers would wait on a dead sender.
        let mut guard = InflightGuard {
            cache: self,
            key: key.to_string(),
            armed: true,
        };

        let result = compute().await;
        let shared: SharedResult = match &result {
            Ok(quote) => {
                let arc = Arc::new(quote.clone());
                self.insert(key, arc.clone());
                Ok(arc)
            }
            Err(e) => Err(e.to_string()),
        };

        guard.armed = false;
        if let Some(tx) = self.inflight.lock().remove(key) {
            let _ = tx.send(shared.clone());
        }

        match shared {
            Ok(arc) => Ok(arc),
            Err(_) => Err(result.expect_err("error branch")),
        }
    }
}

struct InflightGuard<'a> {
    cache: &'a QuoteCache,
    key: String,
    armed: bool,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            // Dropping the sender wakes every joined caller with Closed.
            self.cache.inflight.lock().remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuoteStatus;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quote(id: &str) -> Quote {
        Quote {
            quote_id: id.to_string(),
            expires_at: Utc::now(),
            instrument: "BTC-07AUG26-42000-P".into(),
            strike: Some(42_000.0),
            option_type: Some(crate::models::OptionType::Put),
            premium_per_unit_usdc: crate::money::Usd::ZERO,
            premium_total_usdc: crate::money::Usd::ZERO,
            hedge_size: 0.1,
            roll_multiplier: 1,
            all_in_premium_usdc: crate::money::Usd::ZERO,
            fee_usdc: crate::money::Usd::ZERO,
            fee_regime: None,
            subsidy_usdc: crate::money::Usd::ZERO,
            status: QuoteStatus::Ok,
            reason: String::new(),
            execution_plan: Vec::new(),
            survival_check: None,
            selection_snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_then_stale_then_evicted() {
        let cache = QuoteCache::new(10, 40, 60);
        cache.insert("k", Arc::new(quote("q1")));
        assert!(matches!(cache.lookup("k"), CacheLookup::Fresh(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(cache.lookup("k"), CacheLookup::Stale(_)));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(cache.lookup("k"), CacheLookup::Miss));
    }

    #[tokio::test]
    async fn test_single_flight_runs_compute_once() {
        let cache = QuoteCache::new(4_000, 20_000, 120_000);
        let computes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let computes = computes.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .compute_single_flight("key", || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(quote("shared"))
                    })
                    .await
            }));
        }

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().quote_id.clone());
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| id == "shared"));
        assert!(matches!(cache.lookup("key"), CacheLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn test_single_flight_shares_errors() {
        let cache = QuoteCache::new(4_000, 20_000, 120_000);
        let second_computes = Arc::new(AtomicUsize::new(0));

        let first = cache.clone();
        let join = tokio::spawn(async move {
            first
                .compute_single_flight("key", || async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err(EngineError::NoQuote("books empty".to_string()))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let counter = second_computes.clone();
        let second = cache
            .compute_single_flight("key", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(quote("never"))
            })
            .await;
        assert!(second.is_err());
        assert!(join.await.unwrap().is_err());
        // The joining caller shared the first future's failure.
        assert_eq!(second_computes.load(Ordering::SeqCst), 0);
        assert!(matches!(cache.lookup("key"), CacheLookup::Miss));
    }
}
