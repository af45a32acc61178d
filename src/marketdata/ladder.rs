//! Put-ladder WebSocket cache.
//!
//! Maintains one WS connection to the primary options venue and subscribes
//! to a small grid of put tickers: tenor_days in {1,2,3,5,7} crossed with
//! floor_pct in {0.12,0.16,0.20}. The grid is recomputed periodically from
//! the live listing and spot; when it drifts the subscription set follows.
//! Snapshot reads reduce the fresh ticks to `baseIv = median`,
//! `hedgeIv = max`, requiring at least three fresh values; a recent stale
//! snapshot is served when the feed thins out, and per-leg USD marks carry
//! a conservative price buffer.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{Asset, IvSnapshot, OptionType};
use crate::venues::{InstrumentKind, VenueConnector};

const TENOR_DAYS: [f64; 5] = [1.0, 2.0, 3.0, 5.0, 7.0];
const FLOOR_PCTS: [f64; 3] = [0.12, 0.16, 0.20];

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REGRID_INTERVAL: Duration = Duration::from_secs(60);
const MIN_FRESH_LEGS: usize = 3;

const LIVE_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";
const TESTNET_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";

#[derive(Debug, Clone)]
struct GridLeg {
    instrument: String,
    tenor_days: f64,
    floor_pct: f64,
    strike: f64,
}

#[derive(Debug, Clone)]
struct LadderTick {
    tenor_days: f64,
    floor_pct: f64,
    strike: f64,
    /// Fractional IV (ladder feeds are normalized on ingest).
    iv: f64,
    ask: f64,
    mark: f64,
    index_price: f64,
    updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct LadderSnapshotLeg {
    pub instrument: String,
    pub tenor_days: f64,
    pub floor_pct: f64,
    pub strike: f64,
    pub iv: f64,
    /// ask-preferred mark, spot-converted, buffered conservative.
    pub mark_price_usd: f64,
}

#[derive(Debug, Clone)]
pub struct LadderSnapshot {
    pub base_iv: f64,
    pub hedge_iv: f64,
    pub legs: Vec<LadderSnapshotLeg>,
    pub taken_at_ms: i64,
}

pub struct PutLadderCache {
    ticks: RwLock<HashMap<String, LadderTick>>,
    last_snapshot: RwLock<Option<LadderSnapshot>>,
    max_age_ms: i64,
    max_snapshot_age_ms: i64,
    price_buffer_pct: f64,
    ws_url: &'static str,
}

impl PutLadderCache {
    pub fn new(max_age_ms: i64, max_snapshot_age_ms: i64, price_buffer_pct: f64, env: &str) -> Arc<Self> {
        Arc::new(Self {
            ticks: RwLock::new(HashMap::new()),
            last_snapshot: RwLock::new(None),
            max_age_ms: max_age_ms.max(1),
            max_snapshot_age_ms: max_snapshot_age_ms.max(1),
            price_buffer_pct,
            ws_url: if env.eq_ignore_ascii_case("live") {
                LIVE_WS_URL
            } else {
                TESTNET_WS_URL
            },
        })
    }

    /// Spawn the WS worker; the returned handle is read-only for callers.
    pub fn spawn(self: &Arc<Self>, connector: Arc<dyn VenueConnector>, asset: Asset) {
        let cache = self.clone();
        tokio::spawn(async move {
            cache.run(connector, asset).await;
        });
    }

    async fn run(self: Arc<Self>, connector: Arc<dyn VenueConnector>, asset: Asset) {
        loop {
            let grid = match compute_grid(connector.as_ref(), asset).await {
                Ok(grid) if !grid.is_empty() => grid,
                Ok(_) => {
                    warn!("put ladder grid empty; retrying");
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "put ladder grid computation failed");
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if let Err(e) = self
                .connect_and_stream(connector.as_ref(), asset, grid)
                .await
            {
                warn!(error = %e, "put ladder WS disconnected; reconnecting");
            }
            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_stream(
        &self,
        connector: &dyn VenueConnector,
        asset: Asset,
        mut grid: Vec<GridLeg>,
    ) -> anyhow::Result<()> {
        info!(url = self.ws_url, legs = grid.len(), "connecting put ladder WS");
        let (ws_stream, _) = connect_async(self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let channels: Vec<String> = grid
            .iter()
            .map(|leg| format!("ticker.{}.100ms", leg.instrument))
            .collect();
        write
            .send(Message::Text(subscribe_msg(&channels)))
            .await?;

        let mut by_instrument: HashMap<String, GridLeg> = grid
            .iter()
            .map(|leg| (leg.instrument.clone(), leg.clone()))
            .collect();

        let mut regrid = interval(REGRID_INTERVAL);
        regrid.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        regrid.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = regrid.tick() => {
                    match compute_grid(connector, asset).await {
                        Ok(next) if !next.is_empty() => {
                            let current: HashSet<&str> =
                                grid.iter().map(|l| l.instrument.as_str()).collect();
                            let wanted: HashSet<&str> =
                                next.iter().map(|l| l.instrument.as_str()).collect();
                            if current != wanted {
                                let unsub: Vec<String> = grid
                                    .iter()
                                    .filter(|l| !wanted.contains(l.instrument.as_str()))
                                    .map(|l| format!("ticker.{}.100ms", l.instrument))
                                    .collect();
                                let sub: Vec<String> = next
                                    .iter()
                                    .filter(|l| !current.contains(l.instrument.as_str()))
                                    .map(|l| format!("ticker.{}.100ms", l.instrument))
                                    .collect();
                                info!(add = sub.len(), drop = unsub.len(), "put ladder grid drifted");
                                if !unsub.is_empty() {
                                    let _ = write.send(Message::Text(unsubscribe_msg(&unsub))).await;
                                }
                                if !sub.is_empty() {
                                    write.send(Message::Text(subscribe_msg(&sub))).await?;
                                }
                                by_instrument = next
                                    .iter()
                                    .map(|leg| (leg.instrument.clone(), leg.clone()))
                                    .collect();
                                grid = next;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "grid refresh failed; keeping subscriptions"),
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        anyhow::bail!("put ladder ws stream ended");
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => self.handle_text(&text, &by_instrument),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "put ladder ws close frame");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => anyhow::bail!("put ladder ws error: {e}"),
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str, legs: &HashMap<String, GridLeg>) {
        #[derive(Deserialize)]
        struct WsEnvelope {
            params: Option<WsParams>,
        }
        #[derive(Deserialize)]
        struct WsParams {
            channel: String,
            data: WsTickerData,
        }
        #[derive(Deserialize)]
        struct WsTickerData {
            instrument_name: String,
            #[serde(default)]
            mark_iv: Option<f64>,
            #[serde(default)]
            best_ask_price: Option<f64>,
            #[serde(default)]
            mark_price: Option<f64>,
            #[serde(default)]
            index_price: Option<f64>,
            #[serde(default)]
            underlying_price: Option<f64>,
            #[serde(default)]
            timestamp: Option<i64>,
        }

        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return, // subscription acks etc.
        };
        let Some(params) = envelope.params else {
            return;
        };
        if !params.channel.starts_with("ticker.") {
            return;
        }
        let data = params.data;
        let Some(leg) = legs.get(&data.instrument_name) else {
            return;
        };
        let Some(iv_raw) = data.mark_iv.filter(|v| v.is_finite() && *v > 0.0) else {
            return;
        };
        let index_price = data
            .index_price
            .or(data.underlying_price)
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(0.0);

        let tick = LadderTick {
            tenor_days: leg.tenor_days,
            floor_pct: leg.floor_pct,
            strike: leg.strike,
            iv: IvSnapshot::from_raw(iv_raw).scaled,
            ask: data.best_ask_price.unwrap_or(0.0),
            mark: data.mark_price.unwrap_or(0.0),
            index_price,
            updated_at_ms: data
                .timestamp
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        };
        self.ticks.write().insert(data.instrument_name, tick);
    }

    /// Reduce fresh ticks to a snapshot; fall back to the previous snapshot
    /// when the feed is thin, then to `None`.
    pub fn snapshot(&self) -> Option<LadderSnapshot> {
        let now_ms = Utc::now().timestamp_millis();
        let fresh: Vec<(String, LadderTick)> = self
            .ticks
            .read()
            .iter()
            .filter(|(_, t)| now_ms - t.updated_at_ms <= self.max_age_ms)
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();

        if let Some(snapshot) = reduce_ticks(&fresh, self.price_buffer_pct, now_ms) {
            *self.last_snapshot.write() = Some(snapshot.clone());
            return Some(snapshot);
        }

        let last = self.last_snapshot.read().clone();
        last.filter(|s| now_ms - s.taken_at_ms <= self.max_snapshot_age_ms)
    }
}

fn subscribe_msg(channels: &[String]) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "public/subscribe",
        "params": { "channels": channels },
    })
    .to_string()
}

fn unsubscribe_msg(channels: &[String]) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "public/unsubscribe",
        "params": { "channels": channels },
    })
    .to_string()
}

/// Map the (tenor, floor) grid onto listed puts: per cell, the closest
/// listed expiry to `now + tenor`, then the strike closest to
/// `spot * (1 - floor)` within it.
async fn compute_grid(
    connector: &dyn VenueConnector,
    asset: Asset,
) -> anyhow::Result<Vec<GridLeg>> {
    let spot = connector.get_index_price(asset).await?;
    let instruments = connector.list_instruments(asset).await?;
    let now = Utc::now();

    let puts: Vec<_> = instruments
        .iter()
        .filter(|i| {
            i.kind == InstrumentKind::Option
                && i.option_type == Some(OptionType::Put)
                && i.expiry.map(|e| e > now).unwrap_or(false)
                && i.strike.is_some()
        })
        .collect();

    let mut grid = Vec::with_capacity(TENOR_DAYS.len() * FLOOR_PCTS.len());
    let mut seen = HashSet::new();
    for tenor in TENOR_DAYS {
        let target = now + chrono::Duration::seconds((tenor * 86_400.0) as i64);
        let Some(expiry) = puts
            .iter()
            .filter_map(|i| i.expiry)
            .min_by_key(|e| (*e - target).num_seconds().abs())
        else {
            continue;
        };
        for floor in FLOOR_PCTS {
            let floor_price = spot * (1.0 - floor);
            let Some(pick) = puts
                .iter()
                .filter(|i| i.expiry == Some(expiry))
                .min_by(|a, b| {
                    let da = (a.strike.unwrap() - floor_price).abs();
                    let db = (b.strike.unwrap() - floor_price).abs();
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
            else {
                continue;
            };
            if seen.insert(pick.name.clone()) {
                grid.push(GridLeg {
                    instrument: pick.name.clone(),
                    tenor_days: tenor,
                    floor_pct: floor,
                    strike: pick.strike.unwrap(),
                });
            }
        }
    }
    Ok(grid)
}

fn reduce_ticks(
    fresh: &[(String, LadderTick)],
    price_buffer_pct: f64,
    now_ms: i64,
) -> Option<LadderSnapshot> {
    if fresh.len() < MIN_FRESH_LEGS {
        return None;
    }

    let mut ivs: Vec<f64> = fresh.iter().map(|(_, t)| t.iv).collect();
    ivs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let base_iv = if ivs.len() % 2 == 1 {
        ivs[ivs.len() / 2]
    } else {
        (ivs[ivs.len() / 2 - 1] + ivs[ivs.len() / 2]) / 2.0
    };
    let hedge_iv = *ivs.last()?;

    let legs = fresh
        .iter()
        .map(|(instrument, t)| {
            // Prefer the ask; it is what a hedge actually costs.
            let unit = if t.ask > 0.0 { t.ask } else { t.mark };
            LadderSnapshotLeg {
                instrument: instrument.clone(),
                tenor_days: t.tenor_days,
                floor_pct: t.floor_pct,
                strike: t.strike,
                iv: t.iv,
                mark_price_usd: unit * t.index_price * (1.0 + price_buffer_pct),
            }
        })
        .collect();

    Some(LadderSnapshot {
        base_iv,
        hedge_iv,
        legs,
        taken_at_ms: now_ms,
    })
}

/// Build a snapshot directly, for offline fee/CTC computation and tests.
pub fn snapshot_from_legs(base_iv: f64, hedge_iv: f64, legs: Vec<LadderSnapshotLeg>) -> LadderSnapshot {
    LadderSnapshot {
        base_iv,
        hedge_iv,
        legs,
        taken_at_ms: Utc::now().timestamp_millis(),
    }
}
