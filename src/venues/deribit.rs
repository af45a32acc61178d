//! Deribit connector.
//!
//! Public market data plus client-credentials auth for order placement.
//! Option prices are quoted in base-asset units; callers normalize to USDC
//! with spot. `DERIBIT_ENV` picks testnet vs live.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{
    instrument::parse_instrument, BookLevel, InstrumentInfo, InstrumentKind, OrderAck,
    OrderRequest, OrderType, Ticker, VenueBook, VenueConnector, VenuePosition,
};
use crate::models::{Asset, OrderSide};
use crate::venues::instrument::ParsedInstrument;

const LIVE_BASE: &str = "https://www.deribit.com/api/v2";
const TESTNET_BASE: &str = "https://test.deribit.com/api/v2";
/// Refresh the token a minute before Deribit would expire it.
const TOKEN_SLACK: Duration = Duration::from_secs(60);

pub struct DeribitConnector {
    client: reqwest::Client,
    base_url: &'static str,
    client_id: Option<String>,
    client_secret: Option<String>,
    token: Mutex<Option<(Instant, String)>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl<T> RpcResponse<T> {
    fn into_result(self, what: &str) -> Result<T> {
        if let Some(err) = self.error {
            return Err(anyhow!("deribit {what}: [{}] {}", err.code, err.message));
        }
        self.result
            .ok_or_else(|| anyhow!("deribit {what}: empty result"))
    }
}

#[derive(Debug, Deserialize)]
struct DeribitInstrument {
    instrument_name: String,
    kind: String,
    #[serde(default)]
    strike: Option<f64>,
    #[serde(default)]
    expiration_timestamp: Option<i64>,
    #[serde(default)]
    contract_size: Option<f64>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct DeribitTicker {
    instrument_name: String,
    #[serde(default)]
    best_bid_price: Option<f64>,
    #[serde(default)]
    best_ask_price: Option<f64>,
    mark_price: f64,
    #[serde(default)]
    mark_iv: Option<f64>,
    #[serde(default)]
    index_price: Option<f64>,
    #[serde(default)]
    underlying_price: Option<f64>,
    #[serde(default)]
    current_funding: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DeribitBook {
    #[serde(default)]
    bids: Vec<(f64, f64)>,
    #[serde(default)]
    asks: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct DeribitIndex {
    index_price: f64,
}

#[derive(Debug, Deserialize)]
struct DeribitAuth {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DeribitPosition {
    instrument_name: String,
    #[serde(default)]
    size: f64,
    #[serde(default)]
    average_price: f64,
}

#[derive(Debug, Deserialize)]
struct DeribitOrderResult {
    order: DeribitOrder,
}

#[derive(Debug, Deserialize)]
struct DeribitOrder {
    order_id: String,
    #[serde(default)]
    filled_amount: Option<f64>,
    #[serde(default)]
    average_price: Option<f64>,
}

impl DeribitConnector {
    pub fn new(
        env: &str,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build deribit http client")?;
        let base_url = if env.eq_ignore_ascii_case("live") {
            LIVE_BASE
        } else {
            TESTNET_BASE
        };
        Ok(Self {
            client,
            base_url,
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    async fn get_public<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/public/{}", self.base_url, method);
        let resp: RpcResponse<T> = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("deribit GET {method}"))?
            .json()
            .await
            .with_context(|| format!("deribit parse {method}"))?;
        resp.into_result(method)
    }

    async fn get_private<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.access_token().await?;
        let url = format!("{}/private/{}", self.base_url, method);
        let resp: RpcResponse<T> = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .with_context(|| format!("deribit GET {method}"))?
            .json()
            .await
            .with_context(|| format!("deribit parse {method}"))?;
        resp.into_result(method)
    }

    async fn access_token(&self) -> Result<String> {
        if let Some((expires_at, token)) = self.token.lock().clone() {
            if Instant::now() < expires_at {
                return Ok(token);
            }
        }

        let (id, secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => return Err(anyhow!("deribit credentials not configured")),
        };

        let auth: DeribitAuth = self
            .get_public(
                "auth",
                &[
                    ("grant_type", "client_credentials".to_string()),
                    ("client_id", id),
                    ("client_secret", secret),
                ],
            )
            .await?;

        let ttl = Duration::from_secs(auth.expires_in).saturating_sub(TOKEN_SLACK);
        *self.token.lock() = Some((Instant::now() + ttl, auth.access_token.clone()));
        debug!("deribit access token refreshed");
        Ok(auth.access_token)
    }

    fn index_name(asset: Asset) -> &'static str {
        match asset {
            Asset::Btc => "btc_usd",
        }
    }

    fn map_instrument(raw: DeribitInstrument) -> Option<InstrumentInfo> {
        if raw.is_active == Some(false) {
            return None;
        }
        let parsed = parse_instrument(&raw.instrument_name)?;
        let kind = match (&parsed, raw.kind.as_str()) {
            (ParsedInstrument::Option { .. }, "option") => InstrumentKind::Option,
            (ParsedInstrument::Perpetual { .. }, _) => InstrumentKind::Perpetual,
            _ => return None,
        };
        let (strike, option_type) = match parsed {
            ParsedInstrument::Option {
                strike,
                option_type,
                ..
            } => (Some(strike), Some(option_type)),
            ParsedInstrument::Perpetual { .. } => (None, None),
        };
        // Prefer the venue's expiration over the name decode when present.
        let expiry = raw
            .expiration_timestamp
            .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
            .or_else(|| parsed.expiry());
        Some(InstrumentInfo {
            name: raw.instrument_name,
            asset: parsed.asset(),
            kind,
            expiry,
            strike: strike.or(raw.strike),
            option_type,
            contract_size: raw.contract_size.unwrap_or(1.0),
        })
    }
}

#[async_trait]
impl VenueConnector for DeribitConnector {
    fn name(&self) -> &'static str {
        "deribit"
    }

    async fn list_instruments(&self, asset: Asset) -> Result<Vec<InstrumentInfo>> {
        let currency = asset.as_str().to_string();
        let options: Vec<DeribitInstrument> = self
            .get_public(
                "get_instruments",
                &[
                    ("currency", currency.clone()),
                    ("kind", "option".to_string()),
                    ("expired", "false".to_string()),
                ],
            )
            .await?;
        let futures: Vec<DeribitInstrument> = self
            .get_public(
                "get_instruments",
                &[
                    ("currency", currency),
                    ("kind", "future".to_string()),
                    ("expired", "false".to_string()),
                ],
            )
            .await
            .unwrap_or_default();

        let mut out: Vec<InstrumentInfo> = options
            .into_iter()
            .chain(futures)
            .filter_map(Self::map_instrument)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_ticker(&self, instrument: &str) -> Result<Ticker> {
        let raw: DeribitTicker = self
            .get_public("ticker", &[("instrument_name", instrument.to_string())])
            .await?;
        Ok(Ticker {
            instrument: raw.instrument_name,
            best_bid: raw.best_bid_price.filter(|p| *p > 0.0),
            best_ask: raw.best_ask_price.filter(|p| *p > 0.0),
            mark_price: raw.mark_price,
            mark_iv: raw.mark_iv,
            index_price: raw.index_price.or(raw.underlying_price),
            funding_rate: raw.current_funding,
        })
    }

    async fn get_order_book(&self, instrument: &str) -> Result<VenueBook> {
        let raw: DeribitBook = self
            .get_public(
                "get_order_book",
                &[
                    ("instrument_name", instrument.to_string()),
                    ("depth", "25".to_string()),
                ],
            )
            .await?;
        let mut book = VenueBook {
            bids: raw
                .bids
                .into_iter()
                .map(|(price, size)| BookLevel { price, size })
                .collect(),
            asks: raw
                .asks
                .into_iter()
                .map(|(price, size)| BookLevel { price, size })
                .collect(),
        };
        book.sort();
        Ok(book)
    }

    async fn get_index_price(&self, asset: Asset) -> Result<f64> {
        let raw: DeribitIndex = self
            .get_public(
                "get_index_price",
                &[("index_name", Self::index_name(asset).to_string())],
            )
            .await?;
        Ok(raw.index_price)
    }

    async fn get_positions(&self, asset: Asset) -> Result<Vec<VenuePosition>> {
        let raw: Vec<DeribitPosition> = self
            .get_private(
                "get_positions",
                &[("currency", asset.as_str().to_string())],
            )
            .await?;
        Ok(raw
            .into_iter()
            .filter(|p| p.size != 0.0)
            .map(|p| VenuePosition {
                instrument: p.instrument_name,
                size: p.size,
                avg_price: p.average_price,
            })
            .collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let method = match req.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let mut query = vec![
            ("instrument_name", req.instrument.clone()),
            ("amount", format!("{}", req.amount)),
            (
                "type",
                match req.order_type {
                    OrderType::Market => "market".to_string(),
                    OrderType::Limit => "limit".to_string(),
                },
            ),
        ];
        if let (OrderType::Limit, Some(price)) = (req.order_type, req.price) {
            query.push(("price", format!("{}", price)));
        }

        let result: DeribitOrderResult = self.get_private(method, &query).await?;
        if result.order.filled_amount.unwrap_or(0.0) == 0.0 {
            warn!(
                instrument = %req.instrument,
                order_id = %result.order.order_id,
                "deribit order accepted but unfilled"
            );
        }
        Ok(OrderAck {
            order_id: result.order.order_id,
            venue: "deribit".to_string(),
            filled_size: result.order.filled_amount.unwrap_or(req.amount),
            avg_price: result.order.average_price.unwrap_or_default(),
        })
    }
}
