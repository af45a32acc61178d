//! Bybit connector (v5 public market data).
//!
//! Bybit contributes order books and tickers to quote aggregation. Order
//! placement on Bybit requires the signed private API, which this control
//! plane does not carry; live execution routes to Deribit, and paper mode
//! wraps this connector so split legs still fill in simulation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{
    instrument::parse_instrument, BookLevel, InstrumentInfo, InstrumentKind, OrderAck,
    OrderRequest, Ticker, VenueBook, VenueConnector, VenuePosition,
};
use crate::models::Asset;
use crate::venues::instrument::ParsedInstrument;

const BYBIT_BASE: &str = "https://api.bybit.com";

pub struct BybitConnector {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct V5Response<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<T>,
}

impl<T> V5Response<T> {
    fn into_result(self, what: &str) -> Result<T> {
        if self.ret_code != 0 {
            return Err(anyhow!("bybit {what}: [{}] {}", self.ret_code, self.ret_msg));
        }
        self.result.ok_or_else(|| anyhow!("bybit {what}: empty result"))
    }
}

#[derive(Debug, Deserialize)]
struct V5List<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BybitInstrument {
    symbol: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    symbol: String,
    #[serde(default)]
    bid1_price: Option<String>,
    #[serde(default)]
    ask1_price: Option<String>,
    #[serde(default)]
    mark_price: Option<String>,
    #[serde(default)]
    mark_iv: Option<String>,
    #[serde(default)]
    index_price: Option<String>,
    #[serde(default)]
    funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BybitBook {
    #[serde(default)]
    b: Vec<(String, String)>,
    #[serde(default)]
    a: Vec<(String, String)>,
}

fn parse_price(s: &Option<String>) -> Option<f64> {
    s.as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p > 0.0)
}

impl BybitConnector {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build bybit http client")?;
        Ok(Self { client })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{BYBIT_BASE}{path}");
        let resp: V5Response<T> = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("bybit GET {path}"))?
            .json()
            .await
            .with_context(|| format!("bybit parse {path}"))?;
        resp.into_result(path)
    }

    fn perp_symbol(asset: Asset) -> String {
        format!("{}USDT", asset.as_str())
    }
}

#[async_trait]
impl VenueConnector for BybitConnector {
    fn name(&self) -> &'static str {
        "bybit"
    }

    async fn list_instruments(&self, asset: Asset) -> Result<Vec<InstrumentInfo>> {
        let raw: V5List<BybitInstrument> = self
            .get(
                "/v5/market/instruments-info",
                &[
                    ("category", "option".to_string()),
                    ("baseCoin", asset.as_str().to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;

        let mut out: Vec<InstrumentInfo> = raw
            .list
            .into_iter()
            .filter(|i| i.status.as_deref().map(|s| s == "Trading").unwrap_or(true))
            .filter_map(|i| {
                let parsed = parse_instrument(&i.symbol)?;
                match parsed {
                    ParsedInstrument::Option {
                        asset,
                        expiry,
                        strike,
                        option_type,
                    } => Some(InstrumentInfo {
                        name: i.symbol,
                        asset,
                        kind: InstrumentKind::Option,
                        expiry: Some(expiry),
                        strike: Some(strike),
                        option_type: Some(option_type),
                        contract_size: 1.0,
                    }),
                    ParsedInstrument::Perpetual { .. } => None,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn get_ticker(&self, instrument: &str) -> Result<Ticker> {
        let category = if instrument.ends_with("USDT") {
            "linear"
        } else {
            "option"
        };
        let raw: V5List<BybitTicker> = self
            .get(
                "/v5/market/tickers",
                &[
                    ("category", category.to_string()),
                    ("symbol", instrument.to_string()),
                ],
            )
            .await?;
        let t = raw
            .list
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("bybit ticker {instrument}: not found"))?;
        Ok(Ticker {
            instrument: t.symbol,
            best_bid: parse_price(&t.bid1_price),
            best_ask: parse_price(&t.ask1_price),
            mark_price: parse_price(&t.mark_price).unwrap_or(0.0),
            mark_iv: t.mark_iv.as_deref().and_then(|v| v.parse::<f64>().ok()),
            index_price: parse_price(&t.index_price),
            funding_rate: t.funding_rate.as_deref().and_then(|v| v.parse::<f64>().ok()),
        })
    }

    async fn get_order_book(&self, instrument: &str) -> Result<VenueBook> {
        let raw: BybitBook = self
            .get(
                "/v5/market/orderbook",
                &[
                    ("category", "option".to_string()),
                    ("symbol", instrument.to_string()),
                    ("limit", "25".to_string()),
                ],
            )
            .await?;
        let parse_level = |(price, size): (String, String)| -> Option<BookLevel> {
            Some(BookLevel {
                price: price.parse().ok()?,
                size: size.parse().ok()?,
            })
        };
        let mut book = VenueBook {
            bids: raw.b.into_iter().filter_map(parse_level).collect(),
            asks: raw.a.into_iter().filter_map(parse_level).collect(),
        };
        book.sort();
        Ok(book)
    }

    async fn get_index_price(&self, asset: Asset) -> Result<f64> {
        let ticker = self.get_ticker(&Self::perp_symbol(asset)).await?;
        ticker
            .index_price
            .or(Some(ticker.mark_price).filter(|p| *p > 0.0))
            .ok_or_else(|| anyhow!("bybit index price unavailable"))
    }

    async fn get_positions(&self, _asset: Asset) -> Result<Vec<VenuePosition>> {
        // Data-only venue: no private session, so no positions to report.
        Ok(Vec::new())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        Err(anyhow!(
            "bybit execution is not wired ({} {}); route execution to deribit or run paper mode",
            req.side.as_str(),
            req.instrument
        ))
    }
}
