//! Venue connector abstraction.
//!
//! Every execution venue exposes the same capability set; the registry maps
//! a venue name to a connector and is the only place allowed to place
//! orders. Market-data failures are the caller's problem to degrade on;
//! placing against an unknown venue is a hard `missing_executor` error.

pub mod bybit;
pub mod deribit;
pub mod instrument;
pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::models::{Asset, OptionType, OrderSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Option,
    Perpetual,
}

/// A listed instrument as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub name: String,
    pub asset: Asset,
    pub kind: InstrumentKind,
    pub expiry: Option<DateTime<Utc>>,
    pub strike: Option<f64>,
    pub option_type: Option<OptionType>,
    /// Base-asset units per contract.
    pub contract_size: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub instrument: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub mark_price: f64,
    /// Percent-ish on Deribit, fractional elsewhere; normalize via IvSnapshot.
    pub mark_iv: Option<f64>,
    pub index_price: Option<f64>,
    pub funding_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Price-sorted order book: bids descending, asks ascending. Option books
/// quote in base-asset units; perp books quote in USD.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl VenueBook {
    pub fn sort(&mut self) {
        self.bids.sort_by(|a, b| {
            b.price
                .partial_cmp(&a.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.asks.sort_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub instrument: String,
    pub size: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub amount: f64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub venue: String,
    pub filled_size: f64,
    pub avg_price: f64,
}

/// Uniform capability set over N venues.
#[async_trait]
pub trait VenueConnector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_instruments(&self, asset: Asset) -> Result<Vec<InstrumentInfo>>;

    async fn get_ticker(&self, instrument: &str) -> Result<Ticker>;

    async fn get_order_book(&self, instrument: &str) -> Result<VenueBook>;

    async fn get_index_price(&self, asset: Asset) -> Result<f64>;

    async fn get_positions(&self, asset: Asset) -> Result<Vec<VenuePosition>>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck>;
}

/// Name -> connector map. Stateless beyond construction.
#[derive(Clone, Default)]
pub struct VenueRegistry {
    venues: HashMap<String, Arc<dyn VenueConnector>>,
}

impl VenueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn VenueConnector>) {
        self.venues
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VenueConnector>> {
        self.venues.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.venues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute one order on a named venue. The only boundary that converts
    /// connector failures into tagged engine errors.
    pub async fn place_order(&self, venue: &str, req: &OrderRequest) -> EngineResult<OrderAck> {
        let connector = self
            .venues
            .get(venue)
            .ok_or_else(|| EngineError::MissingExecutor(venue.to_string()))?;
        connector
            .place_order(req)
            .await
            .map_err(|e| EngineError::RequestFailed(e.to_string()))
    }
}
