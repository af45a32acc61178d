//! Paper execution wrapper.
//!
//! Delegates all market data to the wrapped connector and simulates fills
//! against its live order book, so the whole control plane runs unchanged
//! with `DERIBIT_PAPER=1`. Rejection reasons are part of the contract: the
//! net-exposure planner retries on `paper_rejected/no_top_of_book` and
//! `paper_rejected/insufficient_liquidity` and stops on anything else.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use super::{
    BookLevel, InstrumentInfo, OrderAck, OrderRequest, OrderType, Ticker, VenueBook,
    VenueConnector, VenuePosition,
};
use crate::models::{Asset, OrderSide};

pub const REJECT_NO_TOP_OF_BOOK: &str = "paper_rejected/no_top_of_book";
pub const REJECT_INSUFFICIENT_LIQUIDITY: &str = "paper_rejected/insufficient_liquidity";

pub struct PaperVenue {
    inner: Arc<dyn VenueConnector>,
    positions: Mutex<HashMap<String, VenuePosition>>,
    order_seq: AtomicU64,
}

impl PaperVenue {
    pub fn wrap(inner: Arc<dyn VenueConnector>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            positions: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(1),
        })
    }

    /// Walk the taker side of the book until `amount` is filled.
    fn fill_against(book: &VenueBook, side: OrderSide, amount: f64) -> Result<(f64, f64)> {
        let levels: &[BookLevel] = match side {
            OrderSide::Buy => &book.asks,
            OrderSide::Sell => &book.bids,
        };
        if levels.is_empty() {
            return Err(anyhow!(REJECT_NO_TOP_OF_BOOK));
        }

        let mut remaining = amount;
        let mut cost = 0.0;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(level.size);
            cost += take * level.price;
            remaining -= take;
        }
        if remaining > 1e-9 {
            return Err(anyhow!(REJECT_INSUFFICIENT_LIQUIDITY));
        }
        Ok((amount, cost / amount))
    }

    fn record_fill(&self, instrument: &str, side: OrderSide, size: f64, price: f64) {
        let mut positions = self.positions.lock();
        let entry = positions
            .entry(instrument.to_string())
            .or_insert_with(|| VenuePosition {
                instrument: instrument.to_string(),
                size: 0.0,
                avg_price: 0.0,
            });
        let signed = match side {
            OrderSide::Buy => size,
            OrderSide::Sell => -size,
        };
        let new_size = entry.size + signed;
        if entry.size == 0.0 || entry.size.signum() == signed.signum() {
            let total = entry.avg_price * entry.size.abs() + price * size;
            entry.avg_price = if new_size.abs() > 1e-12 {
                total / (entry.size.abs() + size)
            } else {
                0.0
            };
        } else if new_size.abs() < 1e-12 {
            entry.avg_price = 0.0;
        } else if new_size.signum() != entry.size.signum() {
            // Flipped through flat: the residual opens at the fill price.
            entry.avg_price = price;
        }
        entry.size = new_size;
        if entry.size.abs() < 1e-12 {
            positions.remove(instrument);
        }
    }
}

#[async_trait]
impl VenueConnector for PaperVenue {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn list_instruments(&self, asset: Asset) -> Result<Vec<InstrumentInfo>> {
        self.inner.list_instruments(asset).await
    }

    async fn get_ticker(&self, instrument: &str) -> Result<Ticker> {
        self.inner.get_ticker(instrument).await
    }

    async fn get_order_book(&self, instrument: &str) -> Result<VenueBook> {
        self.inner.get_order_book(instrument).await
    }

    async fn get_index_price(&self, asset: Asset) -> Result<f64> {
        self.inner.get_index_price(asset).await
    }

    async fn get_positions(&self, _asset: Asset) -> Result<Vec<VenuePosition>> {
        Ok(self.positions.lock().values().cloned().collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let book = self.inner.get_order_book(&req.instrument).await?;
        let (filled, avg_price) = match req.order_type {
            OrderType::Market => Self::fill_against(&book, req.side, req.amount)?,
            OrderType::Limit => {
                // Paper limits fill only when immediately marketable.
                let (filled, avg) = Self::fill_against(&book, req.side, req.amount)?;
                match (req.side, req.price) {
                    (OrderSide::Buy, Some(limit)) if avg > limit => {
                        return Err(anyhow!(REJECT_INSUFFICIENT_LIQUIDITY));
                    }
                    (OrderSide::Sell, Some(limit)) if avg < limit => {
                        return Err(anyhow!(REJECT_INSUFFICIENT_LIQUIDITY));
                    }
                    _ => (filled, avg),
                }
            }
        };

        self.record_fill(&req.instrument, req.side, filled, avg_price);
        let order_id = format!(
            "paper-{}-{}",
            self.inner.name(),
            self.order_seq.fetch_add(1, Ordering::Relaxed)
        );
        info!(
            venue = self.inner.name(),
            instrument = %req.instrument,
            side = req.side.as_str(),
            size = filled,
            price = avg_price,
            "paper fill"
        );
        Ok(OrderAck {
            order_id,
            venue: self.inner.name().to_string(),
            filled_size: filled,
            avg_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> VenueBook {
        VenueBook {
            bids: vec![
                BookLevel {
                    price: 0.020,
                    size: 2.0,
                },
                BookLevel {
                    price: 0.018,
                    size: 5.0,
                },
            ],
            asks: vec![
                BookLevel {
                    price: 0.022,
                    size: 1.0,
                },
                BookLevel {
                    price: 0.025,
                    size: 4.0,
                },
            ],
        }
    }

    #[test]
    fn test_fill_walks_levels() {
        let (filled, avg) = PaperVenue::fill_against(&book(), OrderSide::Buy, 2.0).unwrap();
        assert_eq!(filled, 2.0);
        // 1.0 @ 0.022 + 1.0 @ 0.025
        assert!((avg - 0.0235).abs() < 1e-9);
    }

    #[test]
    fn test_fill_rejects_empty_side() {
        let empty = VenueBook::default();
        let err = PaperVenue::fill_against(&empty, OrderSide::Buy, 1.0).unwrap_err();
        assert_eq!(err.to_string(), REJECT_NO_TOP_OF_BOOK);
    }

    #[test]
    fn test_fill_rejects_thin_book() {
        let err = PaperVenue::fill_against(&book(), OrderSide::Buy, 100.0).unwrap_err();
        assert_eq!(err.to_string(), REJECT_INSUFFICIENT_LIQUIDITY);
    }
}
