//! Multi-venue quote aggregation and best-price split routing.
//!
//! Books are fetched per venue, normalized to USDC (option books arrive in
//! base-asset units and are multiplied by spot), merged into a best
//! bid/ask view, and split-routed across the top venues by taker-side
//! price. Gates reject candidates with missing sides, wide spreads, empty
//! fills or excessive slippage; every rejection bumps a diagnostic counter
//! so `put_quote_failed` / `option_exec_failed` payloads explain tuning.

use futures_util::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::models::{ExecutionLeg, OrderSide};
use crate::venues::{VenueBook, VenueRegistry};

/// Per-venue book with prices already in USD.
#[derive(Debug, Clone)]
pub struct NormalizedBook {
    pub venue: String,
    pub book: VenueBook,
}

#[derive(Debug, Clone, Copy)]
pub struct GateThresholds {
    pub max_spread_pct: f64,
    pub max_slippage_pct: f64,
}

/// Rejection counters accumulated across a search.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteDiag {
    pub missing_book: u32,
    pub no_bid_ask: u32,
    pub spread_too_wide: u32,
    pub size_too_small: u32,
    pub slippage_too_high: u32,
    pub budget_too_small: u32,
    pub time_budget_hit: u32,
}

impl QuoteDiag {
    pub fn merge(&mut self, other: &QuoteDiag) {
        self.missing_book += other.missing_book;
        self.no_bid_ask += other.no_bid_ask;
        self.spread_too_wide += other.spread_too_wide;
        self.size_too_small += other.size_too_small;
        self.slippage_too_high += other.slippage_too_high;
        self.budget_too_small += other.budget_too_small;
        self.time_budget_hit += other.time_budget_hit;
    }
}

/// One instrument aggregated across venues, with a split execution plan.
#[derive(Debug, Clone)]
pub struct AggregatedQuote {
    pub instrument: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread_pct: f64,
    /// Taker-side size summed across the routed venues' top of book.
    pub depth: f64,
    pub filled_size: f64,
    pub avg_price: f64,
    pub plan: Vec<ExecutionLeg>,
}

/// Fetch one instrument's book from every registered venue concurrently.
/// Venue failures drop that venue; they never fail the aggregation.
pub async fn fetch_books(
    registry: &VenueRegistry,
    instrument: &str,
    spot: f64,
    is_option: bool,
    timeout: Duration,
    diag: &mut QuoteDiag,
) -> Vec<NormalizedBook> {
    let venues = registry.names();
    let fetches = venues.iter().filter_map(|name| {
        let connector = registry.get(name)?;
        let instrument = instrument.to_string();
        let name = name.clone();
        Some(async move {
            let result =
                tokio::time::timeout(timeout, connector.get_order_book(&instrument)).await;
            (name, result)
        })
    });

    let mut books = Vec::new();
    for (venue, result) in join_all(fetches).await {
        match result {
            Ok(Ok(mut book)) => {
                if is_option {
                    for level in book.bids.iter_mut().chain(book.asks.iter_mut()) {
                        level.price *= spot;
                    }
                }
                if book.bids.is_empty() && book.asks.is_empty() {
                    diag.missing_book += 1;
                    continue;
                }
                books.push(NormalizedBook { venue, book });
            }
            Ok(Err(e)) => {
                debug!(venue = %venue, error = %e, "book fetch failed");
                diag.missing_book += 1;
            }
            Err(_) => {
                debug!(venue = %venue, "book fetch timed out");
                diag.missing_book += 1;
            }
        }
    }
    books
}

/// Best-price split router: sort venues by taker-side top-of-book price,
/// take the top `max_venues`, fill against their top-of-book sizes until
/// `required_size` is satisfied or the venues are exhausted.
pub fn aggregate(
    instrument: &str,
    books: &[NormalizedBook],
    side: OrderSide,
    required_size: f64,
    max_venues: usize,
) -> Option<AggregatedQuote> {
    let best_bid = books
        .iter()
        .filter_map(|b| b.book.best_bid().map(|l| l.price))
        .fold(f64::NAN, f64::max);
    let best_ask = books
        .iter()
        .filter_map(|b| b.book.best_ask().map(|l| l.price))
        .fold(f64::NAN, f64::min);
    if !best_bid.is_finite() || !best_ask.is_finite() || best_ask <= 0.0 {
        return None;
    }

    let mid = (best_bid + best_ask) / 2.0;
    let spread_pct = if mid > 0.0 {
        (best_ask - best_bid) / mid
    } else {
        f64::INFINITY
    };

    // Taker-side top of book per venue, best price first.
    let mut tops: Vec<(&str, f64, f64)> = books
        .iter()
        .filter_map(|b| {
            let level = match side {
                OrderSide::Buy => b.book.best_ask(),
                OrderSide::Sell => b.book.best_bid(),
            }?;
            Some((b.venue.as_str(), level.price, level.size))
        })
        .collect();
    tops.sort_by(|a, b| {
        let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        match side {
            OrderSide::Buy => ord,
            OrderSide::Sell => ord.reverse(),
        }
    });
    tops.truncate(max_venues.max(1));

    let depth: f64 = tops.iter().map(|(_, _, size)| size).sum();

    let mut remaining = required_size;
    let mut plan = Vec::new();
    let mut notional = 0.0;
    for (venue, price, size) in &tops {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(*size);
        if take <= 0.0 {
            continue;
        }
        plan.push(ExecutionLeg {
            venue: venue.to_string(),
            instrument: instrument.to_string(),
            side,
            size: take,
            price: *price,
        });
        notional += take * price;
        remaining -= take;
    }

    let filled_size = required_size - remaining.max(0.0);
    let avg_price = if filled_size > 0.0 {
        notional / filled_size
    } else {
        0.0
    };

    Some(AggregatedQuote {
        instrument: instrument.to_string(),
        best_bid,
        best_ask,
        spread_pct,
        depth,
        filled_size,
        avg_price,
        plan,
    })
}

/// Apply the candidate gates; bumps diagnostics and returns pass/fail.
pub fn passes_gates(
    agg: &AggregatedQuote,
    side: OrderSide,
    _required_size: f64,
    gates: GateThresholds,
    diag: &mut QuoteDiag,
) -> bool {
    if agg.spread_pct > gates.max_spread_pct {
        diag.spread_too_wide += 1;
        return false;
    }
    // Thin fills still pass; partial coverage is resolved downstream.
    if agg.filled_size <= 0.0 {
        diag.size_too_small += 1;
        return false;
    }
    let reference = match side {
        OrderSide::Buy => agg.best_ask,
        OrderSide::Sell => agg.best_bid,
    };
    if reference > 0.0 {
        let slippage = match side {
            OrderSide::Buy => (agg.avg_price - reference) / reference,
            OrderSide::Sell => (reference - agg.avg_price) / reference,
        };
        if slippage > gates.max_slippage_pct {
            diag.slippage_too_high += 1;
            return false;
        }
    }
    true
}
