//! Quote stack: fee engine, CTC replication floor, survival check, the
//! quote state machine and its three-tier cache.

pub mod cache;
pub mod ctc;
pub mod engine;
pub mod fees;
pub mod survival;

pub use cache::{CacheLookup, QuoteCache};
pub use engine::{MarketView, QuoteMachine, QuoteOutcome, QuoteParams};
