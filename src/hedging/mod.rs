//! Hedging: rolling buffer decisions, hedge lots, platform net exposure.

pub mod lots;
pub mod net_exposure;
pub mod rolling;

pub use lots::{HedgeLot, HedgeLotBook};
pub use net_exposure::{NetExposurePlanner, PLATFORM_COVERAGE_ID};
