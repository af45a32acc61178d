//! Market-data caches: ATM implied vol and the put-ladder WebSocket feed.

pub mod atm_iv;
pub mod ladder;

pub use atm_iv::AtmIvCache;
pub use ladder::{LadderSnapshot, LadderSnapshotLeg, PutLadderCache};
