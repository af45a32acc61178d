//! Engine error kinds.
//!
//! The HTTP boundary never surfaces exception types; every failure maps to
//! one of these tagged kinds and a human-readable message. Infra code below
//! the boundary uses `anyhow` and is converted here at the seam.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported asset: {0}")]
    UnsupportedAsset(String),

    #[error("leverage {leverage} outside [1, {max}]")]
    InvalidLeverage { leverage: f64, max: f64 },

    #[error("no executable quote: {0}")]
    NoQuote(String),

    #[error("premium exceeds floor: {0}")]
    PremiumFloor(String),

    #[error("no option liquidity, perp fallback required")]
    PerpFallback,

    #[error("quote expired")]
    QuoteExpired,

    #[error("quote drifted from current market")]
    QuoteDrift,

    #[error("unknown quote id: {0}")]
    QuoteUnknown(String),

    #[error("no executor registered for venue {0}")]
    MissingExecutor(String),

    #[error("close blocked: drawdown buffer is positive")]
    DrawdownBufferPositive,

    #[error("missing drawdown inputs: {0}")]
    MissingDrawdownInputs(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl EngineError {
    /// Wire `kind` tag, a closed set.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidPayload(_) => "invalid_payload",
            EngineError::UnsupportedAsset(_) => "unsupported_asset",
            EngineError::InvalidLeverage { .. } => "invalid_leverage",
            EngineError::NoQuote(_) => "no_quote",
            EngineError::PremiumFloor(_) => "premium_floor",
            EngineError::PerpFallback => "perp_fallback",
            EngineError::QuoteExpired => "quote_expired",
            EngineError::QuoteDrift => "quote_drift",
            EngineError::QuoteUnknown(_) => "quote_unknown",
            EngineError::MissingExecutor(_) => "missing_executor",
            EngineError::DrawdownBufferPositive => "drawdown_buffer_positive",
            EngineError::MissingDrawdownInputs(_) => "missing_drawdown_inputs",
            EngineError::RequestFailed(_) => "request_failed",
            EngineError::Timeout(_) => "timeout",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            status: "error",
            kind: self.kind(),
            reason: self.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub kind: &'static str,
    pub reason: String,
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(
            EngineError::MissingExecutor("okx".into()).kind(),
            "missing_executor"
        );
        assert_eq!(
            EngineError::DrawdownBufferPositive.kind(),
            "drawdown_buffer_positive"
        );
        assert_eq!(EngineError::PerpFallback.kind(), "perp_fallback");
    }
}
