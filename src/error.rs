//! Error taxonomy for the engine.

use std::path::PathBuf;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::TradeAction;

/// Every error the engine can surface.
///
/// Only [`EngineError::Configuration`] and [`EngineError::StateCorruption`] are
/// fatal, and only at startup. Everything else is reported and recovered by the
/// orchestrator loop.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Position already open for asset {asset}")]
    DuplicatePosition { asset: String },

    #[error("Signal {signal_id} already belongs to {asset}")]
    DuplicateSignal { signal_id: String, asset: String },

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position for asset {asset} is already closed")]
    PositionClosed { asset: String },

    #[error("Over-sell on {asset}: requested {requested}% but only {available}% remains")]
    OverSell {
        asset: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Invalid sell on {asset}: {reason}")]
    InvalidSell { asset: String, reason: String },

    #[error("Tier {tier} already triggered for {asset}")]
    TierAlreadyTriggered { asset: String, tier: String },

    #[error("{action} for {asset} failed after {attempts} attempt(s): {reason}")]
    TradeExecution {
        action: TradeAction,
        asset: String,
        attempts: u32,
        reason: String,
    },

    #[error("State file {path} is corrupted: {reason}")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("Failed to persist state: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_) | EngineError::StateCorruption { .. }
        )
    }

    /// A snapshot write failed after memory was already updated.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            EngineError::Persistence(_) | EngineError::Serialization(_)
        )
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        EngineError::StateCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
