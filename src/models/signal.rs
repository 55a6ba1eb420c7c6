//! Normalized inbound events from the signal source.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade sent to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buy signal detected upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuySignal {
    pub asset_address: String,

    #[serde(default)]
    pub symbol: String,

    /// Correlation id later referenced by profit observations
    pub signal_id: String,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl BuySignal {
    pub fn new(
        asset_address: impl Into<String>,
        symbol: impl Into<String>,
        signal_id: impl Into<String>,
    ) -> Self {
        Self {
            asset_address: asset_address.into(),
            symbol: symbol.into(),
            signal_id: signal_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A multiplier observed for the asset behind `signal_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitObservation {
    pub signal_id: String,

    /// Current value / entry value (1.0 = breakeven)
    pub multiplier: Decimal,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ProfitObservation {
    pub fn new(signal_id: impl Into<String>, multiplier: Decimal) -> Self {
        Self {
            signal_id: signal_id.into(),
            multiplier,
            timestamp: Utc::now(),
        }
    }
}

/// Any event the engine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEvent {
    BuySignal(BuySignal),
    ProfitObservation(ProfitObservation),
}
