//! Outbound notification events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{ExitReason, TradeAction};

/// Emitted on every state transition, rejection and failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PositionOpened {
        asset: String,
        symbol: String,
        signal_id: String,
        amount: Decimal,
        tx_id: String,
    },
    PositionReduced {
        asset: String,
        percentage: Decimal,
        multiplier: Decimal,
        sold_percentage: Decimal,
        reason: ExitReason,
        tx_id: Option<String>,
    },
    PositionClosed {
        asset: String,
        reason: String,
        realized_pnl: Decimal,
    },
    CircuitBreakerTripped {
        reason: String,
        at: DateTime<Utc>,
    },
    CircuitBreakerCleared,
    Rejected {
        asset: String,
        action: TradeAction,
        reason: String,
    },
    TradeFailed {
        asset: String,
        action: TradeAction,
        reason: String,
        attempts: u32,
    },
}

impl EngineEvent {
    pub fn asset(&self) -> Option<&str> {
        match self {
            EngineEvent::PositionOpened { asset, .. }
            | EngineEvent::PositionReduced { asset, .. }
            | EngineEvent::PositionClosed { asset, .. }
            | EngineEvent::Rejected { asset, .. }
            | EngineEvent::TradeFailed { asset, .. } => Some(asset),
            EngineEvent::CircuitBreakerTripped { .. } | EngineEvent::CircuitBreakerCleared => None,
        }
    }
}

impl std::fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::PositionOpened {
                asset,
                symbol,
                amount,
                tx_id,
                ..
            } => write!(f, "OPENED {} ({}) for {} [{}]", symbol, asset, amount, tx_id),
            EngineEvent::PositionReduced {
                asset,
                percentage,
                multiplier,
                sold_percentage,
                reason,
                ..
            } => write!(
                f,
                "SOLD {}% of {} at {}x ({}), {}% sold",
                percentage, asset, multiplier, reason, sold_percentage
            ),
            EngineEvent::PositionClosed {
                asset,
                reason,
                realized_pnl,
            } => write!(f, "CLOSED {} ({}), realized {:+}", asset, reason, realized_pnl),
            EngineEvent::CircuitBreakerTripped { reason, .. } => {
                write!(f, "CIRCUIT BREAKER TRIPPED: {}", reason)
            }
            EngineEvent::CircuitBreakerCleared => write!(f, "CIRCUIT BREAKER CLEARED"),
            EngineEvent::Rejected {
                asset,
                action,
                reason,
            } => write!(f, "REJECTED {} {}: {}", action, asset, reason),
            EngineEvent::TradeFailed {
                asset,
                action,
                reason,
                attempts,
            } => write!(
                f,
                "FAILED {} {} after {} attempt(s): {}",
                action, asset, attempts, reason
            ),
        }
    }
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<EngineEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        debug!(event = %event, "Engine event");
        let _ = self.tx.send(event);
    }
}
