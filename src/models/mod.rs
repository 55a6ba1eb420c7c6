//! Data models for positions and inbound signal events.

mod position;
mod signal;

pub use position::{ExitReason, Position, PositionStatus, SellEvent, SellRequest};
pub use signal::{BuySignal, ProfitObservation, SignalEvent, TradeAction};
