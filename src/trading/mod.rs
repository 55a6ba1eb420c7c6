//! Trading logic: exit strategies, presets, sizing and risk gating.

mod config;
mod position_sizer;
pub mod presets;
mod risk;
mod strategy;

pub use config::{ResetPolicy, RiskConfig};
pub use position_sizer::{PositionSizer, SizingMethod};
pub use risk::{RiskManager, RiskState};
pub use strategy::{full_exit, Decision, StrategyConfig, StrategyEngine, Tier};
