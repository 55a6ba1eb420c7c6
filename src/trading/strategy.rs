//! Take-profit strategies and the exit decision function.
//!
//! Three mutually exclusive exit algorithms:
//! - Trailing stop: full exit once the multiplier retraces a fixed fraction from its peak
//! - Fixed: full exit at a target multiplier, optional full exit at a stop-loss multiplier
//! - Tiered: partial exits at increasing multipliers, each tier fires at most once

use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{ExitReason, Position};

/// One step of a tiered exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Multiplier at which this tier fires
    pub trigger_multiplier: Decimal,

    /// Percentage of the original position to sell (0-100]
    pub sell_pct: Decimal,
}

impl Tier {
    pub fn new(trigger_multiplier: Decimal, sell_pct: Decimal) -> Self {
        Self {
            trigger_multiplier,
            sell_pct,
        }
    }

    /// Stable identifier recorded on the position once the tier fires, e.g. `2x`.
    pub fn key(&self) -> String {
        format!("{}x", self.trigger_multiplier.normalize())
    }
}

/// Active exit strategy. Immutable; swapped as a whole at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Trailing {
        /// Retrace from peak that triggers the exit (0.15 = 15%)
        stop_pct: Decimal,
    },
    Fixed {
        target_multiplier: Decimal,
        #[serde(default)]
        stop_loss_multiplier: Option<Decimal>,
    },
    Tiered {
        tiers: Vec<Tier>,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::Trailing {
            stop_pct: dec!(0.15),
        }
    }
}

impl StrategyConfig {
    /// Reject configurations the decision function cannot honor.
    pub fn validate(&self) -> Result<()> {
        match self {
            StrategyConfig::Trailing { stop_pct } => {
                if *stop_pct <= Decimal::ZERO || *stop_pct >= Decimal::ONE {
                    return Err(EngineError::Configuration(format!(
                        "trailing stop_pct must be in (0, 1), got {}",
                        stop_pct
                    )));
                }
            }
            StrategyConfig::Fixed {
                target_multiplier,
                stop_loss_multiplier,
            } => {
                if *target_multiplier <= Decimal::ZERO {
                    return Err(EngineError::Configuration(format!(
                        "target_multiplier must be positive, got {}",
                        target_multiplier
                    )));
                }
                if let Some(stop) = stop_loss_multiplier {
                    if *stop <= Decimal::ZERO || stop >= target_multiplier {
                        return Err(EngineError::Configuration(format!(
                            "stop_loss_multiplier {} must be positive and below target {}",
                            stop, target_multiplier
                        )));
                    }
                }
            }
            StrategyConfig::Tiered { tiers } => {
                if tiers.is_empty() {
                    return Err(EngineError::Configuration(
                        "tiered strategy needs at least one tier".to_string(),
                    ));
                }
                let mut total = Decimal::ZERO;
                let mut previous: Option<Decimal> = None;
                for tier in tiers {
                    if tier.trigger_multiplier <= Decimal::ZERO {
                        return Err(EngineError::Configuration(format!(
                            "tier trigger must be positive, got {}",
                            tier.trigger_multiplier
                        )));
                    }
                    if let Some(prev) = previous {
                        if tier.trigger_multiplier <= prev {
                            return Err(EngineError::Configuration(format!(
                                "tier triggers must be strictly increasing ({} after {})",
                                tier.trigger_multiplier, prev
                            )));
                        }
                    }
                    if tier.sell_pct <= Decimal::ZERO || tier.sell_pct > dec!(100) {
                        return Err(EngineError::Configuration(format!(
                            "tier sell_pct must be in (0, 100], got {}",
                            tier.sell_pct
                        )));
                    }
                    total += tier.sell_pct;
                    previous = Some(tier.trigger_multiplier);
                }
                if total > dec!(100) {
                    return Err(EngineError::Configuration(format!(
                        "tier percentages sum to {}, more than 100",
                        total
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StrategyConfig::Trailing { .. } => "trailing",
            StrategyConfig::Fixed { .. } => "fixed",
            StrategyConfig::Tiered { .. } => "tiered",
        }
    }
}

impl std::fmt::Display for StrategyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyConfig::Trailing { stop_pct } => {
                write!(f, "Trailing stop {}% from peak", (*stop_pct * dec!(100)).normalize())
            }
            StrategyConfig::Fixed {
                target_multiplier,
                stop_loss_multiplier,
            } => {
                write!(f, "Sell 100% at {}x", target_multiplier.normalize())?;
                if let Some(stop) = stop_loss_multiplier {
                    write!(f, ", stop-loss at {}x", stop.normalize())?;
                }
                Ok(())
            }
            StrategyConfig::Tiered { tiers } => {
                let parts: Vec<String> = tiers
                    .iter()
                    .map(|t| format!("{}% at {}", t.sell_pct.normalize(), t.key()))
                    .collect();
                write!(f, "Tiered: {}", parts.join(", "))
            }
        }
    }
}

/// Outcome of evaluating a position against a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Hold,
    Sell {
        /// Percentage of the original position to sell, already clamped
        percentage: Decimal,
        reason: ExitReason,
        tier_key: Option<String>,
    },
}

/// Decide whether to sell. Pure: reads the position, never mutates it.
///
/// The peak must already include the latest observation.
pub fn evaluate(position: &Position, config: &StrategyConfig) -> Decision {
    if position.is_closed() {
        return Decision::Hold;
    }

    let last = position.last_multiplier;
    let peak = position.peak_multiplier;

    match config {
        StrategyConfig::Trailing { stop_pct } => {
            let stop_level = peak * (Decimal::ONE - *stop_pct);
            if last <= stop_level {
                info!(
                    asset = %position.asset_address,
                    last = %last,
                    peak = %peak,
                    stop_level = %stop_level,
                    "Trailing stop triggered"
                );
                return clamp_sell(position, dec!(100), ExitReason::TrailingStop, None);
            }
            Decision::Hold
        }
        StrategyConfig::Fixed {
            target_multiplier,
            stop_loss_multiplier,
        } => {
            if last >= *target_multiplier {
                info!(
                    asset = %position.asset_address,
                    last = %last,
                    target = %target_multiplier,
                    "Target hit"
                );
                return clamp_sell(position, dec!(100), ExitReason::TargetHit, None);
            }
            if let Some(stop) = stop_loss_multiplier {
                if last <= *stop {
                    info!(
                        asset = %position.asset_address,
                        last = %last,
                        stop = %stop,
                        "Stop loss triggered"
                    );
                    return clamp_sell(position, dec!(100), ExitReason::StopLoss, None);
                }
            }
            Decision::Hold
        }
        StrategyConfig::Tiered { tiers } => {
            let next = tiers.iter().find(|tier| {
                tier.trigger_multiplier <= last && !position.triggered_tiers.contains(&tier.key())
            });
            match next {
                Some(tier) => {
                    info!(
                        asset = %position.asset_address,
                        last = %last,
                        tier = %tier.key(),
                        sell_pct = %tier.sell_pct,
                        "Tier reached"
                    );
                    clamp_sell(position, tier.sell_pct, ExitReason::Tier, Some(tier.key()))
                }
                None => Decision::Hold,
            }
        }
    }
}

/// Force a full exit of whatever remains, bypassing the strategy.
pub fn full_exit(position: &Position, reason: ExitReason) -> Decision {
    if position.is_closed() {
        return Decision::Hold;
    }
    clamp_sell(position, dec!(100), reason, None)
}

fn clamp_sell(
    position: &Position,
    requested: Decimal,
    reason: ExitReason,
    tier_key: Option<String>,
) -> Decision {
    let percentage = requested.min(position.remaining_percentage());
    if percentage <= Decimal::ZERO {
        debug!(
            asset = %position.asset_address,
            reason = %reason,
            requested = %requested,
            "Sell clamped to zero, holding"
        );
        return Decision::Hold;
    }
    Decision::Sell {
        percentage,
        reason,
        tier_key,
    }
}

/// Holder of the active strategy, replaced by pointer swap.
pub struct StrategyEngine {
    active: RwLock<Arc<StrategyConfig>>,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            active: RwLock::new(Arc::new(config)),
        })
    }

    /// Snapshot of the active strategy. In-flight evaluations keep their own copy.
    pub fn current(&self) -> Arc<StrategyConfig> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Validate and swap in a new strategy.
    pub fn replace(&self, config: StrategyConfig) -> Result<()> {
        config.validate()?;
        info!(strategy = %config, "Active strategy replaced");
        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = Arc::new(config);
        Ok(())
    }

    pub fn evaluate(&self, position: &Position) -> Decision {
        let config = self.current();
        evaluate(position, &config)
    }
}
