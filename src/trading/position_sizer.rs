//! Position sizing: fixed amount or risk-based fraction of the baseline.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Position sizing method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SizingMethod {
    /// Same amount for every buy
    Fixed { amount: Decimal },
    /// Fraction of the account baseline, clamped to [min_size, max_size]
    RiskBased {
        risk_per_trade: Decimal,
        min_size: Decimal,
        max_size: Decimal,
    },
}

impl Default for SizingMethod {
    fn default() -> Self {
        SizingMethod::Fixed { amount: dec!(0.1) }
    }
}

impl SizingMethod {
    pub fn validate(&self) -> Result<()> {
        match self {
            SizingMethod::Fixed { amount } => {
                if *amount <= Decimal::ZERO {
                    return Err(EngineError::Configuration(format!(
                        "fixed sizing amount must be positive, got {}",
                        amount
                    )));
                }
            }
            SizingMethod::RiskBased {
                risk_per_trade,
                min_size,
                max_size,
            } => {
                if *risk_per_trade <= Decimal::ZERO || *risk_per_trade > Decimal::ONE {
                    return Err(EngineError::Configuration(format!(
                        "risk_per_trade must be in (0, 1], got {}",
                        risk_per_trade
                    )));
                }
                if *min_size <= Decimal::ZERO || min_size > max_size {
                    return Err(EngineError::Configuration(format!(
                        "invalid size bounds [{}, {}]",
                        min_size, max_size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Calculator for buy sizes.
pub struct PositionSizer {
    method: SizingMethod,
    account_baseline: Decimal,
}

impl PositionSizer {
    pub fn new(method: SizingMethod, account_baseline: Decimal) -> Self {
        Self {
            method,
            account_baseline,
        }
    }

    /// Calculate the buy amount in native units.
    pub fn calculate_size(&self) -> Decimal {
        match &self.method {
            SizingMethod::Fixed { amount } => *amount,
            SizingMethod::RiskBased {
                risk_per_trade,
                min_size,
                max_size,
            } => self.apply_constraints(
                self.account_baseline * *risk_per_trade,
                *min_size,
                *max_size,
            ),
        }
    }

    fn apply_constraints(&self, size: Decimal, min_size: Decimal, max_size: Decimal) -> Decimal {
        size.max(min_size).min(max_size)
    }
}
