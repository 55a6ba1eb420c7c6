//! Risk configuration: sizing, position limits and circuit breaker.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

use super::SizingMethod;

/// When a tripped circuit breaker clears on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Only an explicit resume clears the breaker
    Manual,
    /// The next UTC day boundary also clears it
    DailyBoundary,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Trip when the day's realized loss reaches this fraction of the baseline
    pub daily_loss_limit_pct: Decimal,

    /// Trip after this many losing outcomes in a row
    pub consecutive_loss_limit: u32,

    pub reset_policy: ResetPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_loss_limit_pct: dec!(0.05), // 5% of baseline per day
            consecutive_loss_limit: 5,
            reset_policy: ResetPolicy::DailyBoundary,
        }
    }
}

/// Configuration for risk gating and position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Assumed account size in native units (no live balance lookup)
    pub account_baseline: Decimal,

    /// How each buy is sized
    pub sizing: SizingMethod,

    /// Maximum number of open or partially closed positions
    pub max_open_positions: usize,

    /// Maximum total exposure as a fraction of the baseline
    pub max_portfolio_heat: Option<Decimal>,

    /// Force exit positions held longer than this
    pub max_hold_hours: Option<i64>,

    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_baseline: dec!(5),
            sizing: SizingMethod::default(),
            max_open_positions: 10,
            max_portfolio_heat: Some(dec!(0.10)), // 10% of baseline at risk
            max_hold_hours: Some(72),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.account_baseline <= Decimal::ZERO {
            return Err(EngineError::Configuration(format!(
                "account_baseline must be positive, got {}",
                self.account_baseline
            )));
        }
        if self.max_open_positions == 0 {
            return Err(EngineError::Configuration(
                "max_open_positions must be at least 1".to_string(),
            ));
        }
        if let Some(heat) = self.max_portfolio_heat {
            if heat <= Decimal::ZERO || heat > Decimal::ONE {
                return Err(EngineError::Configuration(format!(
                    "max_portfolio_heat must be in (0, 1], got {}",
                    heat
                )));
            }
        }
        if let Some(hours) = self.max_hold_hours {
            if hours <= 0 {
                return Err(EngineError::Configuration(format!(
                    "max_hold_hours must be positive, got {}",
                    hours
                )));
            }
        }

        let cb = &self.circuit_breaker;
        if cb.daily_loss_limit_pct <= Decimal::ZERO || cb.daily_loss_limit_pct > Decimal::ONE {
            return Err(EngineError::Configuration(format!(
                "daily_loss_limit_pct must be in (0, 1], got {}",
                cb.daily_loss_limit_pct
            )));
        }
        if cb.consecutive_loss_limit == 0 {
            return Err(EngineError::Configuration(
                "consecutive_loss_limit must be at least 1".to_string(),
            ));
        }

        self.sizing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        RiskConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_limits() {
        let config = RiskConfig {
            max_open_positions: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));

        let config = RiskConfig {
            max_portfolio_heat: Some(dec!(1.5)),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = RiskConfig::default();
        config.circuit_breaker.consecutive_loss_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RiskConfig =
            serde_json::from_str(r#"{"max_open_positions": 3, "max_hold_hours": null}"#).unwrap();
        assert_eq!(config.max_open_positions, 3);
        assert_eq!(config.max_hold_hours, None);
        assert_eq!(config.circuit_breaker.consecutive_loss_limit, 5);
    }
}
