//! Bounded retries with exponential backoff and per-call timeouts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::models::TradeAction;

use super::{ExecutorError, TradeExecutor, TradeReceipt};

/// Retry policy for executor calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Upper bound for a single executor call
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 1.5,
            max_backoff_ms: 10_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(EngineError::Configuration(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.call_timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Wraps an executor with timeouts and bounded retries.
///
/// Never reports success without a receipt from the inner executor.
#[derive(Clone)]
pub struct RetryingExecutor {
    inner: Arc<dyn TradeExecutor>,
    config: RetryConfig,
}

impl RetryingExecutor {
    pub fn new(inner: Arc<dyn TradeExecutor>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub async fn buy(&self, asset: &str, amount: Decimal) -> Result<TradeReceipt> {
        self.execute(TradeAction::Buy, asset, || self.inner.buy(asset, amount))
            .await
    }

    pub async fn sell(&self, asset: &str, percentage: Decimal) -> Result<TradeReceipt> {
        self.execute(TradeAction::Sell, asset, || self.inner.sell(asset, percentage))
            .await
    }

    async fn execute<F, Fut>(&self, action: TradeAction, asset: &str, call: F) -> Result<TradeReceipt>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<TradeReceipt, ExecutorError>>,
    {
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let mut backoff = self.config.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::Timeout(self.config.call_timeout_ms)),
            };

            match outcome {
                Ok(receipt) => {
                    debug!(
                        action = %action,
                        asset = %asset,
                        attempt,
                        tx_id = %receipt.tx_id,
                        "Trade confirmed"
                    );
                    return Ok(receipt);
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    warn!(
                        action = %action,
                        asset = %asset,
                        attempts = attempt,
                        error = %e,
                        "Trade failed, giving up"
                    );
                    return Err(EngineError::TradeExecution {
                        action,
                        asset: asset.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.config.max_backoff_ms));
                    warn!(
                        action = %action,
                        asset = %asset,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Trade attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
