//! Trade execution boundary.
//!
//! The engine never places trades itself; it talks to a [`TradeExecutor`].
//! Calls must either fully apply or not apply at all.

mod dry_run;
mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

pub use dry_run::DryRunExecutor;
pub use retry::{RetryConfig, RetryingExecutor};

/// Confirmation of an executed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeReceipt {
    pub tx_id: String,
    pub executed_at: DateTime<Utc>,
}

impl TradeReceipt {
    pub fn new(tx_id: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            executed_at: Utc::now(),
        }
    }
}

/// Why a single executor call failed.
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    #[error("rejected by executor: {0}")]
    Rejected(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),
}

/// External collaborator that places trades.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    /// Buy `amount` native units of `asset`.
    async fn buy(&self, asset: &str, amount: Decimal) -> Result<TradeReceipt, ExecutorError>;

    /// Sell `percentage` of the original position in `asset`.
    async fn sell(&self, asset: &str, percentage: Decimal) -> Result<TradeReceipt, ExecutorError>;
}
