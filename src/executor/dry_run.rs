//! Executor that confirms every trade without placing it.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use super::{ExecutorError, TradeExecutor, TradeReceipt};

#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub fn new() -> Self {
        Self
    }

    fn receipt() -> TradeReceipt {
        TradeReceipt::new(format!("dry-{}", Uuid::new_v4()))
    }
}

#[async_trait]
impl TradeExecutor for DryRunExecutor {
    async fn buy(&self, asset: &str, amount: Decimal) -> Result<TradeReceipt, ExecutorError> {
        let receipt = Self::receipt();
        info!(asset = %asset, amount = %amount, tx_id = %receipt.tx_id, "[DRY RUN] Would buy");
        Ok(receipt)
    }

    async fn sell(&self, asset: &str, percentage: Decimal) -> Result<TradeReceipt, ExecutorError> {
        let receipt = Self::receipt();
        info!(asset = %asset, percentage = %percentage, tx_id = %receipt.tx_id, "[DRY RUN] Would sell");
        Ok(receipt)
    }
}
