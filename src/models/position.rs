//! Position model: one per traded asset, from confirmed buy to full exit.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Lifecycle status of a position. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::PartiallyClosed => "partially_closed",
            PositionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a sell (or a close) happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TrailingStop,
    TargetHit,
    StopLoss,
    Tier,
    MaxHoldTime,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TargetHit => "target_hit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::Tier => "tier",
            ExitReason::MaxHoldTime => "max_hold_time",
            ExitReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed sell, as handed to the store.
#[derive(Debug, Clone)]
pub struct SellRequest {
    /// Percentage of the original position sold (0-100]
    pub percentage: Decimal,

    /// Multiplier at which the sell was executed
    pub multiplier: Decimal,

    /// Estimated proceeds in native units
    pub proceeds: Decimal,

    pub reason: ExitReason,

    /// Tier identifier for tiered exits; recorded so the tier fires once
    pub tier_key: Option<String>,

    /// Executor transaction id
    pub tx_id: Option<String>,
}

/// Historical record of one sell on a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellEvent {
    pub at: DateTime<Utc>,
    pub percentage: Decimal,
    pub multiplier: Decimal,
    pub proceeds: Decimal,
    pub realized_pnl: Decimal,
    pub reason: ExitReason,
    #[serde(default)]
    pub tier_key: Option<String>,
    #[serde(default)]
    pub tx_id: Option<String>,
}

/// Our holding in a single asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Asset address (unique key)
    pub asset_address: String,

    /// Ticker symbol for display
    #[serde(default)]
    pub symbol: String,

    /// When the buy was confirmed
    pub opened_at: DateTime<Utc>,

    /// Initial buy size in native units
    pub buy_amount: Decimal,

    /// Id of the signal that opened this position
    pub signal_id: String,

    pub status: PositionStatus,

    /// Cumulative percentage of the original size already sold (0-100)
    #[serde(default)]
    pub sold_percentage: Decimal,

    #[serde(default)]
    pub sells: Vec<SellEvent>,

    /// Highest multiplier observed since open (never decreases)
    pub peak_multiplier: Decimal,

    /// Most recent multiplier observed
    pub last_multiplier: Decimal,

    /// Tiers that have already fired
    #[serde(default)]
    pub triggered_tiers: BTreeSet<String>,

    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub close_reason: Option<String>,
}

impl Position {
    /// Create a freshly opened position at breakeven.
    pub fn new(
        asset_address: impl Into<String>,
        symbol: impl Into<String>,
        signal_id: impl Into<String>,
        buy_amount: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            asset_address: asset_address.into(),
            symbol: symbol.into(),
            opened_at,
            buy_amount,
            signal_id: signal_id.into(),
            status: PositionStatus::Open,
            sold_percentage: Decimal::ZERO,
            sells: Vec::new(),
            peak_multiplier: Decimal::ONE,
            last_multiplier: Decimal::ONE,
            triggered_tiers: BTreeSet::new(),
            closed_at: None,
            close_reason: None,
        }
    }

    /// Open or partially closed.
    pub fn is_active(&self) -> bool {
        self.status != PositionStatus::Closed
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    /// Percentage of the original size still held.
    pub fn remaining_percentage(&self) -> Decimal {
        (dec!(100) - self.sold_percentage).max(Decimal::ZERO)
    }

    /// Native units still committed to this position.
    pub fn exposure(&self) -> Decimal {
        if self.is_closed() {
            return Decimal::ZERO;
        }
        self.buy_amount * self.remaining_percentage() / dec!(100)
    }

    /// Estimated value of the remaining holding at the last multiplier.
    pub fn estimated_value(&self) -> Decimal {
        self.exposure() * self.last_multiplier
    }

    /// Total realized P&L over all sells.
    pub fn realized_pnl(&self) -> Decimal {
        self.sells.iter().map(|s| s.realized_pnl).sum()
    }

    /// Hours held as of `now`.
    pub fn holding_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_hours()
    }

    /// Record a multiplier observation. The peak only ever goes up.
    pub fn observe(&mut self, multiplier: Decimal) {
        self.last_multiplier = multiplier;
        if multiplier > self.peak_multiplier {
            self.peak_multiplier = multiplier;
        }
    }

    /// Apply a confirmed sell, enforcing the over-sell and tier-once invariants.
    pub fn record_sell(&mut self, sell: SellRequest, at: DateTime<Utc>) -> Result<SellEvent> {
        if self.is_closed() {
            return Err(EngineError::PositionClosed {
                asset: self.asset_address.clone(),
            });
        }
        if sell.percentage <= Decimal::ZERO {
            return Err(EngineError::InvalidSell {
                asset: self.asset_address.clone(),
                reason: format!("percentage must be positive, got {}", sell.percentage),
            });
        }
        let available = self.remaining_percentage();
        if sell.percentage > available {
            return Err(EngineError::OverSell {
                asset: self.asset_address.clone(),
                requested: sell.percentage,
                available,
            });
        }
        if let Some(tier) = &sell.tier_key {
            if self.triggered_tiers.contains(tier) {
                return Err(EngineError::TierAlreadyTriggered {
                    asset: self.asset_address.clone(),
                    tier: tier.clone(),
                });
            }
            self.triggered_tiers.insert(tier.clone());
        }

        let fraction = sell.percentage / dec!(100);
        let realized_pnl = self.buy_amount * fraction * (sell.multiplier - Decimal::ONE);

        self.sold_percentage += sell.percentage;
        if self.sold_percentage >= dec!(100) {
            self.sold_percentage = dec!(100);
            self.status = PositionStatus::Closed;
            self.closed_at = Some(at);
            self.close_reason = Some(sell.reason.as_str().to_string());
        } else {
            self.status = PositionStatus::PartiallyClosed;
        }

        let event = SellEvent {
            at,
            percentage: sell.percentage,
            multiplier: sell.multiplier,
            proceeds: sell.proceeds,
            realized_pnl,
            reason: sell.reason,
            tier_key: sell.tier_key,
            tx_id: sell.tx_id,
        };
        self.sells.push(event.clone());

        Ok(event)
    }

    /// Force the position closed regardless of how much was sold.
    pub fn force_close(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.closed_at = Some(at);
        self.close_reason = Some(reason.into());
    }
}
