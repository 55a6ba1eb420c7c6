//! Pre-trade risk gating and the loss circuit breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::Position;
use crate::store::PositionStore;

use super::{PositionSizer, ResetPolicy, RiskConfig};

/// Result of a pre-trade check.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryValidation {
    pub allowed: bool,
    pub reason: String,
    pub size: Option<Decimal>,
}

impl EntryValidation {
    pub fn allow(size: Option<Decimal>) -> Self {
        Self {
            allowed: true,
            reason: "Entry conditions met".to_string(),
            size,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            size: None,
        }
    }
}

/// Process-wide risk counters. Lives for the process uptime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskState {
    pub open_positions: usize,
    /// Buys validated but not yet confirmed
    pub pending_entries: usize,
    pub daily_pnl: Decimal,
    pub consecutive_losses: u32,
    pub breaker_tripped: bool,
    pub tripped_at: Option<DateTime<Utc>>,
    pub trip_reason: Option<String>,
    /// UTC day the daily counters belong to
    pub day: NaiveDate,
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Open positions:     {}", self.open_positions)?;
        writeln!(f, "Pending entries:    {}", self.pending_entries)?;
        writeln!(f, "Daily P&L ({}): {:+.4}", self.day, self.daily_pnl)?;
        writeln!(f, "Consecutive losses: {}", self.consecutive_losses)?;
        match (&self.trip_reason, self.tripped_at) {
            (Some(reason), Some(at)) if self.breaker_tripped => {
                write!(f, "Circuit breaker:    TRIPPED at {} ({})", at, reason)
            }
            _ => write!(f, "Circuit breaker:    ok"),
        }
    }
}

#[derive(Debug)]
struct Counters {
    daily_pnl: Decimal,
    consecutive_losses: u32,
    tripped: bool,
    tripped_at: Option<DateTime<Utc>>,
    trip_reason: Option<String>,
    day: NaiveDate,
    /// Sizes reserved for buys still in flight
    pending: HashMap<String, Decimal>,
}

/// Pre-trade gating, sizing and the circuit breaker.
pub struct RiskManager {
    config: RiskConfig,
    sizer: PositionSizer,
    store: Arc<PositionStore>,
    counters: Mutex<Counters>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, store: Arc<PositionStore>) -> Self {
        Self::new_at(config, store, Utc::now())
    }

    pub fn new_at(config: RiskConfig, store: Arc<PositionStore>, now: DateTime<Utc>) -> Self {
        let sizer = PositionSizer::new(config.sizing.clone(), config.account_baseline);
        Self {
            config,
            sizer,
            store,
            counters: Mutex::new(Counters {
                daily_pnl: Decimal::ZERO,
                consecutive_losses: 0,
                tripped: false,
                tripped_at: None,
                trip_reason: None,
                day: now.date_naive(),
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Roll daily counters over at the UTC day boundary.
    fn roll_day(&self, counters: &mut Counters, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today == counters.day {
            return;
        }
        debug!(from = %counters.day, to = %today, "Daily risk counters reset");
        counters.day = today;
        counters.daily_pnl = Decimal::ZERO;

        if counters.tripped && self.config.circuit_breaker.reset_policy == ResetPolicy::DailyBoundary {
            info!(day = %today, "Circuit breaker cleared at daily boundary");
            counters.tripped = false;
            counters.tripped_at = None;
            counters.trip_reason = None;
            counters.consecutive_losses = 0;
        }
    }

    /// Open checks against committed positions plus outstanding reservations.
    fn can_open(&self, counters: &Counters, asset: &str) -> EntryValidation {
        if counters.tripped {
            return EntryValidation::deny(format!(
                "Circuit breaker tripped: {}",
                counters.trip_reason.as_deref().unwrap_or("unknown")
            ));
        }

        if self.store.has_active(asset) {
            return EntryValidation::deny(format!("Position already open for {}", asset));
        }
        if counters.pending.contains_key(asset) {
            return EntryValidation::deny(format!("Buy already in flight for {}", asset));
        }

        let open = self.store.active_count() + counters.pending.len();
        if open >= self.config.max_open_positions {
            return EntryValidation::deny(format!(
                "Too many positions: {} >= {}",
                open, self.config.max_open_positions
            ));
        }

        EntryValidation::allow(None)
    }

    /// Buy size in native units.
    pub fn compute_size(&self) -> Decimal {
        self.sizer.calculate_size()
    }

    /// Reject a buy that would push total exposure over the heat limit.
    fn exposure_allows(&self, counters: &Counters, size: Decimal) -> EntryValidation {
        let Some(max_heat) = self.config.max_portfolio_heat else {
            return EntryValidation::allow(Some(size));
        };

        let reserved: Decimal = counters.pending.values().copied().sum();
        let exposure = self.store.total_exposure() + reserved;
        let heat = (exposure + size) / self.config.account_baseline;
        if heat > max_heat {
            return EntryValidation::deny(format!(
                "Portfolio heat limit: ({} + {}) / {} = {} > {}",
                exposure,
                size,
                self.config.account_baseline,
                heat.round_dp(4),
                max_heat
            ));
        }
        EntryValidation::allow(Some(size))
    }

    /// Full pre-trade gate: open check, sizing, then exposure.
    ///
    /// An allowed entry reserves a slot and its size until `release_entry`
    /// is called, so concurrent buys on other assets see it.
    pub fn validate_entry(&self, asset: &str) -> EntryValidation {
        self.validate_entry_at(asset, Utc::now())
    }

    pub fn validate_entry_at(&self, asset: &str, now: DateTime<Utc>) -> EntryValidation {
        let mut counters = self.lock();
        self.roll_day(&mut counters, now);

        let check = self.can_open(&counters, asset);
        if !check.allowed {
            return check;
        }
        let size = self.compute_size();
        let check = self.exposure_allows(&counters, size);
        if check.allowed {
            counters.pending.insert(asset.to_string(), size);
            debug!(asset = %asset, size = %size, pending = counters.pending.len(), "Entry reserved");
        }
        check
    }

    /// Drop the reservation taken by `validate_entry`, once the buy failed or
    /// the position is in the store.
    pub fn release_entry(&self, asset: &str) {
        if self.lock().pending.remove(asset).is_some() {
            debug!(asset = %asset, "Entry reservation released");
        }
    }

    /// Feed a realized P&L into the breaker.
    ///
    /// A loss increments the consecutive counter, anything else resets it.
    /// Returns the trip reason if this outcome tripped the breaker.
    pub fn record_outcome(&self, realized_pnl: Decimal) -> Option<String> {
        self.record_outcome_at(realized_pnl, Utc::now())
    }

    pub fn record_outcome_at(
        &self,
        realized_pnl: Decimal,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let cb = &self.config.circuit_breaker;
        let mut counters = self.lock();
        self.roll_day(&mut counters, now);

        counters.daily_pnl += realized_pnl;
        if realized_pnl < Decimal::ZERO {
            counters.consecutive_losses += 1;
        } else {
            counters.consecutive_losses = 0;
        }

        debug!(
            pnl = %realized_pnl,
            daily_pnl = %counters.daily_pnl,
            consecutive_losses = counters.consecutive_losses,
            "Outcome recorded"
        );

        if !cb.enabled || counters.tripped {
            return None;
        }

        let daily_limit = self.config.account_baseline * cb.daily_loss_limit_pct;
        let reason = if counters.daily_pnl <= -daily_limit {
            Some(format!(
                "Daily loss {} reached limit {}",
                counters.daily_pnl, daily_limit
            ))
        } else if counters.consecutive_losses >= cb.consecutive_loss_limit {
            Some(format!(
                "{} consecutive losses reached limit {}",
                counters.consecutive_losses, cb.consecutive_loss_limit
            ))
        } else {
            None
        };

        let reason = reason?;
        warn!(reason = %reason, "Circuit breaker tripped");
        counters.tripped = true;
        counters.tripped_at = Some(now);
        counters.trip_reason = Some(reason.clone());
        Some(reason)
    }

    /// Explicit administrative clear. Returns false if the breaker was not tripped.
    pub fn resume(&self) -> bool {
        let mut counters = self.lock();
        if !counters.tripped {
            return false;
        }
        info!(
            reason = ?counters.trip_reason,
            "Circuit breaker cleared manually"
        );
        counters.tripped = false;
        counters.tripped_at = None;
        counters.trip_reason = None;
        counters.consecutive_losses = 0;
        true
    }

    /// Whether a position has been held past the configured limit.
    pub fn should_force_exit(&self, position: &Position, now: DateTime<Utc>) -> bool {
        match self.config.max_hold_hours {
            Some(limit) => position.is_active() && position.holding_hours(now) >= limit,
            None => false,
        }
    }

    pub fn state(&self) -> RiskState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> RiskState {
        let open_positions = self.store.active_count();
        let mut counters = self.lock();
        self.roll_day(&mut counters, now);
        RiskState {
            open_positions,
            pending_entries: counters.pending.len(),
            daily_pnl: counters.daily_pnl,
            consecutive_losses: counters.consecutive_losses,
            breaker_tripped: counters.tripped,
            tripped_at: counters.tripped_at,
            trip_reason: counters.trip_reason.clone(),
            day: counters.day,
        }
    }
}
