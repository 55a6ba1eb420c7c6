//! Durable position store with a signal-id index.
//!
//! Reads are served from memory. Every mutation updates memory under a short
//! lock, then persists the full position set through a single global writer.
//! Snapshots are tagged with a generation number so a writer that finds a
//! newer snapshot already on disk skips its own, coalescing bursts of writes.

mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::models::{Position, PositionStatus, SellEvent, SellRequest};

use snapshot::{Snapshot, SNAPSHOT_VERSION};

/// Portfolio statistics across all known positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PortfolioStats {
    pub total: usize,
    pub open: usize,
    pub partial: usize,
    pub closed: usize,
    /// Sum of buy amounts over active positions
    pub invested: Decimal,
    /// Remaining holdings valued at their last multiplier
    pub estimated_value: Decimal,
    pub estimated_pnl: Decimal,
    /// Realized P&L over every recorded sell
    pub realized_pnl: Decimal,
}

impl std::fmt::Display for PortfolioStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Positions:       {} total", self.total)?;
        writeln!(f, "  Open:          {}", self.open)?;
        writeln!(f, "  Partial:       {}", self.partial)?;
        writeln!(f, "  Closed:        {}", self.closed)?;
        writeln!(f, "Invested:        {:.4}", self.invested)?;
        writeln!(f, "Estimated value: {:.4}", self.estimated_value)?;
        writeln!(f, "Estimated P&L:   {:+.4}", self.estimated_pnl)?;
        write!(f, "Realized P&L:    {:+.4}", self.realized_pnl)
    }
}

#[derive(Default)]
struct StoreState {
    positions: HashMap<String, Position>,
    /// signal id -> asset address
    signal_index: HashMap<String, String>,
    archive: Vec<Position>,
}

impl StoreState {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            positions: snapshot.positions.into_iter().collect(),
            signal_index: snapshot.signal_index.into_iter().collect(),
            archive: snapshot.archive,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Some(Utc::now()),
            positions: self
                .positions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            signal_index: self
                .signal_index
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            archive: self.archive.clone(),
        }
    }

    fn position_mut(&mut self, asset: &str) -> Result<&mut Position> {
        self.positions
            .get_mut(asset)
            .ok_or_else(|| EngineError::PositionNotFound(asset.to_string()))
    }
}

/// Concurrency-safe, crash-safe store of positions.
pub struct PositionStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    /// Generation of the most recent in-memory mutation
    generation: AtomicU64,
    /// Single writer; holds the generation last committed to disk
    writer: tokio::sync::Mutex<u64>,
}

impl PositionStore {
    /// Open the store, reloading the last committed snapshot.
    ///
    /// Fails with `StateCorruption` if the snapshot cannot be read.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = snapshot::load(&path).await?;
        let state = StoreState::from_snapshot(snapshot);

        info!(
            path = %path.display(),
            positions = state.positions.len(),
            signals = state.signal_index.len(),
            "Position store loaded"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            writer: tokio::sync::Mutex::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` to the in-memory state, then persist.
    ///
    /// On a persistence failure memory keeps the mutation and the error is returned.
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let (value, generation, snapshot) = {
            let mut state = self.lock();
            let value = f(&mut state)?;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (value, generation, state.to_snapshot())
        };
        self.persist(generation, snapshot).await?;
        Ok(value)
    }

    async fn persist(&self, generation: u64, snapshot: Snapshot) -> Result<()> {
        let mut committed = self.writer.lock().await;
        if *committed >= generation {
            debug!(generation, committed = *committed, "Snapshot superseded, skipping write");
            return Ok(());
        }
        if let Err(e) = snapshot::write_atomic(&self.path, &snapshot).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist snapshot");
            return Err(e);
        }
        *committed = generation;
        debug!(generation, positions = snapshot.positions.len(), "Snapshot committed");
        Ok(())
    }

    /// Register a newly bought position and its signal id atomically.
    pub async fn create(&self, position: Position) -> Result<Position> {
        let created = self
            .mutate(|state| {
                let asset = position.asset_address.clone();
                if let Some(existing) = state.positions.get(&asset) {
                    if existing.is_active() {
                        return Err(EngineError::DuplicatePosition { asset });
                    }
                }
                if let Some(owner) = state.signal_index.get(&position.signal_id) {
                    if owner != &asset {
                        return Err(EngineError::DuplicateSignal {
                            signal_id: position.signal_id.clone(),
                            asset: owner.clone(),
                        });
                    }
                }

                if let Some(previous) = state.positions.remove(&asset) {
                    // Closed record displaced by a fresh buy of the same asset
                    state.signal_index.remove(&previous.signal_id);
                    state.archive.push(previous);
                }
                state
                    .signal_index
                    .insert(position.signal_id.clone(), asset.clone());
                state.positions.insert(asset, position.clone());
                Ok(position)
            })
            .await?;

        info!(
            asset = %created.asset_address,
            signal_id = %created.signal_id,
            amount = %created.buy_amount,
            "Position created"
        );
        Ok(created)
    }

    pub fn get_by_asset(&self, asset: &str) -> Result<Position> {
        self.lock()
            .positions
            .get(asset)
            .cloned()
            .ok_or_else(|| EngineError::PositionNotFound(asset.to_string()))
    }

    pub fn get_by_signal_id(&self, signal_id: &str) -> Result<Position> {
        let state = self.lock();
        state
            .signal_index
            .get(signal_id)
            .and_then(|asset| state.positions.get(asset))
            .cloned()
            .ok_or_else(|| EngineError::PositionNotFound(format!("signal {}", signal_id)))
    }

    /// Asset address a signal id refers to, if any.
    pub fn resolve_signal(&self, signal_id: &str) -> Option<String> {
        self.lock().signal_index.get(signal_id).cloned()
    }

    /// Record a multiplier observation. Never sells.
    pub async fn apply_observation(&self, asset: &str, multiplier: Decimal) -> Result<Position> {
        let updated = self
            .mutate(|state| {
                let position = state.position_mut(asset)?;
                if position.is_closed() {
                    return Err(EngineError::PositionClosed {
                        asset: asset.to_string(),
                    });
                }
                position.observe(multiplier);
                Ok(position.clone())
            })
            .await?;

        debug!(
            asset = %asset,
            multiplier = %multiplier,
            peak = %updated.peak_multiplier,
            "Observation applied"
        );
        Ok(updated)
    }

    /// Record a confirmed sell.
    pub async fn apply_sell(&self, asset: &str, sell: SellRequest) -> Result<(Position, SellEvent)> {
        let now = Utc::now();
        let (position, event) = self
            .mutate(|state| {
                let position = state.position_mut(asset)?;
                let event = position.record_sell(sell, now)?;
                Ok((position.clone(), event))
            })
            .await?;

        info!(
            asset = %asset,
            percentage = %event.percentage,
            multiplier = %event.multiplier,
            sold = %position.sold_percentage,
            status = %position.status,
            "Sell applied"
        );
        Ok((position, event))
    }

    /// Force a position closed regardless of how much was sold.
    pub async fn close(&self, asset: &str, reason: &str) -> Result<Position> {
        self.close_at(asset, reason, Utc::now()).await
    }

    pub async fn close_at(&self, asset: &str, reason: &str, at: DateTime<Utc>) -> Result<Position> {
        let closed = self
            .mutate(|state| {
                let position = state.position_mut(asset)?;
                if position.is_closed() {
                    return Err(EngineError::PositionClosed {
                        asset: asset.to_string(),
                    });
                }
                position.force_close(reason, at);
                Ok(position.clone())
            })
            .await?;

        info!(asset = %asset, reason = %reason, "Position force-closed");
        Ok(closed)
    }

    /// Whether an open or partially closed position exists for the asset.
    pub fn has_active(&self, asset: &str) -> bool {
        self.lock()
            .positions
            .get(asset)
            .map_or(false, |p| p.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.lock().positions.values().filter(|p| p.is_active()).count()
    }

    /// Native units still committed across active positions.
    pub fn total_exposure(&self) -> Decimal {
        self.lock().positions.values().map(|p| p.exposure()).sum()
    }

    /// Open and partially closed positions, oldest first.
    pub fn list_open(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .lock()
            .positions
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    /// Every current position, including closed ones, oldest first.
    pub fn list_all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.lock().positions.values().cloned().collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub fn statistics(&self) -> PortfolioStats {
        let state = self.lock();
        let mut stats = PortfolioStats::default();

        for position in state.positions.values() {
            stats.total += 1;
            stats.realized_pnl += position.realized_pnl();
            match position.status {
                PositionStatus::Open => stats.open += 1,
                PositionStatus::PartiallyClosed => stats.partial += 1,
                PositionStatus::Closed => {
                    stats.closed += 1;
                    continue;
                }
            }
            stats.invested += position.buy_amount;
            stats.estimated_value += position.estimated_value();
        }
        stats.estimated_pnl = stats.estimated_value - stats.invested;
        stats
    }
}
