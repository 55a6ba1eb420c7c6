//! Orchestrator: per-asset event lanes driving risk, execution, strategy and store.
//!
//! Handles:
//! - Routing buy signals and profit observations to a FIFO lane per asset
//! - Gating buys through the risk manager before any trade call
//! - Evaluating exits after each observation and applying confirmed sells
//! - Emitting exactly one notification for every rejection or failure

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{RetryingExecutor, TradeExecutor};
use crate::models::{
    BuySignal, ExitReason, Position, ProfitObservation, SellEvent, SellRequest, SignalEvent,
    TradeAction,
};
use crate::notify::{EngineEvent, Notifier};
use crate::store::{PortfolioStats, PositionStore};
use crate::trading::{
    full_exit, presets, Decision, RiskManager, RiskState, StrategyConfig, StrategyEngine,
};

/// How often idle lanes are retired.
const LANE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle phase of an asset as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// Buy call outstanding
    Opening,
    Open,
    /// Sell call outstanding
    Reducing,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Opening => "opening",
            Phase::Open => "open",
            Phase::Reducing => "reducing",
            Phase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Administrative command accepted on the event stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Clear a tripped circuit breaker
    Resume,
    /// Switch the active strategy to a preset
    SetStrategy { preset: String },
}

/// Clears a transient phase when dropped.
struct PhaseGuard<'a> {
    phases: &'a Mutex<HashMap<String, Phase>>,
    asset: String,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phases: &'a Mutex<HashMap<String, Phase>>, asset: &str, phase: Phase) -> Self {
        phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(asset.to_string(), phase);
        Self {
            phases,
            asset: asset.to_string(),
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.asset);
    }
}

/// One asset's FIFO queue and its worker.
struct Lane {
    tx: mpsc::UnboundedSender<SignalEvent>,
    /// Events sent but not yet fully handled
    queued: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl Lane {
    fn is_drained(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0
    }
}

/// Dispatcher-owned routing state.
#[derive(Default)]
struct Router {
    lanes: HashMap<String, Lane>,
    /// Buy signal id -> asset, until the store index knows it or the buy is settled
    routed: HashMap<String, String>,
    retired: Vec<JoinHandle<()>>,
}

/// Main engine. Share it behind an `Arc`.
pub struct Orchestrator {
    store: Arc<PositionStore>,
    risk: RiskManager,
    strategy: StrategyEngine,
    executor: RetryingExecutor,
    notifier: Notifier,
    phases: Mutex<HashMap<String, Phase>>,
    lanes_open: AtomicUsize,
}

impl Orchestrator {
    /// Build the engine around an already opened store.
    pub fn new(
        config: &EngineConfig,
        store: Arc<PositionStore>,
        executor: Arc<dyn TradeExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            risk: RiskManager::new(config.risk.clone(), store.clone()),
            strategy: StrategyEngine::new(config.strategy.clone())?,
            executor: RetryingExecutor::new(executor, config.retry.clone()),
            notifier: Notifier::new(config.notification_buffer),
            phases: Mutex::new(HashMap::new()),
            lanes_open: AtomicUsize::new(0),
            store,
        })
    }

    /// Consume events until the channel closes, then drain every lane.
    ///
    /// Events for one asset are handled strictly in arrival order; different
    /// assets proceed concurrently. Lanes of idle or closed assets are retired
    /// once their queue is empty.
    pub async fn run(self: &Arc<Self>, mut rx: mpsc::Receiver<SignalEvent>) {
        let mut router = Router::default();
        let mut sweep = tokio::time::interval(LANE_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Orchestrator started");

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(&mut router, event),
                    None => break,
                },
                _ = sweep.tick() => self.sweep_lanes(&mut router),
            }
        }

        info!(lanes = router.lanes.len(), "Event stream closed, draining lanes");
        let mut workers: Vec<JoinHandle<()>> =
            router.lanes.into_values().map(|lane| lane.worker).collect();
        workers.append(&mut router.retired);
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Lane worker panicked");
            }
        }
        self.lanes_open.store(0, Ordering::SeqCst);
        info!("Orchestrator stopped");
    }

    fn dispatch(self: &Arc<Self>, router: &mut Router, event: SignalEvent) {
        let asset = match &event {
            SignalEvent::BuySignal(signal) => {
                router
                    .routed
                    .entry(signal.signal_id.clone())
                    .or_insert_with(|| signal.asset_address.clone());
                signal.asset_address.clone()
            }
            SignalEvent::ProfitObservation(obs) => {
                match self
                    .store
                    .resolve_signal(&obs.signal_id)
                    .or_else(|| router.routed.get(&obs.signal_id).cloned())
                {
                    Some(asset) => asset,
                    None => {
                        debug!(signal_id = %obs.signal_id, "Unknown signal, observation dropped");
                        return;
                    }
                }
            }
        };

        let lane = router
            .lanes
            .entry(asset.clone())
            .or_insert_with(|| self.spawn_lane(&asset));
        lane.queued.fetch_add(1, Ordering::SeqCst);
        if lane.tx.send(event).is_err() {
            lane.queued.fetch_sub(1, Ordering::SeqCst);
            error!(asset = %asset, "Lane worker stopped, event lost");
        }
        self.lanes_open.store(router.lanes.len(), Ordering::SeqCst);
    }

    fn spawn_lane(self: &Arc<Self>, asset: &str) -> Lane {
        let (tx, mut lane_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let pending = Arc::clone(&queued);
        let engine = Arc::clone(self);
        let asset = asset.to_string();

        let worker = tokio::spawn(async move {
            debug!(asset = %asset, "Lane opened");
            while let Some(event) = lane_rx.recv().await {
                engine.handle_event(event).await;
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            debug!(asset = %asset, "Lane closed");
        });

        Lane {
            tx,
            queued,
            worker,
        }
    }

    /// Retire drained lanes whose asset has nothing left to do, and forget
    /// routed signals that are settled.
    fn sweep_lanes(&self, router: &mut Router) {
        let idle: Vec<String> = router
            .lanes
            .iter()
            .filter(|(asset, lane)| {
                lane.is_drained() && matches!(self.phase(asset), Phase::Idle | Phase::Closed)
            })
            .map(|(asset, _)| asset.clone())
            .collect();

        for asset in idle {
            if let Some(lane) = router.lanes.remove(&asset) {
                debug!(asset = %asset, "Retiring idle lane");
                // Dropping the sender ends the worker once its queue is empty
                drop(lane.tx);
                router.retired.push(lane.worker);
            }
        }
        router.retired.retain(|worker| !worker.is_finished());

        let lanes = &router.lanes;
        router.routed.retain(|signal_id, asset| {
            self.store.resolve_signal(signal_id).is_none()
                && lanes.get(asset).is_some_and(|lane| !lane.is_drained())
        });

        self.lanes_open.store(router.lanes.len(), Ordering::SeqCst);
    }

    /// Process one event inline. Never returns an error to the caller.
    pub async fn handle_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::BuySignal(signal) => self.handle_buy(signal).await,
            SignalEvent::ProfitObservation(obs) => self.handle_observation(obs).await,
        }
    }

    pub async fn handle_buy(&self, signal: BuySignal) {
        let asset = signal.asset_address.clone();
        info!(
            asset = %asset,
            symbol = %signal.symbol,
            signal_id = %signal.signal_id,
            "Buy signal received"
        );

        if let Some(owner) = self.store.resolve_signal(&signal.signal_id) {
            self.reject(
                &asset,
                TradeAction::Buy,
                format!(
                    "Signal {} already opened a position in {}",
                    signal.signal_id, owner
                ),
            );
            return;
        }

        // Reserves a slot and the size until released below
        let validation = self.risk.validate_entry(&asset);
        if !validation.allowed {
            self.reject(&asset, TradeAction::Buy, validation.reason);
            return;
        }

        match validation.size {
            Some(size) => self.open_position(&signal, size).await,
            None => self.reject(&asset, TradeAction::Buy, "No position size computed".to_string()),
        }
        self.risk.release_entry(&asset);
    }

    async fn open_position(&self, signal: &BuySignal, size: Decimal) {
        let asset = signal.asset_address.as_str();
        let _phase = PhaseGuard::enter(&self.phases, asset, Phase::Opening);

        let receipt = match self.executor.buy(asset, size).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.trade_failed(asset, TradeAction::Buy, e);
                return;
            }
        };

        let position = Position::new(
            asset,
            signal.symbol.clone(),
            signal.signal_id.clone(),
            size,
            receipt.executed_at,
        );
        let position = match self.store.create(position).await {
            Ok(position) => position,
            Err(e) if e.is_persistence() => match self.unpersisted(asset, &e) {
                Some(position) => position,
                None => {
                    self.reject(asset, TradeAction::Buy, e.to_string());
                    return;
                }
            },
            Err(e) => {
                error!(
                    asset = %asset,
                    tx_id = %receipt.tx_id,
                    error = %e,
                    "Buy confirmed but position could not be recorded"
                );
                self.reject(asset, TradeAction::Buy, e.to_string());
                return;
            }
        };

        info!(asset = %asset, amount = %size, tx_id = %receipt.tx_id, "Position opened");
        self.notifier.emit(EngineEvent::PositionOpened {
            asset: asset.to_string(),
            symbol: position.symbol,
            signal_id: position.signal_id,
            amount: size,
            tx_id: receipt.tx_id,
        });
    }

    pub async fn handle_observation(&self, obs: ProfitObservation) {
        let position = match self.store.get_by_signal_id(&obs.signal_id) {
            Ok(position) => position,
            Err(_) => {
                debug!(signal_id = %obs.signal_id, "No position for signal, observation dropped");
                return;
            }
        };
        let asset = position.asset_address.clone();

        if position.is_closed() {
            debug!(asset = %asset, "Position already closed, observation skipped");
            return;
        }
        if obs.multiplier <= Decimal::ZERO {
            self.reject(
                &asset,
                TradeAction::Sell,
                format!("Invalid multiplier {}", obs.multiplier),
            );
            return;
        }

        let mut position = match self.store.apply_observation(&asset, obs.multiplier).await {
            Ok(position) => position,
            // The decision only needs the in-memory state
            Err(e) if e.is_persistence() => match self.unpersisted(&asset, &e) {
                Some(position) => position,
                None => {
                    self.reject(&asset, TradeAction::Sell, e.to_string());
                    return;
                }
            },
            Err(e) => {
                self.reject(&asset, TradeAction::Sell, e.to_string());
                return;
            }
        };

        if self.risk.should_force_exit(&position, Utc::now()) {
            warn!(
                asset = %asset,
                hours = position.holding_hours(Utc::now()),
                "Max hold time reached, forcing exit"
            );
            if let Decision::Sell {
                percentage,
                reason,
                tier_key,
            } = full_exit(&position, ExitReason::MaxHoldTime)
            {
                self.execute_sell(&position, percentage, reason, tier_key).await;
            }
            return;
        }

        // Several tiers may qualify in one jump; each is applied before the next is evaluated
        loop {
            match self.strategy.evaluate(&position) {
                Decision::Hold => break,
                Decision::Sell {
                    percentage,
                    reason,
                    tier_key,
                } => match self.execute_sell(&position, percentage, reason, tier_key).await {
                    Some(updated) => position = updated,
                    None => break,
                },
            }
        }
    }

    /// Sell through the executor and record the result. `None` on any failure.
    async fn execute_sell(
        &self,
        position: &Position,
        percentage: Decimal,
        reason: ExitReason,
        tier_key: Option<String>,
    ) -> Option<Position> {
        let asset = position.asset_address.as_str();
        let _phase = PhaseGuard::enter(&self.phases, asset, Phase::Reducing);

        let receipt = match self.executor.sell(asset, percentage).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.trade_failed(asset, TradeAction::Sell, e);
                return None;
            }
        };

        let multiplier = position.last_multiplier;
        let proceeds = position.buy_amount * percentage / dec!(100) * multiplier;
        let request = SellRequest {
            percentage,
            multiplier,
            proceeds,
            reason,
            tier_key,
            tx_id: Some(receipt.tx_id.clone()),
        };

        let (updated, event) = match self.store.apply_sell(asset, request).await {
            Ok(applied) => applied,
            Err(e) if e.is_persistence() => {
                match self.unpersisted_sell(asset, &receipt.tx_id, &e) {
                    Some(applied) => applied,
                    None => {
                        self.reject(asset, TradeAction::Sell, e.to_string());
                        return None;
                    }
                }
            }
            Err(e) => {
                error!(
                    asset = %asset,
                    tx_id = %receipt.tx_id,
                    error = %e,
                    "Sell confirmed but could not be recorded"
                );
                self.reject(asset, TradeAction::Sell, e.to_string());
                return None;
            }
        };

        self.notifier.emit(EngineEvent::PositionReduced {
            asset: asset.to_string(),
            percentage,
            multiplier,
            sold_percentage: updated.sold_percentage,
            reason,
            tx_id: Some(receipt.tx_id),
        });
        if updated.is_closed() {
            info!(
                asset = %asset,
                reason = %reason,
                realized_pnl = %updated.realized_pnl(),
                "Position closed"
            );
            self.notifier.emit(EngineEvent::PositionClosed {
                asset: asset.to_string(),
                reason: reason.as_str().to_string(),
                realized_pnl: updated.realized_pnl(),
            });
        }

        if let Some(trip_reason) = self.risk.record_outcome(event.realized_pnl) {
            self.notifier.emit(EngineEvent::CircuitBreakerTripped {
                reason: trip_reason,
                at: Utc::now(),
            });
        }

        Some(updated)
    }

    /// Memory keeps a mutation whose snapshot write failed; read it back.
    fn unpersisted(&self, asset: &str, err: &EngineError) -> Option<Position> {
        error!(
            asset = %asset,
            error = %err,
            "Snapshot write failed, continuing from in-memory state"
        );
        self.store.get_by_asset(asset).ok()
    }

    fn unpersisted_sell(
        &self,
        asset: &str,
        tx_id: &str,
        err: &EngineError,
    ) -> Option<(Position, SellEvent)> {
        let position = self.unpersisted(asset, err)?;
        let event = position
            .sells
            .last()
            .filter(|sell| sell.tx_id.as_deref() == Some(tx_id))
            .cloned()?;
        Some((position, event))
    }

    fn reject(&self, asset: &str, action: TradeAction, reason: String) {
        warn!(asset = %asset, action = %action, reason = %reason, "Rejected");
        self.notifier.emit(EngineEvent::Rejected {
            asset: asset.to_string(),
            action,
            reason,
        });
    }

    fn trade_failed(&self, asset: &str, action: TradeAction, err: EngineError) {
        let (attempts, reason) = match err {
            EngineError::TradeExecution {
                attempts, reason, ..
            } => (attempts, reason),
            other => (1, other.to_string()),
        };
        error!(
            asset = %asset,
            action = %action,
            attempts,
            reason = %reason,
            "Trade failed, no state changed"
        );
        self.notifier.emit(EngineEvent::TradeFailed {
            asset: asset.to_string(),
            action,
            reason,
            attempts,
        });
    }

    // ==================== Queries ====================

    pub fn phase(&self, asset: &str) -> Phase {
        let transient = self
            .phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(asset)
            .copied();
        if let Some(phase) = transient {
            return phase;
        }
        match self.store.get_by_asset(asset) {
            Ok(position) if position.is_closed() => Phase::Closed,
            Ok(_) => Phase::Open,
            Err(_) => Phase::Idle,
        }
    }

    /// Lanes currently owned by the dispatcher.
    pub fn active_lanes(&self) -> usize {
        self.lanes_open.load(Ordering::SeqCst)
    }

    pub fn list_open_positions(&self) -> Vec<Position> {
        self.store.list_open()
    }

    pub fn get_position(&self, asset: &str) -> Result<Position> {
        self.store.get_by_asset(asset)
    }

    pub fn get_risk_state(&self) -> RiskState {
        self.risk.state()
    }

    pub fn statistics(&self) -> PortfolioStats {
        self.store.statistics()
    }

    pub fn active_strategy(&self) -> Arc<StrategyConfig> {
        self.strategy.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.notifier.subscribe()
    }

    // ==================== Admin ====================

    /// Clear a tripped circuit breaker.
    pub fn resume(&self) -> bool {
        let cleared = self.risk.resume();
        if cleared {
            self.notifier.emit(EngineEvent::CircuitBreakerCleared);
        }
        cleared
    }

    /// Swap the active strategy. Evaluations already running keep the old one.
    pub fn set_strategy(&self, config: StrategyConfig) -> Result<()> {
        self.strategy.replace(config)
    }

    pub fn apply_control(&self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::Resume => {
                if !self.resume() {
                    info!("Circuit breaker not tripped, nothing to resume");
                }
                Ok(())
            }
            ControlCommand::SetStrategy { preset } => {
                let preset = presets::by_id(&preset).ok_or_else(|| {
                    EngineError::Configuration(format!("unknown strategy preset '{}'", preset))
                })?;
                let kind = preset.config.kind();
                self.set_strategy(preset.config)?;
                info!(preset = %preset.id, kind, "Strategy switched");
                Ok(())
            }
        }
    }

    /// Record a manual close. No trade is placed.
    pub async fn force_close(&self, asset: &str, reason: &str) -> Result<Position> {
        let position = self.store.close(asset, reason).await?;
        self.notifier.emit(EngineEvent::PositionClosed {
            asset: asset.to_string(),
            reason: reason.to_string(),
            realized_pnl: position.realized_pnl(),
        });
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::executor::{ExecutorError, RetryConfig, TradeReceipt};
    use crate::models::PositionStatus;
    use crate::trading::{ResetPolicy, Tier};

    /// Executor whose behavior is scripted per test.
    #[derive(Default)]
    struct ScriptedExecutor {
        fail_buys: AtomicU32,
        fail_sells: AtomicU32,
        hang_sells: bool,
        /// Every buy takes this long to confirm
        buy_delay: Option<Duration>,
        /// Buys for this asset wait on the gate
        gate: Option<(String, Arc<Notify>)>,
        buy_calls: AtomicU32,
        sell_calls: AtomicU32,
    }

    #[async_trait]
    impl TradeExecutor for ScriptedExecutor {
        async fn buy(&self, asset: &str, _amount: Decimal) -> std::result::Result<TradeReceipt, ExecutorError> {
            self.buy_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.buy_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some((gated, gate)) = &self.gate {
                if gated == asset {
                    gate.notified().await;
                }
            }
            if self.fail_buys.load(Ordering::SeqCst) > 0 {
                self.fail_buys.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecutorError::Rejected("route not found".into()));
            }
            Ok(TradeReceipt::new(format!("buy-{}", asset)))
        }

        async fn sell(&self, asset: &str, _pct: Decimal) -> std::result::Result<TradeReceipt, ExecutorError> {
            let n = self.sell_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang_sells {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_sells.load(Ordering::SeqCst) > 0 {
                self.fail_sells.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecutorError::Rejected("slippage exceeded".into()));
            }
            Ok(TradeReceipt::new(format!("sell-{}-{}", asset, n)))
        }
    }

    fn test_config(strategy: StrategyConfig) -> EngineConfig {
        EngineConfig {
            strategy,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                backoff_multiplier: 1.5,
                max_backoff_ms: 5,
                call_timeout_ms: 100,
            },
            ..Default::default()
        }
    }

    fn tiered() -> StrategyConfig {
        StrategyConfig::Tiered {
            tiers: vec![
                Tier::new(dec!(2.0), dec!(33)),
                Tier::new(dec!(3.0), dec!(33)),
                Tier::new(dec!(5.0), dec!(34)),
            ],
        }
    }

    async fn setup(
        config: EngineConfig,
        executor: ScriptedExecutor,
    ) -> (tempfile::TempDir, Arc<Orchestrator>, Arc<ScriptedExecutor>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PositionStore::open(dir.path().join("state.json")).await.unwrap());
        let executor = Arc::new(executor);
        let engine = Orchestrator::new(&config, store, executor.clone()).unwrap();
        (dir, Arc::new(engine), executor)
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_buy_opens_position() {
        let (_dir, engine, _) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        let mut rx = engine.subscribe();

        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;

        let position = engine.get_position("Mint111").unwrap();
        assert_eq!(position.buy_amount, dec!(0.1));
        assert_eq!(position.peak_multiplier, Decimal::ONE);
        assert_eq!(engine.phase("Mint111"), Phase::Open);
        assert_eq!(engine.phase("Mint999"), Phase::Idle);

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [EngineEvent::PositionOpened { .. }]));
    }

    #[tokio::test]
    async fn test_duplicate_buy_rejected() {
        let (_dir, engine, executor) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        let mut rx = engine.subscribe();

        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-2")).await;

        assert_eq!(engine.list_open_positions().len(), 1);
        assert_eq!(executor.buy_calls.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            EngineEvent::Rejected { action: TradeAction::Buy, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_signal_dropped() {
        let (_dir, engine, executor) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;
        let before = engine.get_position("Mint111").unwrap();
        let mut rx = engine.subscribe();

        engine
            .handle_observation(ProfitObservation::new("sig-unknown", dec!(9)))
            .await;

        assert_eq!(engine.get_position("Mint111").unwrap(), before);
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_tiers_all_fire_in_one_jump() {
        let (_dir, engine, executor) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;
        let mut rx = engine.subscribe();

        engine
            .handle_observation(ProfitObservation::new("sig-1", dec!(5.5)))
            .await;

        let position = engine.get_position("Mint111").unwrap();
        assert_eq!(position.sold_percentage, dec!(100));
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.sells.len(), 3);
        assert_eq!(position.triggered_tiers.len(), 3);
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 3);

        let reduced = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::PositionReduced { .. }))
            .count();
        assert_eq!(reduced, 3);

        // Nothing left to sell
        engine
            .handle_observation(ProfitObservation::new("sig-1", dec!(6)))
            .await;
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_trailing_stop_fires_once() {
        let config = test_config(StrategyConfig::Trailing { stop_pct: dec!(0.15) });
        let (_dir, engine, executor) = setup(config, ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;

        for m in [dec!(2.0), dec!(3.0), dec!(2.7)] {
            engine.handle_observation(ProfitObservation::new("sig-1", m)).await;
        }
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 0);

        // 3.0 * 0.85 = 2.55
        engine.handle_observation(ProfitObservation::new("sig-1", dec!(2.5))).await;
        engine.handle_observation(ProfitObservation::new("sig-1", dec!(2.0))).await;

        let position = engine.get_position("Mint111").unwrap();
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 1);
        assert_eq!(position.sells[0].reason, ExitReason::TrailingStop);
        assert_eq!(position.peak_multiplier, dec!(3.0));
        // 0.1 * 1.0 * (2.5 - 1)
        assert_eq!(position.realized_pnl(), dec!(0.15));
        assert_eq!(engine.phase("Mint111"), Phase::Closed);
    }

    #[tokio::test]
    async fn test_breaker_trips_after_consecutive_losses() {
        let mut config = test_config(StrategyConfig::Fixed {
            target_multiplier: dec!(3),
            stop_loss_multiplier: Some(dec!(0.5)),
        });
        config.risk.circuit_breaker.consecutive_loss_limit = 2;
        config.risk.circuit_breaker.reset_policy = ResetPolicy::Manual;
        let (_dir, engine, _) = setup(config, ScriptedExecutor::default()).await;
        let mut rx = engine.subscribe();

        for (asset, sig) in [("A", "sig-a"), ("B", "sig-b")] {
            engine.handle_buy(BuySignal::new(asset, asset, sig)).await;
            engine.handle_observation(ProfitObservation::new(sig, dec!(0.4))).await;
        }
        assert!(engine.get_risk_state().breaker_tripped);

        engine.handle_buy(BuySignal::new("C", "C", "sig-c")).await;
        assert_eq!(engine.phase("C"), Phase::Idle);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::CircuitBreakerTripped { .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Rejected { action: TradeAction::Buy, .. })
        ));

        assert!(engine.resume());
        engine.handle_buy(BuySignal::new("C", "C", "sig-c")).await;
        assert_eq!(engine.phase("C"), Phase::Open);
    }

    #[tokio::test]
    async fn test_failed_buy_creates_nothing() {
        let executor = ScriptedExecutor {
            fail_buys: AtomicU32::new(10),
            ..Default::default()
        };
        let (_dir, engine, executor) = setup(test_config(tiered()), executor).await;
        let mut rx = engine.subscribe();

        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;

        assert_eq!(engine.phase("Mint111"), Phase::Idle);
        assert!(engine.get_position("Mint111").is_err());
        assert_eq!(executor.buy_calls.load(Ordering::SeqCst), 3);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            EngineEvent::TradeFailed {
                action, attempts, ..
            } => {
                assert_eq!(*action, TradeAction::Buy);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_sell_leaves_position_unchanged() {
        let executor = ScriptedExecutor {
            fail_sells: AtomicU32::new(3),
            ..Default::default()
        };
        let (_dir, engine, _) = setup(test_config(tiered()), executor).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;
        let mut rx = engine.subscribe();

        engine.handle_observation(ProfitObservation::new("sig-1", dec!(2.2))).await;

        let position = engine.get_position("Mint111").unwrap();
        assert_eq!(position.sold_percentage, Decimal::ZERO);
        assert!(position.triggered_tiers.is_empty());
        assert_eq!(position.last_multiplier, dec!(2.2));

        let failures: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::TradeFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);

        // Next observation retries the still-untriggered tier
        engine.handle_observation(ProfitObservation::new("sig-1", dec!(2.3))).await;
        assert_eq!(engine.get_position("Mint111").unwrap().sold_percentage, dec!(33));
    }

    #[tokio::test]
    async fn test_sell_timeout_is_failure() {
        let executor = ScriptedExecutor {
            hang_sells: true,
            ..Default::default()
        };
        let (_dir, engine, executor) = setup(test_config(tiered()), executor).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;
        let mut rx = engine.subscribe();

        engine.handle_observation(ProfitObservation::new("sig-1", dec!(2.0))).await;

        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.get_position("Mint111").unwrap().sold_percentage, Decimal::ZERO);
        match drain(&mut rx).as_slice() {
            [EngineEvent::TradeFailed { reason, .. }] => assert!(reason.contains("timed out")),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hung_buy_does_not_block_other_assets() {
        let gate = Arc::new(Notify::new());
        let executor = ScriptedExecutor {
            gate: Some(("A".to_string(), gate.clone())),
            ..Default::default()
        };
        let mut config = test_config(tiered());
        config.retry.call_timeout_ms = 10_000;
        let (_dir, engine, _) = setup(config, executor).await;
        let mut events = engine.subscribe();

        let (tx, rx) = mpsc::channel(16);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(rx).await })
        };

        tx.send(SignalEvent::BuySignal(BuySignal::new("A", "A", "sig-a")))
            .await
            .unwrap();
        // Queued behind A's outstanding buy
        tx.send(SignalEvent::ProfitObservation(ProfitObservation::new("sig-a", dec!(2.5))))
            .await
            .unwrap();
        tx.send(SignalEvent::BuySignal(BuySignal::new("B", "B", "sig-b")))
            .await
            .unwrap();

        let opened = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.asset(), Some("B"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.phase("A") != Phase::Opening {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(engine.get_position("A").is_err());

        gate.notify_one();
        drop(tx);
        runner.await.unwrap();

        // A's observation ran after its buy confirmed
        let a = engine.get_position("A").unwrap();
        assert_eq!(a.sold_percentage, dec!(33));
        assert_eq!(engine.phase("B"), Phase::Open);
    }

    #[tokio::test]
    async fn test_force_close_and_strategy_swap() {
        let (_dir, engine, executor) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;

        engine
            .set_strategy(StrategyConfig::Fixed {
                target_multiplier: dec!(1.5),
                stop_loss_multiplier: None,
            })
            .unwrap();
        assert_eq!(engine.active_strategy().kind(), "fixed");
        assert!(engine
            .set_strategy(StrategyConfig::Tiered { tiers: vec![] })
            .is_err());

        let closed = engine.force_close("Mint111", "manual").await.unwrap();
        assert_eq!(closed.close_reason.as_deref(), Some("manual"));
        assert_eq!(engine.phase("Mint111"), Phase::Closed);

        // Observations on a closed position are ignored
        engine.handle_observation(ProfitObservation::new("sig-1", dec!(9))).await;
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 0);
        assert!(engine.force_close("Mint111", "again").await.is_err());
    }

    #[tokio::test]
    async fn test_max_hold_time_forces_exit() {
        let (_dir, engine, executor) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        let opened_at = Utc::now() - chrono::Duration::hours(80);
        engine
            .store
            .create(Position::new("Mint111", "PEPE", "sig-1", dec!(0.1), opened_at))
            .await
            .unwrap();

        // Below every tier, so only the hold limit can trigger a sell
        engine.handle_observation(ProfitObservation::new("sig-1", dec!(1.2))).await;

        let position = engine.get_position("Mint111").unwrap();
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 1);
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.sells[0].reason, ExitReason::MaxHoldTime);
        assert_eq!(position.realized_pnl(), dec!(0.02));
    }

    #[tokio::test]
    async fn test_invalid_multiplier_rejected() {
        let (_dir, engine, _) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("Mint111", "PEPE", "sig-1")).await;
        let mut rx = engine.subscribe();

        engine.handle_observation(ProfitObservation::new("sig-1", dec!(0))).await;

        assert_eq!(engine.get_position("Mint111").unwrap().last_multiplier, Decimal::ONE);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::Rejected { action: TradeAction::Sell, .. }]
        ));
    }

    /// Replace the snapshot file with a directory so every later write fails.
    fn block_snapshot(dir: &tempfile::TempDir) {
        let path = dir.path().join("state.json");
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();
    }

    async fn start(engine: &Arc<Orchestrator>) -> (mpsc::Sender<SignalEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let engine = engine.clone();
        (tx, tokio::spawn(async move { engine.run(rx).await }))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_buys_respect_position_limit() {
        let mut config = test_config(tiered());
        config.risk.max_open_positions = 1;
        config.risk.max_portfolio_heat = None;
        config.retry.call_timeout_ms = 5_000;
        let executor = ScriptedExecutor {
            buy_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (_dir, engine, executor) = setup(config, executor).await;
        let mut rx = engine.subscribe();

        let (tx, runner) = start(&engine).await;
        for asset in ["A", "B", "C"] {
            let signal = BuySignal::new(asset, asset, &format!("sig-{}", asset));
            tx.send(SignalEvent::BuySignal(signal)).await.unwrap();
        }
        drop(tx);
        runner.await.unwrap();

        assert_eq!(engine.list_open_positions().len(), 1);
        assert_eq!(executor.buy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.get_risk_state().pending_entries, 0);

        let events = drain(&mut rx);
        let rejected = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::Rejected { action: TradeAction::Buy, .. }))
            .count();
        assert_eq!(rejected, 2);
    }

    #[tokio::test]
    async fn test_failed_buy_releases_reservation() {
        let mut config = test_config(tiered());
        config.risk.max_open_positions = 1;
        let executor = ScriptedExecutor {
            fail_buys: AtomicU32::new(3),
            ..Default::default()
        };
        let (_dir, engine, _) = setup(config, executor).await;

        engine.handle_buy(BuySignal::new("A", "A", "sig-a")).await;
        assert_eq!(engine.get_risk_state().pending_entries, 0);

        engine.handle_buy(BuySignal::new("B", "B", "sig-b")).await;
        assert_eq!(engine.phase("B"), Phase::Open);
    }

    #[tokio::test]
    async fn test_unpersisted_sell_still_reported() {
        let mut config = test_config(StrategyConfig::Fixed {
            target_multiplier: dec!(3),
            stop_loss_multiplier: Some(dec!(0.5)),
        });
        config.risk.circuit_breaker.consecutive_loss_limit = 1;
        config.risk.circuit_breaker.reset_policy = ResetPolicy::Manual;
        let (dir, engine, _) = setup(config, ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("A", "A", "sig-a")).await;
        let mut rx = engine.subscribe();

        block_snapshot(&dir);
        engine.handle_observation(ProfitObservation::new("sig-a", dec!(0.4))).await;

        let position = engine.get_position("A").unwrap();
        assert!(position.is_closed());
        assert_eq!(position.sells.len(), 1);
        assert!(engine.get_risk_state().breaker_tripped);

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [
                EngineEvent::PositionReduced { .. },
                EngineEvent::PositionClosed { .. },
                EngineEvent::CircuitBreakerTripped { .. },
            ]
        ));
    }

    #[tokio::test]
    async fn test_unpersisted_observation_still_evaluated() {
        let (dir, engine, executor) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("A", "A", "sig-a")).await;

        block_snapshot(&dir);
        engine.handle_observation(ProfitObservation::new("sig-a", dec!(2.2))).await;

        let position = engine.get_position("A").unwrap();
        assert_eq!(executor.sell_calls.load(Ordering::SeqCst), 1);
        assert_eq!(position.sold_percentage, dec!(33));
        assert_eq!(position.last_multiplier, dec!(2.2));
    }

    #[tokio::test]
    async fn test_unpersisted_buy_still_opens() {
        let (dir, engine, _) = setup(test_config(tiered()), ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("A", "A", "sig-a")).await;
        let mut rx = engine.subscribe();

        block_snapshot(&dir);
        engine.handle_buy(BuySignal::new("B", "B", "sig-b")).await;

        assert_eq!(engine.phase("B"), Phase::Open);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [EngineEvent::PositionOpened { .. }]
        ));
    }

    #[tokio::test]
    async fn test_idle_lanes_are_retired() {
        let executor = ScriptedExecutor {
            fail_buys: AtomicU32::new(3),
            ..Default::default()
        };
        let (_dir, engine, executor) = setup(test_config(tiered()), executor).await;
        let (tx, runner) = start(&engine).await;

        // A fails and stays idle, B opens and keeps its lane
        tx.send(SignalEvent::BuySignal(BuySignal::new("A", "A", "sig-a")))
            .await
            .unwrap();
        wait_until(|| executor.buy_calls.load(Ordering::SeqCst) == 3).await;
        tx.send(SignalEvent::BuySignal(BuySignal::new("B", "B", "sig-b")))
            .await
            .unwrap();
        wait_until(|| engine.phase("B") == Phase::Open).await;
        wait_until(|| engine.active_lanes() == 1).await;

        // B closes and its lane goes too
        tx.send(SignalEvent::ProfitObservation(ProfitObservation::new("sig-b", dec!(6))))
            .await
            .unwrap();
        wait_until(|| engine.phase("B") == Phase::Closed).await;
        wait_until(|| engine.active_lanes() == 0).await;

        // A fresh buy for a retired asset gets a new lane
        tx.send(SignalEvent::BuySignal(BuySignal::new("A", "A", "sig-a2")))
            .await
            .unwrap();
        wait_until(|| engine.phase("A") == Phase::Open).await;

        drop(tx);
        runner.await.unwrap();
        assert_eq!(engine.active_lanes(), 0);
    }

    #[tokio::test]
    async fn test_control_commands() {
        let mut config = test_config(StrategyConfig::Fixed {
            target_multiplier: dec!(3),
            stop_loss_multiplier: Some(dec!(0.5)),
        });
        config.risk.circuit_breaker.consecutive_loss_limit = 1;
        config.risk.circuit_breaker.reset_policy = ResetPolicy::Manual;
        let (_dir, engine, _) = setup(config, ScriptedExecutor::default()).await;
        engine.handle_buy(BuySignal::new("A", "A", "sig-a")).await;
        engine.handle_observation(ProfitObservation::new("sig-a", dec!(0.4))).await;
        assert!(engine.get_risk_state().breaker_tripped);

        let resume: ControlCommand = serde_json::from_str(r#"{"type":"resume"}"#).unwrap();
        engine.apply_control(resume).unwrap();
        assert!(!engine.get_risk_state().breaker_tripped);
        // Resuming an untripped breaker is a no-op
        engine.apply_control(ControlCommand::Resume).unwrap();

        let preset = presets::all()[0].id;
        let line = format!(r#"{{"type":"set_strategy","preset":"{}"}}"#, preset);
        let swap: ControlCommand = serde_json::from_str(&line).unwrap();
        engine.apply_control(swap).unwrap();
        assert_eq!(*engine.active_strategy(), presets::all()[0].config);

        let unknown = ControlCommand::SetStrategy {
            preset: "no-such-preset".to_string(),
        };
        assert!(engine.apply_control(unknown).is_err());
    }

    #[test]
    fn test_phase_display_pads() {
        assert_eq!(format!("{:<8}|", Phase::Open), "open    |");
        assert_eq!(Phase::Reducing.to_string(), "reducing");
    }
}
