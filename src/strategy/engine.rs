// =============================================================================
// Strategy Engine — hosts instances, dispatches ticks, manages lifecycle
// =============================================================================
//
// On startup every ACTIVE or PAUSED instance is loaded from the store,
// rehydrated from its serialised state, and warmed up by silently replaying
// up to 100 recent closed bars. The dispatch task is the single writer of
// all instance state. A strategy's own error never propagates upward: it is
// logged and the engine moves on.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::errors::CoreError;
use crate::execution::OrderQueue;
use crate::indicators::IndicatorEngine;
use crate::market_data::BarHistory;
use crate::store::Store;
use crate::types::{
    Order, OrderSide, OrderStatus, OrderType, PriceTick, Signal, SignalAction,
    StrategyDefinition, StrategyStatus,
};
use crate::strategy::Strategy;

/// Bars replayed during warm-up.
const WARMUP_BARS: u32 = 100;

struct StrategyRuntime {
    strategy: Strategy,
    definition: StrategyDefinition,
    last_signal: Option<SignalAction>,
}

pub struct StrategyEngine {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    indicators: Arc<IndicatorEngine>,
    history: Arc<dyn BarHistory>,
    queue: Arc<OrderQueue>,
    instances: RwLock<HashMap<String, StrategyRuntime>>,
    paused: RwLock<HashSet<String>>,
}

impl StrategyEngine {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        indicators: Arc<IndicatorEngine>,
        history: Arc<dyn BarHistory>,
        queue: Arc<OrderQueue>,
    ) -> Self {
        Self {
            store,
            bus,
            indicators,
            history,
            queue,
            instances: RwLock::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Load every ACTIVE or PAUSED instance from the store. Per-instance
    /// failures are logged and skipped.
    pub async fn load_all(&self) -> Result<usize, CoreError> {
        let defs = self
            .store
            .load_strategies(&[StrategyStatus::Active, StrategyStatus::Paused])?;
        let mut loaded = 0;
        for def in defs {
            match self.instantiate(&def).await {
                Ok(strategy) => {
                    if def.status == StrategyStatus::Paused {
                        self.paused.write().insert(def.id.clone());
                    }
                    self.instances.write().insert(
                        def.id.clone(),
                        StrategyRuntime {
                            strategy,
                            definition: def,
                            last_signal: None,
                        },
                    );
                    loaded += 1;
                }
                Err(e) => {
                    error!(strategy_id = %def.id, error = %e, "failed to load strategy — skipped");
                }
            }
        }
        info!(loaded, "strategy instances loaded");
        Ok(loaded)
    }

    /// Build a variant, restore persisted state, and warm it up.
    async fn instantiate(&self, def: &StrategyDefinition) -> Result<Strategy, CoreError> {
        let mut strategy = Strategy::from_definition(def, &self.bus)?;
        if let Some(state) = self.store.load_strategy_state(&def.id)? {
            if let Err(e) = strategy.set_state(state) {
                warn!(strategy_id = %def.id, error = %e, "stale state rejected — starting cold");
            }
        }
        self.warm_up(&mut strategy, def).await;
        Ok(strategy)
    }

    /// Replay recent closed bars through the strategy without publishing.
    async fn warm_up(&self, strategy: &mut Strategy, def: &StrategyDefinition) {
        let bars = match self
            .history
            .recent_bars(&def.symbol, &def.interval, WARMUP_BARS)
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(strategy_id = %def.id, error = %e, "warm-up history fetch failed");
                return;
            }
        };
        if bars.is_empty() {
            return;
        }
        // Warm-up indicators run over a scratch window so the live shared
        // engine only sees real ticks.
        let scratch = IndicatorEngine::new(WARMUP_BARS as usize);
        for bar in &bars {
            let snapshot = scratch.update(&def.symbol, bar.close);
            let _ = strategy.on_tick(&def.symbol, bar.close, &snapshot);
        }
        debug!(strategy_id = %def.id, bars = bars.len(), "strategy warmed up");
    }

    /// Register a brand-new instance: persist, then load into memory.
    pub async fn create(&self, def: StrategyDefinition) -> Result<(), CoreError> {
        let strategy = self.instantiate(&def).await?;
        self.store.upsert_strategy(&def)?;
        if def.status == StrategyStatus::Paused {
            self.paused.write().insert(def.id.clone());
        }
        self.instances.write().insert(
            def.id.clone(),
            StrategyRuntime {
                strategy,
                definition: def,
                last_signal: None,
            },
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tick dispatch
    // -------------------------------------------------------------------------

    /// Dispatch one tick to every non-paused instance trading its symbol.
    pub fn handle_tick(&self, tick: &PriceTick) {
        let snapshot = self.indicators.update(&tick.symbol, tick.price);
        let paused = self.paused.read().clone();

        let mut outgoing: Vec<Signal> = Vec::new();
        {
            let mut instances = self.instances.write();
            for (id, runtime) in instances.iter_mut() {
                if runtime.definition.symbol != tick.symbol || paused.contains(id) {
                    continue;
                }
                let signal = runtime
                    .strategy
                    .on_tick(&tick.symbol, tick.price, &snapshot);
                let Some(signal) = signal else { continue };
                if signal.action == SignalAction::Hold {
                    continue;
                }
                if !Strategy::dedup(runtime.last_signal, signal.action) {
                    continue;
                }
                runtime.last_signal = Some(signal.action);
                outgoing.push(signal);
            }
        }

        for signal in outgoing {
            debug!(
                strategy_id = %signal.strategy_id,
                action = %signal.action,
                symbol = %signal.symbol,
                size = signal.size,
                "strategy signal published"
            );
            self.bus.publish(Topic::StrategySignal, Event::Signal(signal));
        }
    }

    /// Consume the price-tick topic until cancellation, then persist state.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let sub = self.bus.subscribe(Topic::PriceTick, 1024);
        info!("strategy dispatch loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                ev = sub.recv() => match ev {
                    Some(ev) => {
                        if let Event::Tick(tick) = ev.as_ref() {
                            self.handle_tick(tick);
                        }
                    }
                    None => break,
                }
            }
        }
        if let Err(e) = self.persist_all() {
            error!(error = %e, "failed to persist strategy state on shutdown");
        }
        info!("strategy dispatch loop stopped");
    }

    // -------------------------------------------------------------------------
    // Lifecycle operations
    // -------------------------------------------------------------------------

    pub fn pause(&self, id: &str) -> Result<(), CoreError> {
        self.store.set_strategy_status(id, StrategyStatus::Paused)?;
        self.paused.write().insert(id.to_string());
        info!(strategy_id = %id, "strategy paused");
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<(), CoreError> {
        self.store.set_strategy_status(id, StrategyStatus::Active)?;
        self.paused.write().remove(id);
        if !self.instances.read().contains_key(id) {
            let def = self
                .store
                .get_strategy(id)?
                .ok_or_else(|| CoreError::NotFound(format!("strategy {id}")))?;
            let strategy = self.instantiate(&def).await?;
            self.instances.write().insert(
                id.to_string(),
                StrategyRuntime {
                    strategy,
                    definition: def,
                    last_signal: None,
                },
            );
        }
        info!(strategy_id = %id, "strategy resumed");
        Ok(())
    }

    /// Stop: persist final state, drop from memory, mark STOPPED. Open
    /// positions are left untouched.
    pub fn stop(&self, id: &str) -> Result<(), CoreError> {
        let removed = self.instances.write().remove(id);
        if let Some(runtime) = &removed {
            if let Some(state) = runtime.strategy.get_state() {
                self.store.save_strategy_state(id, &state)?;
            }
        }
        self.paused.write().remove(id);
        self.store.set_strategy_status(id, StrategyStatus::Stopped)?;
        info!(strategy_id = %id, "strategy stopped");
        Ok(())
    }

    /// Panic: market-close any open per-strategy position, then stop.
    pub fn panic(&self, id: &str) -> Result<(), CoreError> {
        let definition = {
            let instances = self.instances.read();
            instances.get(id).map(|r| r.definition.clone())
        };
        let definition = match definition {
            Some(d) => d,
            None => self
                .store
                .get_strategy(id)?
                .ok_or_else(|| CoreError::NotFound(format!("strategy {id}")))?,
        };

        if let Some((symbol, position)) = self.store.position_for_strategy(id)? {
            let qty = position.qty.abs();
            if qty > 0.0 {
                let side = if position.qty > 0.0 {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                };
                match &definition.connection_id {
                    Some(connection_id) => {
                        let order = Order {
                            id: uuid::Uuid::new_v4().to_string(),
                            strategy_id: Some(id.to_string()),
                            user_id: definition.user_id.clone().unwrap_or_default(),
                            connection_id: connection_id.clone(),
                            symbol: symbol.clone(),
                            side,
                            order_type: OrderType::Market,
                            price: position.avg_price,
                            qty,
                            filled_qty: 0.0,
                            status: OrderStatus::New,
                            venue_order_id: None,
                            created_at: Utc::now(),
                        };
                        if !self.queue.enqueue(order) {
                            warn!(strategy_id = %id, "panic close order dropped by saturated queue");
                        }
                    }
                    None => {
                        warn!(strategy_id = %id, "panic with no bound connection — position left open");
                    }
                }
                self.bus.publish(
                    Topic::StrategySignal,
                    Event::Signal(Signal {
                        strategy_id: id.to_string(),
                        action: SignalAction::PanicSell,
                        symbol,
                        size: qty,
                        note: Some("administrative panic close".into()),
                    }),
                );
            }
        }

        self.stop(id)
    }

    /// Persist new params, then rebuild the instance from the store so the
    /// surviving state rehydrates under the new configuration.
    pub async fn update_params(
        &self,
        id: &str,
        params: serde_json::Value,
    ) -> Result<(), CoreError> {
        self.store.update_strategy_params(id, &params)?;

        let previous = self.instances.write().remove(id);
        let Some(previous) = previous else {
            return Ok(()); // not loaded: nothing to rebuild
        };
        if let Some(state) = previous.strategy.get_state() {
            self.store.save_strategy_state(id, &state)?;
        }

        let def = self
            .store
            .get_strategy(id)?
            .ok_or_else(|| CoreError::NotFound(format!("strategy {id}")))?;
        let strategy = self.instantiate(&def).await?;
        self.instances.write().insert(
            id.to_string(),
            StrategyRuntime {
                strategy,
                definition: def,
                last_signal: previous.last_signal,
            },
        );
        info!(strategy_id = %id, "strategy params updated and instance rebuilt");
        Ok(())
    }

    /// Serialise every loaded instance's state into the store.
    pub fn persist_all(&self) -> Result<(), CoreError> {
        let instances = self.instances.read();
        for (id, runtime) in instances.iter() {
            if let Some(state) = runtime.strategy.get_state() {
                self.store.save_strategy_state(id, &state)?;
            }
        }
        debug!(count = instances.len(), "strategy state persisted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Profit-target auto-stop
    // -------------------------------------------------------------------------

    /// Stop the strategy once its realised PnL reaches the configured
    /// target. Called by the executor after fills. Returns whether a stop
    /// fired.
    pub fn maybe_stop_for_profit_target(&self, id: &str) -> Result<bool, CoreError> {
        let Some(override_) = self.store.load_risk_override(id)? else {
            return Ok(false);
        };
        let realized = self.store.realized_pnl_for_strategy(id)?;

        let absolute_hit = override_
            .profit_target
            .map_or(false, |target| realized >= target);
        let pct_hit = match (override_.profit_target_pct, override_.profit_target_baseline) {
            (Some(pct), Some(baseline)) if baseline > 0.0 => {
                realized >= baseline * pct / 100.0
            }
            _ => false,
        };

        if absolute_hit || pct_hit {
            info!(
                strategy_id = %id,
                realized_pnl = realized,
                "profit target reached — stopping strategy"
            );
            self.stop(id)?;
            return Ok(true);
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn loaded_ids(&self) -> Vec<String> {
        self.instances.read().keys().cloned().collect()
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.paused.read().contains(id)
    }

    pub fn definition(&self, id: &str) -> Option<StrategyDefinition> {
        self.instances.read().get(id).map(|r| r.definition.clone())
    }
}
