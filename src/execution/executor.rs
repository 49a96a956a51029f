// =============================================================================
// Order Executor — from approved signal to venue submission and fills
// =============================================================================
//
// Pipeline per signal: risk evaluation, order record persisted as NEW,
// gateway acquisition by (user, connection), balance lock, venue submission
// under a 10 s timeout, status translation, fill bookkeeping. Fill updates
// arriving through the venue user-data stream flow back over the bus and
// mutate positions, balances, and risk metrics here — the executor is the
// sole writer of order state.
//
// A persistence failure after submission marks the order UNKNOWN so the
// reconciliation loop can resolve it. Executor errors stay scoped to the
// offending order and never fail the pipeline.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::balance::BalanceRegistry;
use crate::bus::{Event, EventBus, PositionChange, RiskAlert, Topic};
use crate::errors::CoreError;
use crate::gateway::{GatewayPool, OrderRequest};
use crate::indicators::IndicatorEngine;
use crate::risk::{RiskManagerRegistry, SignalInput};
use crate::store::Store;
use crate::strategy::StrategyEngine;
use crate::types::{
    AccountSnapshot, Order, OrderSide, OrderStatus, OrderType, OrderUpdate, Signal, SignalAction,
    TradeResult,
};

use super::queue::OrderQueue;

/// Per-call venue timeout.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OrderExecutor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    pool: Arc<GatewayPool>,
    risk: Arc<RiskManagerRegistry>,
    balances: Arc<BalanceRegistry>,
    queue: Arc<OrderQueue>,
    engine: Arc<StrategyEngine>,
    indicators: Arc<IndicatorEngine>,
}

impl OrderExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        pool: Arc<GatewayPool>,
        risk: Arc<RiskManagerRegistry>,
        balances: Arc<BalanceRegistry>,
        queue: Arc<OrderQueue>,
        engine: Arc<StrategyEngine>,
        indicators: Arc<IndicatorEngine>,
    ) -> Self {
        Self {
            store,
            bus,
            pool,
            risk,
            balances,
            queue,
            engine,
            indicators,
        }
    }

    // -------------------------------------------------------------------------
    // Signal intake
    // -------------------------------------------------------------------------

    /// Evaluate a strategy signal against risk policy and enqueue the
    /// resulting order. Rejections surface as `risk_alert` events.
    pub fn handle_signal(&self, signal: &Signal) {
        let side = match signal.action {
            SignalAction::Buy => OrderSide::Buy,
            SignalAction::Sell => OrderSide::Sell,
            // HOLD is non-actionable; panic closes are enqueued directly by
            // the strategy engine.
            SignalAction::Hold | SignalAction::PanicSell => return,
        };

        let definition = match self.engine.definition(&signal.strategy_id) {
            Some(def) => Some(def),
            None => match self.store.get_strategy(&signal.strategy_id) {
                Ok(def) => def,
                Err(e) => {
                    warn!(strategy_id = %signal.strategy_id, error = %e, "signal lookup failed");
                    return;
                }
            },
        };
        let Some(definition) = definition else {
            warn!(strategy_id = %signal.strategy_id, "signal from unknown strategy — ignored");
            return;
        };
        let Some(connection_id) = definition.connection_id.clone() else {
            debug!(strategy_id = %signal.strategy_id, "unbound strategy signal — not tradable");
            return;
        };
        let user_id = definition.user_id.clone().unwrap_or_default();
        if user_id.is_empty() {
            debug!(strategy_id = %signal.strategy_id, "unowned strategy signal — not tradable");
            return;
        }

        let price = self
            .indicators
            .snapshot(&signal.symbol)
            .map(|s| s.last_price)
            .unwrap_or(0.0);
        if price <= 0.0 || signal.size <= 0.0 {
            warn!(
                strategy_id = %signal.strategy_id,
                price,
                size = signal.size,
                "signal failed validation — no order created"
            );
            return;
        }

        let input = SignalInput {
            symbol: signal.symbol.clone(),
            action: signal.action,
            size: signal.size,
            price,
            strategy_id: Some(signal.strategy_id.clone()),
            user_id: user_id.clone(),
        };
        let account = self.account_snapshot(&user_id);
        let evaluator = self.risk.get_or_create(&user_id);
        let decision = evaluator.evaluate(&input, &account);

        if !decision.allowed || decision.warning.is_some() {
            self.bus.publish(
                Topic::RiskAlert,
                Event::RiskAlert(RiskAlert {
                    user_id: user_id.clone(),
                    strategy_id: Some(signal.strategy_id.clone()),
                    symbol: signal.symbol.clone(),
                    decision: decision.clone(),
                    at: Utc::now().to_rfc3339(),
                }),
            );
        }
        if !decision.allowed {
            info!(
                strategy_id = %signal.strategy_id,
                reason = decision.reason.as_deref().unwrap_or("unspecified"),
                "signal rejected by risk policy"
            );
            return;
        }

        let order = Order {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: Some(signal.strategy_id.clone()),
            user_id,
            connection_id,
            symbol: signal.symbol.clone(),
            side,
            order_type: OrderType::Market,
            price,
            qty: decision.adjusted_size,
            filled_qty: 0.0,
            status: OrderStatus::New,
            venue_order_id: None,
            created_at: Utc::now(),
        };
        self.enqueue_order(order);
    }

    /// Validate and enqueue a manually constructed order.
    pub fn submit_manual(&self, order: Order) -> Result<(), CoreError> {
        if order.qty <= 0.0 {
            return Err(CoreError::Validation(format!(
                "order quantity must be positive, got {}",
                order.qty
            )));
        }
        if order.user_id.is_empty() {
            return Err(CoreError::UserIdRequired);
        }
        self.enqueue_order(order);
        Ok(())
    }

    fn enqueue_order(&self, order: Order) {
        if let Err(e) = self.store.insert_order(&order) {
            error!(order_id = %order.id, error = %e, "failed to persist new order");
            return;
        }
        if !self.queue.enqueue(order.clone()) {
            let _ = self
                .store
                .update_order_fill(&order.id, OrderStatus::Rejected, 0.0, None);
            self.bus
                .publish(Topic::OrderRejected, Event::Order(order));
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit one queued order to its venue.
    pub async fn submit(&self, mut order: Order) {
        // 1. Gateway acquisition.
        let gateway = match self
            .pool
            .get_or_create(&order.user_id, &order.connection_id)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "gateway unavailable — order rejected");
                self.reject(&order).await;
                return;
            }
        };

        // 2. Balance lock (buys reserve quote currency up front).
        let required = order.notional();
        let balance = self.balances.get_or_create(&order.user_id);
        if order.side == OrderSide::Buy && !balance.lock(required) {
            let snapshot = balance.snapshot();
            warn!(
                order_id = %order.id,
                needed = required,
                available = snapshot.available,
                "insufficient balance — order rejected"
            );
            self.reject(&order).await;
            return;
        }

        // 3. Rate-limit accounting: delay briefly near the window ceiling,
        // then requeue rather than burst past it.
        let window = self.pool.weight_window(gateway.exchange());
        if !window.try_acquire(1) {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if !window.try_acquire(1) {
                warn!(order_id = %order.id, "rate-limit window saturated — order requeued");
                if order.side == OrderSide::Buy {
                    balance.unlock(required);
                }
                if !self.queue.enqueue(order.clone()) {
                    self.reject(&order).await;
                }
                return;
            }
        }

        // 4. Venue submission with a per-call timeout.
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            qty: order.qty,
            price: (order.price > 0.0).then_some(order.price),
            client_order_id: order.id.clone(),
        };
        let submitted = tokio::time::timeout(SUBMIT_TIMEOUT, gateway.submit_order(&request)).await;

        match submitted {
            Ok(Ok(result)) => {
                self.pool.record_success(&order.connection_id);
                order.venue_order_id = Some(result.venue_order_id.clone());
                let persisted = self.store.update_order_fill(
                    &order.id,
                    OrderStatus::New,
                    0.0,
                    Some(&result.venue_order_id),
                );
                if let Err(e) = persisted {
                    error!(order_id = %order.id, error = %e, "post-submit persistence failed — order UNKNOWN");
                    let _ = self
                        .store
                        .update_order_fill(&order.id, OrderStatus::Unknown, 0.0, None);
                }
                self.bus
                    .publish(Topic::OrderSubmitted, Event::Order(order.clone()));
                self.bus
                    .publish(Topic::OrderAccepted, Event::Order(order.clone()));
                info!(
                    order_id = %order.id,
                    venue_order_id = %result.venue_order_id,
                    status = %result.status,
                    "order submitted"
                );

                // Venues that fill synchronously (paper, aggressive market
                // orders) report progress in the submit response; feed it
                // through the same update path the user-data stream uses.
                if result.filled_qty > 0.0 {
                    self.bus.publish(
                        Topic::OrderUpdate,
                        Event::OrderUpdate(OrderUpdate {
                            order_id: order.id.clone(),
                            status: result.status,
                            filled_qty: result.filled_qty,
                            fill_price: result.avg_fill_price.unwrap_or(order.price),
                            fee: 0.0,
                            ts: Utc::now().timestamp_millis(),
                        }),
                    );
                }
            }
            Ok(Err(e)) => {
                self.pool.record_failure(&order.connection_id);
                warn!(order_id = %order.id, error = %e, "venue rejected order");
                if order.side == OrderSide::Buy {
                    balance.unlock(required);
                }
                self.reject(&order).await;
            }
            Err(_elapsed) => {
                // Timed out: the venue may or may not hold the order.
                self.pool.record_failure(&order.connection_id);
                error!(order_id = %order.id, "venue submit timed out — order UNKNOWN");
                let _ = self
                    .store
                    .update_order_fill(&order.id, OrderStatus::Unknown, 0.0, None);
            }
        }
    }

    async fn reject(&self, order: &Order) {
        let _ = self
            .store
            .update_order_fill(&order.id, OrderStatus::Rejected, 0.0, None);
        self.bus
            .publish(Topic::OrderRejected, Event::Order(order.clone()));
    }

    /// Cancel an open order on its venue and release held balance.
    pub async fn cancel(&self, order_id: &str) -> Result<(), CoreError> {
        let order = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| CoreError::NotFound(format!("order {order_id}")))?;
        if order.status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "order {order_id} already {}",
                order.status
            )));
        }
        let gateway = self
            .pool
            .get_or_create(&order.user_id, &order.connection_id)
            .await?;
        if let Some(venue_id) = &order.venue_order_id {
            tokio::time::timeout(
                SUBMIT_TIMEOUT,
                gateway.cancel_order(&order.symbol, venue_id),
            )
            .await
            .map_err(|_| CoreError::Gateway("cancel timed out".into()))??;
        }
        self.store
            .update_order_fill(order_id, OrderStatus::Canceled, order.filled_qty, None)?;
        if order.side == OrderSide::Buy {
            let remaining = (order.qty - order.filled_qty).max(0.0) * order.price;
            self.balances.get_or_create(&order.user_id).unlock(remaining);
        }
        info!(order_id, "order canceled");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fill handling
    // -------------------------------------------------------------------------

    /// Apply one asynchronous order update: order row, positions, balance,
    /// risk metrics, and the profit-target auto-stop.
    pub fn handle_order_update(&self, update: &OrderUpdate) {
        let order = match self.store.get_order(&update.order_id) {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(order_id = %update.order_id, "update for unknown order — reconciliation will resolve");
                return;
            }
            Err(e) => {
                error!(order_id = %update.order_id, error = %e, "order lookup failed");
                return;
            }
        };
        if order.status.is_terminal() {
            debug!(order_id = %order.id, "update for terminal order ignored");
            return;
        }

        let fill_delta = (update.filled_qty - order.filled_qty).max(0.0);
        match self.store.update_order_fill(
            &order.id,
            update.status,
            update.filled_qty,
            None,
        ) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "fill persistence failed — order UNKNOWN");
                let _ = self
                    .store
                    .update_order_fill(&order.id, OrderStatus::Unknown, order.filled_qty, None);
                return;
            }
        }

        if fill_delta > 0.0 {
            self.apply_fill(&order, update, fill_delta);
        }

        // Release leftover locked funds when a buy terminates short of full.
        if update.status.is_terminal() && order.side == OrderSide::Buy {
            let unfilled = (order.qty - update.filled_qty).max(0.0);
            if unfilled > 0.0 {
                self.balances
                    .get_or_create(&order.user_id)
                    .unlock(unfilled * order.price);
            }
        }

        match update.status {
            OrderStatus::Filled => {
                self.bus
                    .publish(Topic::OrderFilled, Event::Order(order.clone()));
            }
            OrderStatus::Partial => {
                self.bus
                    .publish(Topic::OrderPartiallyFilled, Event::Order(order.clone()));
            }
            _ => {}
        }
    }

    fn apply_fill(&self, order: &Order, update: &OrderUpdate, fill_delta: f64) {
        let outcome = match self.store.apply_position_fill(
            &order.user_id,
            order.strategy_id.as_deref(),
            &order.symbol,
            order.side,
            fill_delta,
            update.fill_price,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "position update failed");
                return;
            }
        };

        // Settle balance: buys consume the locked quote, sells credit it.
        let notional = fill_delta * update.fill_price;
        let balance = self.balances.get_or_create(&order.user_id);
        match order.side {
            OrderSide::Buy => balance.deduct(fill_delta * order.price),
            OrderSide::Sell => balance.add(notional),
        }

        let trade = TradeResult {
            symbol: order.symbol.clone(),
            side: order.side,
            size: fill_delta,
            price: update.fill_price,
            pnl: outcome.realized_delta - update.fee,
            fee: update.fee,
        };
        if let Err(e) = self.store.record_fill(&order.id, &order.user_id, &trade) {
            warn!(order_id = %order.id, error = %e, "fill journal write failed");
        }
        self.risk.get_or_create(&order.user_id).update_metrics(&trade);

        self.bus.publish(
            Topic::PositionChange,
            Event::PositionChange(PositionChange {
                user_id: order.user_id.clone(),
                strategy_id: order.strategy_id.clone(),
                symbol: order.symbol.clone(),
                qty: outcome.state.qty,
                avg_price: outcome.state.avg_price,
                realized_pnl: outcome.state.realized_pnl,
            }),
        );

        if let Some(strategy_id) = &order.strategy_id {
            if let Err(e) = self.engine.maybe_stop_for_profit_target(strategy_id) {
                warn!(strategy_id = %strategy_id, error = %e, "profit target check failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Drain loop
    // -------------------------------------------------------------------------

    /// Consume queued orders, strategy signals, and venue order updates
    /// until cancellation. In-flight submissions finish before exit.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let signals = self.bus.subscribe(Topic::StrategySignal, 256);
        let updates = self.bus.subscribe(Topic::OrderUpdate, 1024);
        info!("order executor loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                order = self.queue.recv() => {
                    self.submit(order).await;
                }
                ev = signals.recv() => match ev {
                    Some(ev) => {
                        if let Event::Signal(signal) = ev.as_ref() {
                            self.handle_signal(signal);
                        }
                    }
                    None => break,
                },
                ev = updates.recv() => match ev {
                    Some(ev) => {
                        if let Event::OrderUpdate(update) = ev.as_ref() {
                            self.handle_order_update(update);
                        }
                    }
                    None => break,
                },
            }
        }
        // Drain anything still queued so unacknowledged work is visible as
        // UNKNOWN rather than silently lost.
        while let Some(order) = self.queue.pop() {
            let _ = self
                .store
                .update_order_fill(&order.id, OrderStatus::Unknown, 0.0, None);
            warn!(order_id = %order.id, "undelivered order marked UNKNOWN at shutdown");
        }
        info!("order executor loop stopped");
    }

    // -------------------------------------------------------------------------
    // Account view
    // -------------------------------------------------------------------------

    fn account_snapshot(&self, user_id: &str) -> AccountSnapshot {
        let balance = self.balances.get_or_create(user_id).snapshot();
        let exposure = self
            .store
            .global_positions(user_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|p| {
                        let price = self
                            .indicators
                            .snapshot(&p.symbol)
                            .map(|s| s.last_price)
                            .unwrap_or(p.avg_price);
                        p.qty.abs() * price
                    })
                    .sum()
            })
            .unwrap_or(0.0);
        AccountSnapshot {
            equity: balance.total,
            total_exposure: exposure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{KeyManager, PaperGateway, PoolConfig, VenueGateway};
    use crate::market_data::StaticHistory;
    use crate::risk::RiskConfig;
    use crate::types::{ConnectionRecord, StrategyDefinition, StrategyStatus};
    use parking_lot::RwLock;

    struct Fixture {
        store: Arc<Store>,
        bus: Arc<EventBus>,
        executor: Arc<OrderExecutor>,
        balances: Arc<BalanceRegistry>,
        indicators: Arc<IndicatorEngine>,
        queue: Arc<OrderQueue>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let indicators = Arc::new(IndicatorEngine::new(256));
        let queue = Arc::new(OrderQueue::new(32, 32));
        let keys = Arc::new(KeyManager::from_keys([(1, "exec-test".to_string())]).unwrap());

        store
            .upsert_connection(&ConnectionRecord {
                id: "c1".into(),
                user_id: "u1".into(),
                exchange_type: "paper".into(),
                name: "main".into(),
                encrypted_api_key: keys.encrypt("k").unwrap(),
                encrypted_api_secret: keys.encrypt("s").unwrap(),
                key_version: 1,
                active: true,
                created_at: Utc::now(),
            })
            .unwrap();

        let pool = Arc::new(GatewayPool::new(
            store.clone(),
            keys,
            PoolConfig::default(),
        ));
        pool.register_factory(
            "paper",
            Arc::new(|_creds| {
                Ok(Arc::new(PaperGateway::new(1_000_000.0)) as Arc<dyn VenueGateway>)
            }),
        );

        let risk = Arc::new(RiskManagerRegistry::new(
            Arc::new(RwLock::new(RiskConfig::default())),
            store.clone(),
        ));
        let balances = Arc::new(BalanceRegistry::new(100_000.0));
        let engine = Arc::new(StrategyEngine::new(
            store.clone(),
            bus.clone(),
            indicators.clone(),
            Arc::new(StaticHistory::new()),
            queue.clone(),
        ));
        engine
            .create(StrategyDefinition {
                id: "s1".into(),
                strategy_type: "ma_cross".into(),
                symbol: "BTCUSDT".into(),
                interval: "1m".into(),
                params: serde_json::json!({"fast": 3, "slow": 10, "size": 1.0}),
                user_id: Some("u1".into()),
                connection_id: Some("c1".into()),
                status: StrategyStatus::Active,
            })
            .await
            .unwrap();

        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            bus.clone(),
            pool,
            risk,
            balances.clone(),
            queue.clone(),
            engine,
            indicators.clone(),
        ));
        Fixture {
            store,
            bus,
            executor,
            balances,
            indicators,
            queue,
        }
    }

    fn signal(action: SignalAction, size: f64) -> Signal {
        Signal {
            strategy_id: "s1".into(),
            action,
            symbol: "BTCUSDT".into(),
            size,
            note: None,
        }
    }

    fn process_pending_updates(f: &Fixture, updates: &crate::bus::Subscription) {
        while let Some(ev) = updates.try_recv() {
            if let Event::OrderUpdate(u) = ev.as_ref() {
                f.executor.handle_order_update(u);
            }
        }
    }

    #[tokio::test]
    async fn approved_signal_flows_to_filled_order() {
        let f = fixture().await;
        f.indicators.update("BTCUSDT", 100.0);
        let updates = f.bus.subscribe(Topic::OrderUpdate, 64);

        f.executor.handle_signal(&signal(SignalAction::Buy, 1.0));
        let order = f.queue.pop().expect("order enqueued");
        assert_eq!(order.status, OrderStatus::New);

        f.executor.submit(order.clone()).await;
        process_pending_updates(&f, &updates);

        let stored = f.store.get_order(&order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert!((stored.filled_qty - 1.0).abs() < 1e-12);

        let pos = f
            .store
            .position_for("u1", Some("s1"), "BTCUSDT")
            .unwrap()
            .unwrap();
        assert!((pos.qty - 1.0).abs() < 1e-12);
        assert!((pos.avg_price - 100.0).abs() < 1e-12);

        // The buy consumed its locked quote balance.
        let bal = f.balances.get_or_create("u1").snapshot();
        assert!((bal.total - 99_900.0).abs() < 1e-6);
        assert_eq!(bal.locked, 0.0);
    }

    #[tokio::test]
    async fn risk_rejection_publishes_alert_and_no_order() {
        let f = fixture().await;
        f.indicators.update("BTCUSDT", 100.0);
        let alerts = f.bus.subscribe(Topic::RiskAlert, 16);

        // Notional far above the max order bound: rejected, not clipped.
        f.executor.handle_signal(&signal(SignalAction::Buy, 5_000.0));
        assert!(f.queue.pop().is_none());
        let alert = alerts.try_recv().expect("risk alert published");
        match alert.as_ref() {
            Event::RiskAlert(a) => assert!(!a.decision.allowed),
            other => panic!("expected risk alert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn insufficient_balance_rejects_order() {
        let f = fixture().await;
        f.indicators.update("BTCUSDT", 100.0);
        let rejected = f.bus.subscribe(Topic::OrderRejected, 16);

        // Drain the user's funds below the order notional.
        let balance = f.balances.get_or_create("u1");
        assert!(balance.lock(99_950.0));

        f.executor.handle_signal(&signal(SignalAction::Buy, 1.0));
        let order = f.queue.pop().unwrap();
        f.executor.submit(order.clone()).await;

        let stored = f.store.get_order(&order.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        assert!(rejected.try_recv().is_some());
    }

    #[tokio::test]
    async fn unknown_gateway_rejects_order() {
        let f = fixture().await;
        f.indicators.update("BTCUSDT", 100.0);
        let order = Order {
            id: "manual-1".into(),
            strategy_id: None,
            user_id: "u1".into(),
            connection_id: "missing-conn".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            price: 100.0,
            qty: 1.0,
            filled_qty: 0.0,
            status: OrderStatus::New,
            venue_order_id: None,
            created_at: Utc::now(),
        };
        f.executor.submit_manual(order.clone()).unwrap();
        let queued = f.queue.pop().unwrap();
        f.executor.submit(queued).await;
        let stored = f.store.get_order("manual-1").unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn manual_order_validation() {
        let f = fixture().await;
        let mut order = Order {
            id: "m1".into(),
            strategy_id: None,
            user_id: "u1".into(),
            connection_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: 100.0,
            qty: 0.0,
            filled_qty: 0.0,
            status: OrderStatus::New,
            venue_order_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            f.executor.submit_manual(order.clone()).unwrap_err().code(),
            "INVALID"
        );
        order.qty = 1.0;
        order.user_id = String::new();
        assert_eq!(
            f.executor.submit_manual(order).unwrap_err().code(),
            "USER_ID_REQUIRED"
        );
    }

    #[tokio::test]
    async fn sell_fill_realises_pnl_into_metrics() {
        let f = fixture().await;
        f.indicators.update("BTCUSDT", 100.0);
        let updates = f.bus.subscribe(Topic::OrderUpdate, 64);

        // Open long 1 @ 100.
        f.executor.handle_signal(&signal(SignalAction::Buy, 1.0));
        let buy = f.queue.pop().unwrap();
        f.executor.submit(buy).await;
        process_pending_updates(&f, &updates);

        // Close 1 @ 110.
        f.indicators.update("BTCUSDT", 110.0);
        f.executor.handle_signal(&signal(SignalAction::Sell, 1.0));
        let sell = f.queue.pop().unwrap();
        f.executor.submit(sell).await;
        process_pending_updates(&f, &updates);

        let pos = f
            .store
            .position_for("u1", Some("s1"), "BTCUSDT")
            .unwrap()
            .unwrap();
        assert_eq!(pos.qty, 0.0);
        assert!((pos.realized_pnl - 10.0).abs() < 1e-9);

        let metrics = f
            .store
            .load_daily_metrics("u1", chrono::Local::now().date_naive())
            .unwrap()
            .unwrap();
        assert_eq!(metrics.daily_trades, 2);
        assert!((metrics.daily_pnl - 10.0).abs() < 1e-9);
        assert_eq!(metrics.daily_losses, 0.0);
    }

    #[tokio::test]
    async fn terminal_orders_ignore_further_updates() {
        let f = fixture().await;
        f.indicators.update("BTCUSDT", 100.0);
        let updates = f.bus.subscribe(Topic::OrderUpdate, 64);

        f.executor.handle_signal(&signal(SignalAction::Buy, 1.0));
        let order = f.queue.pop().unwrap();
        f.executor.submit(order.clone()).await;
        process_pending_updates(&f, &updates);

        // A late duplicate update must not double-apply the fill.
        f.executor.handle_order_update(&OrderUpdate {
            order_id: order.id.clone(),
            status: OrderStatus::Filled,
            filled_qty: 1.0,
            fill_price: 100.0,
            fee: 0.0,
            ts: 0,
        });
        let pos = f
            .store
            .position_for("u1", Some("s1"), "BTCUSDT")
            .unwrap()
            .unwrap();
        assert!((pos.qty - 1.0).abs() < 1e-12, "fill applied twice");
    }
}
