// =============================================================================
// Control Service — the in-process surface the HTTP layer translates over
// =============================================================================
//
// Strategy lifecycle commands, entity queries, risk and performance views,
// and the system status snapshot. No wire format lives here.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::balance::{BalanceRegistry, BalanceSnapshot};
use crate::errors::{CoreError, ErrorRecord};
use crate::execution::{OrderExecutor, OrderQueue, QueueMetrics};
use crate::gateway::{GatewayPool, PoolStats};
use crate::risk::{DailyMetrics, RiskManagerRegistry};
use crate::store::{DailyPerformance, Store, SymbolPosition};
use crate::strategy::StrategyEngine;
use crate::types::{Order, StrategyDefinition};

/// Recent command errors retained for the control layer.
const MAX_RECENT_ERRORS: usize = 50;

/// Aggregated engine health for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub uptime_secs: u64,
    pub loaded_strategies: usize,
    pub queue: QueueMetrics,
    pub pool: PoolStats,
    pub risk_evaluators: usize,
    pub recent_error_count: usize,
    pub dry_run: bool,
}

pub struct CoreService {
    store: Arc<Store>,
    engine: Arc<StrategyEngine>,
    executor: Arc<OrderExecutor>,
    risk: Arc<RiskManagerRegistry>,
    balances: Arc<BalanceRegistry>,
    pool: Arc<GatewayPool>,
    queue: Arc<OrderQueue>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    started: Instant,
    dry_run: bool,
}

impl CoreService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        engine: Arc<StrategyEngine>,
        executor: Arc<OrderExecutor>,
        risk: Arc<RiskManagerRegistry>,
        balances: Arc<BalanceRegistry>,
        pool: Arc<GatewayPool>,
        queue: Arc<OrderQueue>,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            engine,
            executor,
            risk,
            balances,
            pool,
            queue,
            recent_errors: RwLock::new(Vec::new()),
            started: Instant::now(),
            dry_run,
        }
    }

    /// Record a command failure in the capped ring, then hand it back.
    fn track<T>(&self, result: Result<T, CoreError>) -> Result<T, CoreError> {
        if let Err(err) = &result {
            let mut errors = self.recent_errors.write();
            errors.push(ErrorRecord::from_error(err, None));
            while errors.len() > MAX_RECENT_ERRORS {
                errors.remove(0);
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // Strategy lifecycle commands
    // -------------------------------------------------------------------------

    pub async fn create_strategy(&self, def: StrategyDefinition) -> Result<(), CoreError> {
        debug!(strategy_id = %def.id, strategy_type = %def.strategy_type, "create strategy");
        let result = self.engine.create(def).await;
        self.track(result)
    }

    pub fn pause_strategy(&self, id: &str) -> Result<(), CoreError> {
        self.track(self.engine.pause(id))
    }

    pub async fn resume_strategy(&self, id: &str) -> Result<(), CoreError> {
        let result = self.engine.resume(id).await;
        self.track(result)
    }

    pub fn stop_strategy(&self, id: &str) -> Result<(), CoreError> {
        self.track(self.engine.stop(id))
    }

    pub fn panic_strategy(&self, id: &str) -> Result<(), CoreError> {
        self.track(self.engine.panic(id))
    }

    pub async fn update_strategy_params(
        &self,
        id: &str,
        params: serde_json::Value,
    ) -> Result<(), CoreError> {
        let result = self.engine.update_params(id, params).await;
        self.track(result)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn strategy(&self, id: &str) -> Result<StrategyDefinition, CoreError> {
        self.store
            .get_strategy(id)?
            .ok_or_else(|| CoreError::NotFound(format!("strategy {id}")))
    }

    pub fn strategies_for_user(&self, user_id: &str) -> Result<Vec<StrategyDefinition>, CoreError> {
        self.store.strategies_for_user(user_id)
    }

    pub fn positions(&self, user_id: &str) -> Result<Vec<SymbolPosition>, CoreError> {
        self.store.global_positions(user_id)
    }

    pub fn open_orders(&self, user_id: &str) -> Result<Vec<Order>, CoreError> {
        self.store.open_orders(Some(user_id))
    }

    pub fn orders_for_strategy(&self, strategy_id: &str) -> Result<Vec<Order>, CoreError> {
        self.store.orders_for_strategy(strategy_id)
    }

    /// Live evaluator metrics when the user is active, otherwise the
    /// persisted daily row. Queries never materialise an evaluator.
    pub fn risk_metrics(&self, user_id: &str) -> Result<Option<DailyMetrics>, CoreError> {
        if let Some(evaluator) = self.risk.get(user_id) {
            return Ok(Some(evaluator.metrics()));
        }
        self.store
            .load_daily_metrics(user_id, chrono::Local::now().date_naive())
    }

    pub fn daily_performance(
        &self,
        user_id: &str,
        days: u32,
    ) -> Result<Vec<DailyPerformance>, CoreError> {
        self.store.daily_performance(user_id, days)
    }

    pub fn balance(&self, user_id: &str) -> Option<BalanceSnapshot> {
        self.balances.get(user_id).map(|b| b.snapshot())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn submit_manual_order(&self, order: Order) -> Result<(), CoreError> {
        self.track(self.executor.submit_manual(order))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<(), CoreError> {
        let result = self.executor.cancel(order_id).await;
        self.track(result)
    }

    /// Most recent command errors, newest last.
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn system_status(&self) -> SystemStatus {
        SystemStatus {
            uptime_secs: self.started.elapsed().as_secs(),
            loaded_strategies: self.engine.loaded_ids().len(),
            queue: self.queue.metrics(),
            pool: self.pool.stats(),
            risk_evaluators: self.risk.len(),
            recent_error_count: self.recent_errors.read().len(),
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::config::CoreConfig;
    use crate::types::{OrderSide, OrderStatus, OrderType};
    use chrono::Utc;

    fn service() -> Arc<CoreService> {
        std::env::set_var("MASTER_ENCRYPTION_KEY", "service-test-master-key");
        let app = App::bootstrap(CoreConfig::default()).unwrap();
        app.service.clone()
    }

    #[tokio::test]
    async fn lifecycle_errors_are_tracked() {
        let svc = service();
        assert!(svc.pause_strategy("ghost").is_err());
        assert!(svc.stop_strategy("ghost").is_err());

        let errors = svc.recent_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].code, "NOT_FOUND");
        assert_eq!(svc.system_status().recent_error_count, 2);
    }

    #[tokio::test]
    async fn status_reports_queue_and_pool() {
        let svc = service();
        let status = svc.system_status();
        assert!(status.dry_run);
        assert_eq!(status.loaded_strategies, 0);
        assert_eq!(status.queue.enqueued, 0);
        assert_eq!(status.pool.entries, 0);
    }

    #[tokio::test]
    async fn manual_order_rejection_is_tracked() {
        let svc = service();
        let bad = Order {
            id: "m1".into(),
            strategy_id: None,
            user_id: "u1".into(),
            connection_id: "c1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: 100.0,
            qty: -1.0,
            filled_qty: 0.0,
            status: OrderStatus::New,
            venue_order_id: None,
            created_at: Utc::now(),
        };
        assert!(svc.submit_manual_order(bad).is_err());
        assert_eq!(svc.recent_errors()[0].code, "INVALID");
    }
}
