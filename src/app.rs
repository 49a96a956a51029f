// =============================================================================
// Application root — owns every subsystem and its lifecycle
// =============================================================================
//
// Bootstraps the store, bus, pool, registries, engine, and executor, spawns
// every long-running task under one cancellation token, and tears the whole
// tree down on shutdown: feed readers exit, the strategy engine persists
// state, the pool closes cached gateways, the executor reports anything
// unacknowledged as UNKNOWN.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balance::BalanceRegistry;
use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::errors::CoreError;
use crate::execution::{OrderExecutor, OrderQueue};
use crate::gateway::{GatewayPool, KeyManager, PaperGateway, VenueGateway};
use crate::indicators::IndicatorEngine;
use crate::market_data::{self, BarHistory, RestHistory, StaticHistory};
use crate::reconcile::Reconciler;
use crate::risk::RiskManagerRegistry;
use crate::service::CoreService;
use crate::store::Store;
use crate::strategy::StrategyEngine;

/// Price window retained per symbol by the shared indicator engine.
const INDICATOR_WINDOW: usize = 256;

pub struct App {
    pub config: CoreConfig,
    pub bus: Arc<EventBus>,
    pub store: Arc<Store>,
    pub indicators: Arc<IndicatorEngine>,
    pub pool: Arc<GatewayPool>,
    pub risk: Arc<RiskManagerRegistry>,
    pub balances: Arc<BalanceRegistry>,
    pub queue: Arc<OrderQueue>,
    pub engine: Arc<StrategyEngine>,
    pub executor: Arc<OrderExecutor>,
    pub reconciler: Arc<Reconciler>,
    pub service: Arc<CoreService>,
}

impl App {
    /// Build every subsystem from the configuration. Nothing is spawned yet.
    pub fn bootstrap(config: CoreConfig) -> Result<Self, CoreError> {
        let store = Arc::new(if config.dry_run {
            Store::open_in_memory()?
        } else {
            Store::open(&config.db_path)?
        });
        let keys = Arc::new(KeyManager::from_env()?);
        let bus = Arc::new(EventBus::new());
        let indicators = Arc::new(IndicatorEngine::new(INDICATOR_WINDOW));

        let pool = Arc::new(GatewayPool::new(
            store.clone(),
            keys,
            config.pool_config(),
        ));
        let paper_balance = config.initial_balance;
        pool.register_factory(
            "paper",
            Arc::new(move |_creds| {
                Ok(Arc::new(PaperGateway::new(paper_balance)) as Arc<dyn VenueGateway>)
            }),
        );

        let risk = Arc::new(RiskManagerRegistry::new(
            Arc::new(RwLock::new(config.risk.clone())),
            store.clone(),
        ));
        let balances = Arc::new(BalanceRegistry::new(config.initial_balance));
        let queue = Arc::new(OrderQueue::new(
            config.queue_primary_capacity,
            config.queue_overflow_capacity,
        ));

        let history: Arc<dyn BarHistory> = if config.dry_run {
            Arc::new(StaticHistory::new())
        } else {
            Arc::new(RestHistory::new(config.rest_base.clone()))
        };
        let engine = Arc::new(StrategyEngine::new(
            store.clone(),
            bus.clone(),
            indicators.clone(),
            history,
            queue.clone(),
        ));

        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            bus.clone(),
            pool.clone(),
            risk.clone(),
            balances.clone(),
            queue.clone(),
            engine.clone(),
            indicators.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            pool.clone(),
            config.reconcile_auto_sync,
            config.reconcile_interval(),
        ));

        let service = Arc::new(CoreService::new(
            store.clone(),
            engine.clone(),
            executor.clone(),
            risk.clone(),
            balances.clone(),
            pool.clone(),
            queue.clone(),
            config.dry_run,
        ));

        Ok(Self {
            config,
            bus,
            store,
            indicators,
            pool,
            risk,
            balances,
            queue,
            engine,
            executor,
            reconciler,
            service,
        })
    }

    /// Load persisted strategies and spawn every long-running task.
    pub async fn start(&self, token: CancellationToken) -> Result<(), CoreError> {
        self.engine.load_all().await?;

        // Market feed readers, one per symbol.
        if !self.config.dry_run {
            for symbol in &self.config.symbols {
                tokio::spawn(market_data::run_tick_feed(
                    symbol.clone(),
                    self.config.ws_base.clone(),
                    self.bus.clone(),
                    token.clone(),
                ));
            }
            info!(count = self.config.symbols.len(), "market feed readers launched");
        } else {
            info!("dry-run: no live market feeds spawned");
        }

        // Strategy dispatch loop.
        tokio::spawn(self.engine.clone().run(token.clone()));

        // Executor drain loop.
        tokio::spawn(self.executor.clone().run(token.clone()));

        // Gateway pool sweepers.
        self.pool.spawn_sweepers(token.clone());

        // Reconciliation ticker.
        tokio::spawn(self.reconciler.clone().run(token.clone()));

        // Registry idle cleanup.
        {
            let risk = self.risk.clone();
            let balances = self.balances.clone();
            let ttl = self.config.registry_ttl();
            let cleanup_token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(ttl / 2);
                loop {
                    tokio::select! {
                        _ = cleanup_token.cancelled() => return,
                        _ = interval.tick() => {
                            risk.cleanup_idle(ttl);
                            balances.cleanup_idle(ttl);
                        }
                    }
                }
            });
        }

        // Venue balance mirror.
        {
            let store = self.store.clone();
            let pool = self.pool.clone();
            let balances = self.balances.clone();
            let every = std::time::Duration::from_secs(self.config.balance_sync_secs);
            let sync_token = token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = sync_token.cancelled() => return,
                        _ = interval.tick() => {
                            sync_balances(&store, &pool, &balances).await;
                        }
                    }
                }
            });
        }

        info!("all subsystems running");
        Ok(())
    }

    /// Orderly teardown after the token is cancelled.
    pub async fn shutdown(&self) {
        if let Err(e) = self.engine.persist_all() {
            warn!(error = %e, "strategy state persistence failed during shutdown");
        }
        self.pool.close_all().await;
        info!("shutdown complete");
    }
}

/// Mirror venue balances into the per-user managers where supported.
async fn sync_balances(
    store: &Arc<Store>,
    pool: &Arc<GatewayPool>,
    balances: &Arc<BalanceRegistry>,
) {
    let connections = match store.list_active_connections() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "balance sync could not list connections");
            return;
        }
    };
    for conn in connections {
        let gateway = match pool.get_or_create(&conn.user_id, &conn.id).await {
            Ok(g) => g,
            Err(e) => {
                warn!(connection_id = %conn.id, error = %e, "balance sync skipped connection");
                continue;
            }
        };
        match gateway.get_balance().await {
            Ok(Some(venue)) => {
                balances.get_or_create(&conn.user_id).mirror_venue(venue);
            }
            Ok(None) => {} // simulated mode
            Err(e) => {
                warn!(connection_id = %conn.id, error = %e, "venue balance fetch failed");
                pool.record_failure(&conn.id);
            }
        }
    }
}
