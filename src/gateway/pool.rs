// =============================================================================
// Gateway Pool — per-connection credential-decrypting cache
// =============================================================================
//
// Each entry owns a live venue gateway built from a user's decrypted
// credentials. The cache is bounded with LRU eviction, guarded by a
// consecutive-failure circuit breaker, and swept by background idle and
// health loops. A connection owned by user A is invisible to user B: the
// mismatch surfaces as NotFound, never as a forbidden error, so connection
// ids cannot be enumerated.
//
// Plaintext secrets exist only inside the gateway instances and never
// appear in log output.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::CoreError;
use crate::store::Store;

use super::crypto::KeyManager;
use super::rate_limit::WeightWindow;
use super::{GatewayCredentials, GatewayFactory, VenueGateway};

/// Timeout applied to each health-sweep ping.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request-weight window shared by all gateways of one venue.
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);
const WEIGHT_LIMIT: u32 = 1200;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_entries: usize,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open after the last healthy call.
    pub circuit_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            failure_threshold: 5,
            circuit_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30 * 60),
            health_interval: Duration::from_secs(60),
        }
    }
}

struct CachedGateway {
    gateway: Arc<dyn VenueGateway>,
    user_id: String,
    exchange_type: String,
    created_at: Instant,
    last_used: Instant,
    last_healthy: Instant,
    failures: u32,
}

/// Serialisable pool statistics for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub entries: usize,
    pub capacity: usize,
    pub unhealthy: usize,
}

pub struct GatewayPool {
    entries: RwLock<HashMap<String, CachedGateway>>,
    factories: RwLock<HashMap<String, GatewayFactory>>,
    /// Request-weight accounting per exchange type.
    limits: RwLock<HashMap<String, Arc<WeightWindow>>>,
    store: Arc<Store>,
    keys: Arc<KeyManager>,
    config: PoolConfig,
}

impl GatewayPool {
    pub fn new(store: Arc<Store>, keys: Arc<KeyManager>, config: PoolConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            limits: RwLock::new(HashMap::new()),
            store,
            keys,
            config,
        }
    }

    /// Shared weight window for one exchange type, created on first use.
    pub fn weight_window(&self, exchange_type: &str) -> Arc<WeightWindow> {
        if let Some(window) = self.limits.read().get(exchange_type) {
            return window.clone();
        }
        let mut limits = self.limits.write();
        limits
            .entry(exchange_type.to_string())
            .or_insert_with(|| Arc::new(WeightWindow::new(WEIGHT_WINDOW, WEIGHT_LIMIT)))
            .clone()
    }

    /// Register the builder for one exchange type.
    pub fn register_factory(&self, exchange_type: impl Into<String>, factory: GatewayFactory) {
        let exchange_type = exchange_type.into();
        debug!(exchange_type = %exchange_type, "gateway factory registered");
        self.factories.write().insert(exchange_type, factory);
    }

    // -------------------------------------------------------------------------
    // Acquisition
    // -------------------------------------------------------------------------

    /// Return the cached gateway for `(user_id, connection_id)`, building it
    /// from the persisted connection record when absent.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Arc<dyn VenueGateway>, CoreError> {
        if user_id.is_empty() {
            return Err(CoreError::UserIdRequired);
        }

        // Fast path: cached entry owned by this user.
        if let Some(gateway) = self.lookup_cached(user_id, connection_id)? {
            return Ok(gateway);
        }

        // Slow path: build outside any lock.
        let record = self
            .store
            .get_connection(connection_id)?
            .filter(|rec| rec.user_id == user_id && rec.active)
            .ok_or_else(|| CoreError::NotFound(format!("connection {connection_id}")))?;

        let credentials = GatewayCredentials {
            api_key: self.keys.decrypt(&record.encrypted_api_key).map_err(|e| {
                CoreError::GatewayUnavailable(format!("credential decryption failed: {e}"))
            })?,
            api_secret: self.keys.decrypt(&record.encrypted_api_secret).map_err(|e| {
                CoreError::GatewayUnavailable(format!("credential decryption failed: {e}"))
            })?,
        };

        let factory = self
            .factories
            .read()
            .get(&record.exchange_type)
            .cloned()
            .ok_or_else(|| {
                CoreError::Config(format!(
                    "no gateway factory for exchange '{}'",
                    record.exchange_type
                ))
            })?;
        let gateway = factory(credentials)?;

        // Insert under the write lock, evicting the LRU entry at capacity.
        let (inserted, evicted) = {
            let mut entries = self.entries.write();
            if let Some(existing) = entries.get_mut(connection_id) {
                // Raced with another task; their entry wins.
                existing.last_used = Instant::now();
                (existing.gateway.clone(), None)
            } else {
                let evicted = if entries.len() >= self.config.max_entries {
                    let lru_key = entries
                        .iter()
                        .min_by_key(|(_, e)| e.last_used)
                        .map(|(k, _)| k.clone());
                    match lru_key {
                        Some(key) => entries.remove(&key).map(|e| (key, e.gateway)),
                        None => None,
                    }
                } else {
                    None
                };
                if entries.len() >= self.config.max_entries {
                    return Err(CoreError::GatewayUnavailable(
                        "gateway pool is full".into(),
                    ));
                }
                let now = Instant::now();
                entries.insert(
                    connection_id.to_string(),
                    CachedGateway {
                        gateway: gateway.clone(),
                        user_id: user_id.to_string(),
                        exchange_type: record.exchange_type.clone(),
                        created_at: now,
                        last_used: now,
                        last_healthy: now,
                        failures: 0,
                    },
                );
                (gateway, evicted)
            }
        };

        if let Some((key, old)) = evicted {
            info!(connection_id = %key, "LRU-evicted gateway closed");
            old.close().await;
        }
        info!(
            connection_id,
            exchange_type = %record.exchange_type,
            "gateway created and cached"
        );
        Ok(inserted)
    }

    fn lookup_cached(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Option<Arc<dyn VenueGateway>>, CoreError> {
        let mut entries = self.entries.write();
        let entry = match entries.get_mut(connection_id) {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.user_id != user_id {
            // Cross-user access reads as absence, not as forbidden.
            return Err(CoreError::NotFound(format!("connection {connection_id}")));
        }
        if entry.failures >= self.config.failure_threshold
            && entry.last_healthy.elapsed() < self.config.circuit_timeout
        {
            return Err(CoreError::GatewayUnavailable(format!(
                "circuit open for connection {connection_id} ({} consecutive failures)",
                entry.failures
            )));
        }
        entry.last_used = Instant::now();
        Ok(Some(entry.gateway.clone()))
    }

    // -------------------------------------------------------------------------
    // Health bookkeeping
    // -------------------------------------------------------------------------

    pub fn record_success(&self, connection_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(connection_id) {
            entry.failures = 0;
            entry.last_healthy = Instant::now();
        }
    }

    pub fn record_failure(&self, connection_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(connection_id) {
            entry.failures += 1;
            if entry.failures >= self.config.failure_threshold {
                warn!(
                    connection_id,
                    failures = entry.failures,
                    "gateway circuit opened"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Removal
    // -------------------------------------------------------------------------

    /// Evict and close one connection's gateway.
    pub async fn remove(&self, connection_id: &str) {
        let removed = self.entries.write().remove(connection_id);
        if let Some(entry) = removed {
            entry.gateway.close().await;
            info!(connection_id, "gateway removed and closed");
        }
    }

    /// Evict and close every gateway owned by `user_id`.
    pub async fn remove_by_user(&self, user_id: &str) {
        let removed: Vec<(String, Arc<dyn VenueGateway>)> = {
            let mut entries = self.entries.write();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.user_id == user_id)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.gateway)))
                .collect()
        };
        for (key, gateway) in removed {
            gateway.close().await;
            debug!(connection_id = %key, user_id, "gateway removed (user purge)");
        }
    }

    // -------------------------------------------------------------------------
    // Sweeps
    // -------------------------------------------------------------------------

    /// Drop entries whose `last_used` is older than the idle timeout.
    pub async fn sweep_idle(&self) -> usize {
        let removed: Vec<(String, Arc<dyn VenueGateway>)> = {
            let mut entries = self.entries.write();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.last_used.elapsed() >= self.config.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.gateway)))
                .collect()
        };
        let count = removed.len();
        for (key, gateway) in removed {
            gateway.close().await;
            info!(connection_id = %key, "idle gateway evicted");
        }
        count
    }

    /// Ping every cached gateway and record the outcome.
    pub async fn sweep_health(&self) {
        let targets: Vec<(String, Arc<dyn VenueGateway>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.gateway.clone()))
            .collect();
        for (connection_id, gateway) in targets {
            match tokio::time::timeout(PING_TIMEOUT, gateway.ping()).await {
                Ok(Ok(())) => self.record_success(&connection_id),
                Ok(Err(e)) => {
                    warn!(connection_id = %connection_id, error = %e, "health ping failed");
                    self.record_failure(&connection_id);
                }
                Err(_) => {
                    warn!(connection_id = %connection_id, "health ping timed out");
                    self.record_failure(&connection_id);
                }
            }
        }
    }

    /// Spawn the idle and health sweep loops; both exit on cancellation.
    pub fn spawn_sweepers(self: &Arc<Self>, token: CancellationToken) {
        let idle_pool = self.clone();
        let idle_token = token.clone();
        let idle_every = self.config.idle_timeout / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(idle_every);
            loop {
                tokio::select! {
                    _ = idle_token.cancelled() => return,
                    _ = interval.tick() => {
                        idle_pool.sweep_idle().await;
                    }
                }
            }
        });

        let health_pool = self.clone();
        let health_every = self.config.health_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(health_every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        health_pool.sweep_health().await;
                    }
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.read();
        let unhealthy = entries
            .values()
            .filter(|e| e.failures >= self.config.failure_threshold)
            .count();
        PoolStats {
            entries: entries.len(),
            capacity: self.config.max_entries,
            unhealthy,
        }
    }

    /// Connection ids currently cached (test introspection).
    pub fn cached_connections(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Close every cached gateway. Called during shutdown.
    pub async fn close_all(&self) {
        let all: Vec<Arc<dyn VenueGateway>> = {
            let mut entries = self.entries.write();
            entries.drain().map(|(_, e)| e.gateway).collect()
        };
        for gateway in all {
            gateway.close().await;
        }
        info!("gateway pool drained");
    }

    /// Exchange type cached for a connection, if present.
    pub fn cached_exchange(&self, connection_id: &str) -> Option<String> {
        self.entries
            .read()
            .get(connection_id)
            .map(|e| e.exchange_type.clone())
    }

    /// Age of a cached entry, if present.
    pub fn cached_age(&self, connection_id: &str) -> Option<Duration> {
        self.entries
            .read()
            .get(connection_id)
            .map(|e| e.created_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::PaperGateway;
    use crate::types::ConnectionRecord;
    use chrono::Utc;

    /// Pool over an in-memory store with seeded connections A/B/C and a
    /// factory that records every created paper gateway, so tests can
    /// observe closes.
    fn pool_with_tracking(
        max_entries: usize,
    ) -> (Arc<GatewayPool>, Arc<parking_lot::Mutex<Vec<Arc<PaperGateway>>>>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let keys = Arc::new(
            KeyManager::from_keys([(1, "pool-test-key".to_string())]).unwrap(),
        );
        for (id, user) in [("A", "u-a"), ("B", "u-b"), ("C", "u-c")] {
            store
                .upsert_connection(&ConnectionRecord {
                    id: id.into(),
                    user_id: user.into(),
                    exchange_type: "paper".into(),
                    name: format!("conn-{id}"),
                    encrypted_api_key: keys.encrypt("key").unwrap(),
                    encrypted_api_secret: keys.encrypt("secret").unwrap(),
                    key_version: 1,
                    active: true,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let config = PoolConfig {
            max_entries,
            failure_threshold: 3,
            circuit_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(600),
            health_interval: Duration::from_secs(60),
        };
        let pool = Arc::new(GatewayPool::new(store, keys, config));
        let created: Arc<parking_lot::Mutex<Vec<Arc<PaperGateway>>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = created.clone();
        pool.register_factory(
            "paper",
            Arc::new(move |_creds| {
                let gw = Arc::new(PaperGateway::new(10_000.0));
                sink.lock().push(gw.clone());
                Ok(gw as Arc<dyn VenueGateway>)
            }),
        );
        (pool, created)
    }

    #[tokio::test]
    async fn lru_eviction_closes_least_recently_used() {
        let (pool, created) = pool_with_tracking(2);

        pool.get_or_create("u-a", "A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.get_or_create("u-b", "B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.get_or_create("u-a", "A").await.unwrap(); // touch A
        tokio::time::sleep(Duration::from_millis(2)).await;
        pool.get_or_create("u-c", "C").await.unwrap(); // evicts B

        let mut cached = pool.cached_connections();
        cached.sort();
        assert_eq!(cached, vec!["A".to_string(), "C".to_string()]);

        // B was the second gateway created; it must be closed.
        let gateways = created.lock();
        assert_eq!(gateways.len(), 3);
        assert!(gateways[1].is_closed(), "evicted gateway was not closed");
        assert!(!gateways[0].is_closed());
        assert!(!gateways[2].is_closed());
    }

    #[tokio::test]
    async fn cross_user_access_reads_as_not_found() {
        let (pool, _created) = pool_with_tracking(4);
        pool.get_or_create("u-a", "A").await.unwrap();
        let err = pool.get_or_create("u-b", "A").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn unknown_connection_is_not_found() {
        let (pool, _created) = pool_with_tracking(4);
        let err = pool.get_or_create("u-a", "nope").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let (pool, _created) = pool_with_tracking(4);
        pool.get_or_create("u-a", "A").await.unwrap();
        for _ in 0..3 {
            pool.record_failure("A");
        }
        let err = pool.get_or_create("u-a", "A").await.unwrap_err();
        assert_eq!(err.code(), "GW_UNAVAILABLE");

        // A recorded success resets the breaker.
        pool.record_success("A");
        assert!(pool.get_or_create("u-a", "A").await.is_ok());
    }

    #[tokio::test]
    async fn remove_by_user_closes_owned_gateways() {
        let (pool, created) = pool_with_tracking(4);
        pool.get_or_create("u-a", "A").await.unwrap();
        pool.get_or_create("u-b", "B").await.unwrap();
        pool.remove_by_user("u-a").await;
        assert_eq!(pool.cached_connections(), vec!["B".to_string()]);
        assert!(created.lock()[0].is_closed());
    }

    #[tokio::test]
    async fn idle_sweep_keeps_fresh_entries() {
        let (pool, created) = pool_with_tracking(4);
        pool.get_or_create("u-a", "A").await.unwrap();
        assert_eq!(pool.sweep_idle().await, 0, "fresh entry must survive");
        assert!(!created.lock()[0].is_closed());
    }

    #[tokio::test]
    async fn health_sweep_records_success_for_healthy_gateways() {
        let (pool, _created) = pool_with_tracking(4);
        pool.get_or_create("u-a", "A").await.unwrap();
        pool.record_failure("A");
        pool.sweep_health().await;
        // Paper gateways always ping healthy: the failure count resets and
        // the entry stays usable.
        assert!(pool.get_or_create("u-a", "A").await.is_ok());
        assert_eq!(pool.stats().unhealthy, 0);
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let (pool, _created) = pool_with_tracking(4);
        let err = pool.get_or_create("", "A").await.unwrap_err();
        assert_eq!(err.code(), "USER_ID_REQUIRED");
    }

}
