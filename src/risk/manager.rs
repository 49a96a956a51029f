// =============================================================================
// Multi-user risk manager — evaluators keyed by user id with idle cleanup
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::store::Store;

use super::evaluator::RiskEvaluator;
use super::RiskConfig;

struct ManagedEvaluator {
    evaluator: Arc<RiskEvaluator>,
    last_access: Instant,
}

/// Keys [`RiskEvaluator`] instances by user id. Read access refreshes the
/// last-access timestamp; reads of missing keys do not materialise a new
/// evaluator.
pub struct RiskManagerRegistry {
    evaluators: RwLock<HashMap<String, ManagedEvaluator>>,
    config: Arc<RwLock<RiskConfig>>,
    store: Arc<Store>,
}

impl RiskManagerRegistry {
    pub fn new(config: Arc<RwLock<RiskConfig>>, store: Arc<Store>) -> Self {
        Self {
            evaluators: RwLock::new(HashMap::new()),
            config,
            store,
        }
    }

    /// Look up an existing evaluator, refreshing its last-access timestamp.
    pub fn get(&self, user_id: &str) -> Option<Arc<RiskEvaluator>> {
        let mut map = self.evaluators.write();
        let entry = map.get_mut(user_id)?;
        entry.last_access = Instant::now();
        Some(entry.evaluator.clone())
    }

    /// Look up or build the evaluator for `user_id`.
    pub fn get_or_create(&self, user_id: &str) -> Arc<RiskEvaluator> {
        if let Some(existing) = self.get(user_id) {
            return existing;
        }
        let evaluator = Arc::new(RiskEvaluator::new(
            user_id,
            self.config.clone(),
            self.store.clone(),
        ));
        let mut map = self.evaluators.write();
        // Another task may have raced us; last insert wins either way.
        map.insert(
            user_id.to_string(),
            ManagedEvaluator {
                evaluator: evaluator.clone(),
                last_access: Instant::now(),
            },
        );
        debug!(user_id, "risk evaluator created");
        evaluator
    }

    /// Remove evaluators idle for longer than `ttl`. Returns how many were
    /// dropped.
    pub fn cleanup_idle(&self, ttl: Duration) -> usize {
        let mut map = self.evaluators.write();
        let before = map.len();
        map.retain(|_, entry| entry.last_access.elapsed() < ttl);
        let removed = before - map.len();
        if removed > 0 {
            info!(removed, remaining = map.len(), "idle risk evaluators removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.evaluators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.read().is_empty()
    }

    /// Shared global configuration handle.
    pub fn config(&self) -> Arc<RwLock<RiskConfig>> {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RiskManagerRegistry {
        let store = Arc::new(Store::open_in_memory().unwrap());
        RiskManagerRegistry::new(Arc::new(RwLock::new(RiskConfig::default())), store)
    }

    #[test]
    fn missing_key_read_does_not_materialise() {
        let reg = registry();
        assert!(reg.get("ghost").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let reg = registry();
        let a = reg.get_or_create("u1");
        let b = reg.get_or_create("u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn idle_cleanup_removes_stale_entries() {
        let reg = registry();
        reg.get_or_create("u1");
        reg.get_or_create("u2");
        // Zero TTL: everything is stale.
        let removed = reg.cleanup_idle(Duration::from_secs(0));
        assert_eq!(removed, 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn access_refreshes_timestamp() {
        let reg = registry();
        reg.get_or_create("u1");
        assert!(reg.get("u1").is_some());
        // A generous TTL keeps the freshly touched entry alive.
        assert_eq!(reg.cleanup_idle(Duration::from_secs(3600)), 0);
        assert_eq!(reg.len(), 1);
    }
}
