// =============================================================================
// Balance Manager — available/locked funds per user
// =============================================================================
//
// Invariant: available + locked = total, no component goes negative, and a
// failed lock mutates nothing. When a user's gateway reports balance the
// manager mirrors it; otherwise it runs in simulated mode from an initial
// balance.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::gateway::VenueBalance;

/// Serialisable view of one user's funds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BalanceSnapshot {
    pub available: f64,
    pub locked: f64,
    pub total: f64,
    /// Whether the last value came from the venue rather than simulation.
    pub mirrored: bool,
}

struct BalanceState {
    available: f64,
    locked: f64,
    mirrored: bool,
}

/// Funds ledger for one user.
pub struct BalanceManager {
    state: RwLock<BalanceState>,
}

impl BalanceManager {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            state: RwLock::new(BalanceState {
                available: initial_balance.max(0.0),
                locked: 0.0,
                mirrored: false,
            }),
        }
    }

    /// Reserve `amount` for an in-flight order. Fails without mutation when
    /// the available balance is short.
    pub fn lock(&self, amount: f64) -> bool {
        if amount <= 0.0 {
            return false;
        }
        let mut s = self.state.write();
        if s.available < amount {
            debug!(
                requested = amount,
                available = s.available,
                "balance lock refused"
            );
            return false;
        }
        s.available -= amount;
        s.locked += amount;
        true
    }

    /// Release a previously locked amount back to available.
    pub fn unlock(&self, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        let mut s = self.state.write();
        let release = amount.min(s.locked);
        s.locked -= release;
        s.available += release;
    }

    /// Consume a locked amount (e.g. a fill settled).
    pub fn deduct(&self, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        let mut s = self.state.write();
        let spend = amount.min(s.locked);
        s.locked -= spend;
        if spend < amount {
            warn!(
                requested = amount,
                deducted = spend,
                "deduct exceeded locked amount — clamped"
            );
        }
    }

    /// Credit funds (e.g. sale proceeds).
    pub fn add(&self, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        self.state.write().available += amount;
    }

    /// Mirror a venue-reported balance, replacing the simulated values.
    pub fn mirror_venue(&self, venue: VenueBalance) {
        let mut s = self.state.write();
        s.available = venue.available.max(0.0);
        s.locked = venue.locked.max(0.0);
        s.mirrored = true;
        debug!(
            available = s.available,
            locked = s.locked,
            "balance mirrored from venue"
        );
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        let s = self.state.read();
        BalanceSnapshot {
            available: s.available,
            locked: s.locked,
            total: s.available + s.locked,
            mirrored: s.mirrored,
        }
    }
}

// ---------------------------------------------------------------------------
// Multi-user registry
// ---------------------------------------------------------------------------

struct ManagedBalance {
    manager: Arc<BalanceManager>,
    last_access: Instant,
}

/// Balances keyed by user id, with the same idle lifecycle rules as the
/// multi-user risk manager.
pub struct BalanceRegistry {
    balances: RwLock<HashMap<String, ManagedBalance>>,
    initial_balance: f64,
}

impl BalanceRegistry {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            initial_balance,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<BalanceManager>> {
        let mut map = self.balances.write();
        let entry = map.get_mut(user_id)?;
        entry.last_access = Instant::now();
        Some(entry.manager.clone())
    }

    pub fn get_or_create(&self, user_id: &str) -> Arc<BalanceManager> {
        if let Some(existing) = self.get(user_id) {
            return existing;
        }
        let manager = Arc::new(BalanceManager::new(self.initial_balance));
        self.balances.write().insert(
            user_id.to_string(),
            ManagedBalance {
                manager: manager.clone(),
                last_access: Instant::now(),
            },
        );
        debug!(user_id, "balance manager created");
        manager
    }

    pub fn cleanup_idle(&self, ttl: Duration) -> usize {
        let mut map = self.balances.write();
        let before = map.len();
        map.retain(|_, entry| entry.last_access.elapsed() < ttl);
        let removed = before - map.len();
        if removed > 0 {
            info!(removed, remaining = map.len(), "idle balance managers removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.balances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_preserves_total() {
        let b = BalanceManager::new(1_000.0);
        assert!(b.lock(400.0));
        let s = b.snapshot();
        assert_eq!(s.available, 600.0);
        assert_eq!(s.locked, 400.0);
        assert_eq!(s.total, 1_000.0);

        b.unlock(400.0);
        let s = b.snapshot();
        assert_eq!(s.available, 1_000.0);
        assert_eq!(s.locked, 0.0);
    }

    #[test]
    fn short_lock_fails_without_mutation() {
        let b = BalanceManager::new(100.0);
        assert!(!b.lock(100.01));
        let s = b.snapshot();
        assert_eq!(s.available, 100.0);
        assert_eq!(s.locked, 0.0);
    }

    #[test]
    fn nonpositive_amounts_are_refused() {
        let b = BalanceManager::new(100.0);
        assert!(!b.lock(0.0));
        assert!(!b.lock(-5.0));
        b.unlock(-5.0);
        b.add(-5.0);
        b.deduct(-5.0);
        assert_eq!(b.snapshot().total, 100.0);
    }

    #[test]
    fn deduct_consumes_locked_funds() {
        let b = BalanceManager::new(500.0);
        assert!(b.lock(200.0));
        b.deduct(200.0);
        let s = b.snapshot();
        assert_eq!(s.available, 300.0);
        assert_eq!(s.locked, 0.0);
        assert_eq!(s.total, 300.0);
    }

    #[test]
    fn unlock_clamps_to_locked() {
        let b = BalanceManager::new(100.0);
        assert!(b.lock(50.0));
        b.unlock(500.0);
        let s = b.snapshot();
        assert_eq!(s.available, 100.0);
        assert_eq!(s.locked, 0.0);
    }

    #[test]
    fn venue_mirror_replaces_simulation() {
        let b = BalanceManager::new(100.0);
        b.mirror_venue(VenueBalance {
            available: 2_500.0,
            locked: 50.0,
        });
        let s = b.snapshot();
        assert!(s.mirrored);
        assert_eq!(s.available, 2_500.0);
        assert_eq!(s.locked, 50.0);
    }

    #[test]
    fn registry_lifecycle_matches_risk_manager() {
        let reg = BalanceRegistry::new(1_000.0);
        assert!(reg.get("ghost").is_none());
        let a = reg.get_or_create("u1");
        let b = reg.get_or_create("u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.cleanup_idle(Duration::from_secs(0)), 1);
        assert!(reg.is_empty());
    }
}
