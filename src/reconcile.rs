// =============================================================================
// Reconciliation Loop — local-vs-venue position diff with optional auto-sync
// =============================================================================
//
// Advisory only: reconciliation never cancels or submits orders. For every
// symbol whose local and venue quantities diverge past a small epsilon it
// emits a diff entry, optionally overwrites the local quantity with the
// venue's, and persists an audit row. A venue without position reporting
// yields an empty map and the pass is a no-op.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::CoreError;
use crate::gateway::GatewayPool;
use crate::store::{ReconcileAudit, Store};

/// Differences below this are treated as equal.
const QTY_TOLERANCE: f64 = 1e-4;

/// Placeholder average price for venue positions with no local history.
/// Flagged with `synthetic_price` so consumers never mistake it for market
/// data.
const SYNTHETIC_AVG_PRICE: f64 = 1.0;

/// One symbol's divergence found during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileEntry {
    pub symbol: String,
    pub local_qty: f64,
    pub venue_qty: f64,
    pub difference: f64,
    pub synced: bool,
    pub synthetic_price: bool,
}

pub struct Reconciler {
    store: Arc<Store>,
    pool: Arc<GatewayPool>,
    auto_sync: bool,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        pool: Arc<GatewayPool>,
        auto_sync: bool,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            auto_sync,
            interval,
        }
    }

    /// Reconcile one user's connection. Returns the diff entries found.
    pub async fn reconcile_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Vec<ReconcileEntry>, CoreError> {
        let gateway = self.pool.get_or_create(user_id, connection_id).await?;
        let venue_positions = gateway.get_positions().await?;
        let local_positions = self.store.global_positions(user_id)?;

        // Union of locally and venue-known symbols.
        let mut symbols: HashSet<String> = venue_positions.keys().cloned().collect();
        symbols.extend(local_positions.iter().map(|p| p.symbol.clone()));

        let mut entries = Vec::new();
        for symbol in symbols {
            let local = local_positions.iter().find(|p| p.symbol == symbol);
            let local_qty = local.map(|p| p.qty).unwrap_or(0.0);
            let venue_qty = venue_positions.get(&symbol).copied().unwrap_or(0.0);
            let difference = venue_qty - local_qty;
            if difference.abs() <= QTY_TOLERANCE {
                continue;
            }

            // Preserve a known average price; fall back to the flagged
            // placeholder only when the venue reports quantity we have no
            // price history for.
            let (avg_price, synthetic_price) = match local.filter(|p| p.avg_price > 0.0) {
                Some(p) => (p.avg_price, false),
                None => (SYNTHETIC_AVG_PRICE, venue_qty.abs() > QTY_TOLERANCE),
            };

            let synced = if self.auto_sync {
                match self.store.sync_position_qty(
                    user_id,
                    &symbol,
                    venue_qty,
                    avg_price,
                    synthetic_price,
                ) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "auto-sync failed");
                        false
                    }
                }
            } else {
                false
            };

            let entry = ReconcileEntry {
                symbol: symbol.clone(),
                local_qty,
                venue_qty,
                difference,
                synced,
                synthetic_price,
            };
            warn!(
                symbol = %symbol,
                local_qty,
                venue_qty,
                difference,
                synced,
                synthetic_price,
                "position drift detected"
            );
            if let Err(e) = self.store.record_reconcile_audit(&ReconcileAudit {
                user_id: user_id.to_string(),
                symbol: entry.symbol.clone(),
                local_qty: entry.local_qty,
                venue_qty: entry.venue_qty,
                difference: entry.difference,
                synced: entry.synced,
                synthetic_price: entry.synthetic_price,
                at: Utc::now().to_rfc3339(),
            }) {
                warn!(symbol = %entry.symbol, error = %e, "reconcile audit write failed");
            }
            entries.push(entry);
        }

        if entries.is_empty() {
            debug!(user_id, connection_id, "reconciliation clean");
        } else {
            info!(
                user_id,
                connection_id,
                drift_count = entries.len(),
                "reconciliation report"
            );
        }
        Ok(entries)
    }

    /// One full pass over every active connection.
    pub async fn run_once(&self) {
        let connections = match self.store.list_active_connections() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reconciliation could not list connections");
                return;
            }
        };
        for conn in connections {
            if let Err(e) = self.reconcile_connection(&conn.user_id, &conn.id).await {
                warn!(
                    connection_id = %conn.id,
                    user_id = %conn.user_id,
                    error = %e,
                    "reconciliation pass failed for connection"
                );
            }
        }
    }

    /// Periodic ticker; exits on cancellation.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "reconciliation loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.run_once().await,
            }
        }
        info!("reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{KeyManager, PaperGateway, PoolConfig, VenueGateway};
    use crate::types::{ConnectionRecord, OrderSide};

    async fn fixture(auto_sync: bool) -> (Reconciler, Arc<Store>, Arc<PaperGateway>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let keys = Arc::new(KeyManager::from_keys([(1, "recon-test".to_string())]).unwrap());
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
        let paper = Arc::new(PaperGateway::new(10_000.0));
        let shared = paper.clone();
        pool.register_factory(
            "paper",
            Arc::new(move |_creds| Ok(shared.clone() as Arc<dyn VenueGateway>)),
        );

        let reconciler = Reconciler::new(
            store.clone(),
            pool,
            auto_sync,
            Duration::from_secs(60),
        );
        (reconciler, store, paper)
    }

    #[tokio::test]
    async fn drift_is_synced_and_second_run_is_clean() {
        let (reconciler, store, paper) = fixture(true).await;
        // Local 0.5, venue 0.8.
        store
            .apply_position_fill("u1", Some("s1"), "BTCUSDT", OrderSide::Buy, 0.5, 100.0)
            .unwrap();
        paper.set_position("BTCUSDT", 0.8);

        let entries = reconciler.reconcile_connection("u1", "c1").await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert!((entry.local_qty - 0.5).abs() < 1e-12);
        assert!((entry.venue_qty - 0.8).abs() < 1e-12);
        assert!((entry.difference - 0.3).abs() < 1e-12);
        assert!(entry.synced);
        assert!(!entry.synthetic_price, "local price history was known");

        let global = store.global_positions("u1").unwrap();
        assert!((global[0].qty - 0.8).abs() < 1e-12);

        // Idempotence: the second run finds nothing.
        let again = reconciler.reconcile_connection("u1", "c1").await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn venue_only_position_is_flagged_synthetic() {
        let (reconciler, store, paper) = fixture(true).await;
        paper.set_position("ETHUSDT", 2.0);

        let entries = reconciler.reconcile_connection("u1", "c1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].synthetic_price);
        assert!(entries[0].synced);

        let global = store.global_positions("u1").unwrap();
        assert!((global[0].qty - 2.0).abs() < 1e-12);
        assert!(global[0].synthetic_price);
    }

    #[tokio::test]
    async fn without_auto_sync_local_stays_untouched() {
        let (reconciler, store, paper) = fixture(false).await;
        paper.set_position("BTCUSDT", 1.0);

        let entries = reconciler.reconcile_connection("u1", "c1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].synced);
        assert!(store.global_positions("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn tiny_differences_are_ignored() {
        let (reconciler, store, paper) = fixture(true).await;
        store
            .apply_position_fill("u1", Some("s1"), "BTCUSDT", OrderSide::Buy, 1.0, 100.0)
            .unwrap();
        paper.set_position("BTCUSDT", 1.0 + 5e-5);
        let entries = reconciler.reconcile_connection("u1", "c1").await.unwrap();
        assert!(entries.is_empty());
    }
}
