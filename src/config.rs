// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Persistence uses a tmp + rename pattern so a crash mid-write never
// corrupts the file. Every field carries a serde default so older config
// files keep loading after new fields appear.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::gateway::PoolConfig;
use crate::risk::RiskConfig;

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_ws_base() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_rest_base() -> String {
    "https://api.binance.com/api/v3".to_string()
}

fn default_initial_balance() -> f64 {
    100_000.0
}

fn default_queue_primary() -> usize {
    256
}

fn default_queue_overflow() -> usize {
    256
}

fn default_pool_max_entries() -> usize {
    64
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_registry_ttl_secs() -> u64 {
    3600
}

fn default_balance_sync_secs() -> u64 {
    300
}

/// Top-level runtime configuration for the trading core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Symbols the engine subscribes to.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Bar interval used for warm-up history.
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Dry-run routes all submissions through the paper gateway.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    #[serde(default = "default_rest_base")]
    pub rest_base: String,

    /// Simulated starting balance per user when no venue mirror exists.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    // --- Order queue ---------------------------------------------------------
    #[serde(default = "default_queue_primary")]
    pub queue_primary_capacity: usize,

    #[serde(default = "default_queue_overflow")]
    pub queue_overflow_capacity: usize,

    // --- Gateway pool --------------------------------------------------------
    #[serde(default = "default_pool_max_entries")]
    pub pool_max_entries: usize,

    #[serde(default = "default_failure_threshold")]
    pub pool_failure_threshold: u32,

    #[serde(default = "default_circuit_timeout_secs")]
    pub pool_circuit_timeout_secs: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub pool_health_interval_secs: u64,

    // --- Reconciliation ------------------------------------------------------
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_true")]
    pub reconcile_auto_sync: bool,

    // --- Registries ----------------------------------------------------------
    /// Idle TTL for per-user risk evaluators and balance managers.
    #[serde(default = "default_registry_ttl_secs")]
    pub registry_ttl_secs: u64,

    /// Interval for mirroring venue balances.
    #[serde(default = "default_balance_sync_secs")]
    pub balance_sync_secs: u64,

    // --- Risk ---------------------------------------------------------------
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            dry_run = config.dry_run,
            "config loaded"
        );
        Ok(config)
    }

    /// Persist atomically: write to a `.tmp` sibling, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_entries: self.pool_max_entries,
            failure_threshold: self.pool_failure_threshold,
            circuit_timeout: Duration::from_secs(self.pool_circuit_timeout_secs),
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            health_interval: Duration::from_secs(self.pool_health_interval_secs),
        }
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let cfg = CoreConfig::default();
        assert!(cfg.dry_run, "default must be dry-run");
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.interval, "1m");
        assert_eq!(cfg.queue_primary_capacity, 256);
        assert!(cfg.reconcile_auto_sync);
        assert!(cfg.risk.enabled);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: CoreConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.pool_max_entries, 64);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["SOLUSDT"], "dry_run": false }"#;
        let cfg: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.reconcile_interval_secs, 60);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = CoreConfig::default();
        cfg.symbols = vec!["BTCUSDT".into()];
        cfg.dry_run = false;
        cfg.save(&path).unwrap();

        let back = CoreConfig::load(&path).unwrap();
        assert_eq!(back.symbols, cfg.symbols);
        assert!(!back.dry_run);
    }

    #[test]
    fn load_missing_file_errors() {
        assert!(CoreConfig::load("/nonexistent/config.json").is_err());
    }
}
