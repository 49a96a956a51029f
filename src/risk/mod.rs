// =============================================================================
// Risk policy types — layered limits shared by the evaluator and manager
// =============================================================================

pub mod evaluator;
pub mod manager;
pub mod metrics;

pub use evaluator::RiskEvaluator;
pub use manager::RiskManagerRegistry;
pub use metrics::DailyMetrics;

use serde::{Deserialize, Serialize};

use crate::types::SignalAction;

// ---------------------------------------------------------------------------
// Decision output
// ---------------------------------------------------------------------------

/// Categorical severity attached to a risk decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitLevel {
    Normal,
    Warning,
    Caution,
    Limit,
}

impl std::fmt::Display for LimitLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "NORMAL",
            Self::Warning => "WARNING",
            Self::Caution => "CAUTION",
            Self::Limit => "LIMIT",
        };
        write!(f, "{s}")
    }
}

/// Outcome of evaluating one signal against the layered policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub limit_level: LimitLevel,
    pub adjusted_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

impl RiskDecision {
    pub fn allow(size: f64) -> Self {
        Self {
            allowed: true,
            reason: None,
            warning: None,
            limit_level: LimitLevel::Normal,
            adjusted_size: size,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            warning: None,
            limit_level: LimitLevel::Limit,
            adjusted_size: 0.0,
            stop_loss: None,
            take_profit: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator inputs
// ---------------------------------------------------------------------------

/// The signal fields the evaluator consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInput {
    pub symbol: String,
    pub action: SignalAction,
    pub size: f64,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub user_id: String,
}

/// Per-symbol open exposure at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct PositionExposure {
    pub qty: f64,
    pub current_price: f64,
}

// ---------------------------------------------------------------------------
// Configuration layers
// ---------------------------------------------------------------------------

/// Behaviour when the evaluator itself fails (e.g. store read error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureMode {
    /// Reject the signal.
    FailClose,
    /// Allow, capped at the fallback size.
    FailLimit,
}

fn default_enabled() -> bool {
    true
}
fn default_max_position_size() -> f64 {
    10_000.0
}
fn default_max_total_exposure() -> f64 {
    50_000.0
}
fn default_stop_loss_ratio() -> f64 {
    0.02
}
fn default_take_profit_ratio() -> f64 {
    0.04
}
fn default_max_daily_loss() -> f64 {
    500.0
}
fn default_max_daily_trades() -> u32 {
    50
}
fn default_min_order_notional() -> f64 {
    10.0
}
fn default_max_order_notional() -> f64 {
    100_000.0
}
fn default_warning_threshold() -> f64 {
    0.8
}
fn default_caution_threshold() -> f64 {
    0.9
}
fn default_caution_size_ratio() -> f64 {
    0.5
}
fn default_failure_mode() -> FailureMode {
    FailureMode::FailClose
}
fn default_fallback_size() -> f64 {
    0.001
}

/// Active global risk configuration. Every field carries a serde default so
/// older persisted configs keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum notional for a single position.
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,

    /// Maximum notional summed over all open positions.
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure: f64,

    /// Default stop-loss distance as a fraction of entry price.
    #[serde(default = "default_stop_loss_ratio")]
    pub stop_loss_ratio: f64,

    /// Default take-profit distance as a fraction of entry price.
    #[serde(default = "default_take_profit_ratio")]
    pub take_profit_ratio: f64,

    /// Optional trailing-stop distance as a fraction of peak price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop_ratio: Option<f64>,

    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: f64,

    #[serde(default = "default_max_order_notional")]
    pub max_order_notional: f64,

    #[serde(default = "default_enabled")]
    pub use_daily_trade_limit: bool,

    #[serde(default = "default_enabled")]
    pub use_daily_loss_limit: bool,

    /// Daily-loss usage fraction at which signals carry a warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,

    /// Daily-loss usage fraction at which sizes are shrunk.
    #[serde(default = "default_caution_threshold")]
    pub caution_threshold: f64,

    /// Multiplier applied to the size in the caution band.
    #[serde(default = "default_caution_size_ratio")]
    pub caution_size_ratio: f64,

    #[serde(default = "default_failure_mode")]
    pub failure_mode: FailureMode,

    /// Size cap applied when failing open under FAIL_LIMIT.
    #[serde(default = "default_fallback_size")]
    pub fallback_size: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Optional per-strategy override layered over the global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskOverride {
    /// Disables all risk checks for this strategy.
    #[serde(default)]
    pub disable_risk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_ratio: Option<f64>,
    /// Absolute realised-PnL target that auto-stops the strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_target: Option<f64>,
    /// Percentage-of-baseline profit target (e.g. 5.0 for 5%).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_target_pct: Option<f64>,
    /// Baseline notional for percentage targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_target_baseline: Option<f64>,
}
