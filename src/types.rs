// =============================================================================
// Shared types used across the Meridian trading core
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single price tick from the market feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    /// Venue event time, milliseconds since epoch.
    pub ts: i64,
}

/// A closed OHLCV bar used for strategy warm-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Action a strategy may request on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    /// Administrative market-close of a strategy's position.
    PanicSell,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
            Self::PanicSell => write!(f, "PANIC_SELL"),
        }
    }
}

/// A strategy's per-tick output. HOLD is non-actionable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub action: SignalAction,
    pub symbol: String,
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported order types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
    LimitMaker,
    TrailingStop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "STOP_LOSS",
            Self::StopLossLimit => "STOP_LOSS_LIMIT",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
            Self::LimitMaker => "LIMIT_MAKER",
            Self::TrailingStop => "TRAILING_STOP",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of an order.
///
/// FILLED/CANCELED/REJECTED/EXPIRED are terminal: once reached the order is
/// never mutated again. UNKNOWN marks an order whose venue state must be
/// resolved by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Normalise a venue status string into the internal enum.
    pub fn from_venue(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "NEW" | "ACCEPTED" | "PENDING_NEW" => Self::New,
            "PARTIALLY_FILLED" | "PARTIAL" => Self::Partial,
            "FILLED" => Self::Filled,
            "CANCELED" | "CANCELLED" | "PENDING_CANCEL" => Self::Canceled,
            "REJECTED" => Self::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => Self::Expired,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// A tracked order. `strategy_id` is `None` for manual orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub user_id: String,
    pub connection_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub qty: f64,
    #[serde(default)]
    pub filled_qty: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }
}

/// An asynchronous order state change from the venue user-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    /// Cumulative filled quantity after this update.
    pub filled_qty: f64,
    /// Fill price for the increment covered by this update.
    pub fill_price: f64,
    #[serde(default)]
    pub fee: f64,
    pub ts: i64,
}

// ---------------------------------------------------------------------------
// Trades and strategy lifecycle
// ---------------------------------------------------------------------------

/// A realised trade, fed into the risk metrics path. `pnl` is net of `fee`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: f64,
    pub pnl: f64,
    pub fee: f64,
}

/// Lifecycle status of a strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    Active,
    Paused,
    Stopped,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// Persisted definition of a strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub id: String,
    /// Type tag: `ma_cross`, `rsi`, `bollinger`, `grid`, `volume_profile`,
    /// `order_book_imbalance`, or `external`.
    pub strategy_type: String,
    pub symbol: String,
    pub interval: String,
    /// Type-specific parameter bag.
    pub params: serde_json::Value,
    /// Owning user; unowned instances are globally visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Bound connection; required for live trading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub status: StrategyStatus,
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// A user's credential record. Plaintext credentials exist only transiently
/// inside the gateway pool; they are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub user_id: String,
    pub exchange_type: String,
    pub name: String,
    pub encrypted_api_key: String,
    pub encrypted_api_secret: String,
    pub key_version: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Account snapshot (input to the risk evaluator)
// ---------------------------------------------------------------------------

/// Point-in-time account view used during risk evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    /// Sum of |qty| * price over all open positions.
    pub total_exposure: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_terminal_set() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
    }

    #[test]
    fn venue_status_normalisation() {
        assert_eq!(OrderStatus::from_venue("FILLED"), OrderStatus::Filled);
        assert_eq!(
            OrderStatus::from_venue("partially_filled"),
            OrderStatus::Partial
        );
        assert_eq!(OrderStatus::from_venue("CANCELLED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_venue("weird"), OrderStatus::Unknown);
    }

    #[test]
    fn side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(SignalAction::PanicSell.to_string(), "PANIC_SELL");
        assert_eq!(OrderStatus::Partial.to_string(), "PARTIAL");
        assert_eq!(OrderType::StopLossLimit.to_string(), "STOP_LOSS_LIMIT");
        assert_eq!(StrategyStatus::Active.to_string(), "ACTIVE");
    }

    #[test]
    fn serde_roundtrip_for_order() {
        let order = Order {
            id: "o-1".into(),
            strategy_id: Some("s-1".into()),
            user_id: "u-1".into(),
            connection_id: "c-1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: 100.0,
            qty: 0.5,
            filled_qty: 0.0,
            status: OrderStatus::New,
            venue_order_id: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, order.id);
        assert_eq!(back.status, OrderStatus::New);
        assert!((back.notional() - 50.0).abs() < 1e-12);
    }
}
