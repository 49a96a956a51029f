// =============================================================================
// Venue gateway contract — submit/cancel plus optional probed capabilities
// =============================================================================
//
// The required surface is `submit_order` and `cancel_order`. Everything else
// is an optional capability with a neutral default: a venue that cannot
// report positions returns an empty map, one without a balance endpoint
// returns `None`, and `close` is a no-op. Adapters normalise venue status
// strings into the internal `OrderStatus` enum.
// =============================================================================

pub mod crypto;
pub mod paper;
pub mod pool;
pub mod rate_limit;
pub mod time_sync;

pub use crypto::KeyManager;
pub use paper::PaperGateway;
pub use pool::{GatewayPool, PoolConfig, PoolStats};
pub use rate_limit::WeightWindow;
pub use time_sync::TimeSync;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::types::{OrderSide, OrderStatus, OrderType};

/// Request forwarded to a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub client_order_id: String,
}

/// Venue response to a submission, normalised to internal statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub venue_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<f64>,
}

/// Venue-reported account balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VenueBalance {
    pub available: f64,
    pub locked: f64,
}

/// Plaintext credentials handed to a gateway factory. Never logged, never
/// persisted; dropped as soon as the gateway owns its copy.
pub struct GatewayCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// A venue adapter. Required: submit and cancel. Optional capabilities keep
/// their neutral defaults when the venue lacks them.
#[async_trait]
pub trait VenueGateway: Send + Sync + std::fmt::Debug {
    fn exchange(&self) -> &str;

    async fn submit_order(&self, req: &OrderRequest) -> Result<OrderResult, CoreError>;

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<(), CoreError>;

    /// Liveness probe. Defaults to healthy for venues without one.
    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Venue balance, when supported.
    async fn get_balance(&self) -> Result<Option<VenueBalance>, CoreError> {
        Ok(None)
    }

    /// Per-symbol signed position quantities. Venues without position
    /// reporting (e.g. spot) return an empty map.
    async fn get_positions(&self) -> Result<HashMap<String, f64>, CoreError> {
        Ok(HashMap::new())
    }

    /// Open orders, optionally filtered by symbol.
    async fn get_open_orders(
        &self,
        _symbol: Option<&str>,
    ) -> Result<Vec<OrderResult>, CoreError> {
        Ok(Vec::new())
    }

    /// Venue server time in milliseconds, when supported.
    async fn get_server_time(&self) -> Result<Option<i64>, CoreError> {
        Ok(None)
    }

    /// Release any venue-side resources. Called on eviction and shutdown.
    async fn close(&self) {}
}

/// Builds a gateway for one exchange type from decrypted credentials.
pub type GatewayFactory =
    Arc<dyn Fn(GatewayCredentials) -> Result<Arc<dyn VenueGateway>, CoreError> + Send + Sync>;
