// =============================================================================
// Paper gateway — dry-run venue with synthetic immediate fills
// =============================================================================
//
// Registered as the built-in `paper` exchange type. Orders fill instantly at
// the requested price (market orders at the last known mark). Useful for the
// safe-start mode and for tests.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::errors::CoreError;
use crate::types::{OrderSide, OrderStatus};

use super::{OrderRequest, OrderResult, VenueBalance, VenueGateway};

#[derive(Debug)]
pub struct PaperGateway {
    /// Simulated per-symbol signed positions.
    positions: RwLock<HashMap<String, f64>>,
    /// Simulated balance; starts at `initial_balance`.
    balance: RwLock<VenueBalance>,
    /// Mark prices used to fill market orders with no price attached.
    marks: RwLock<HashMap<String, f64>>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl PaperGateway {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            balance: RwLock::new(VenueBalance {
                available: initial_balance,
                locked: 0.0,
            }),
            marks: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Update the mark price used for market fills.
    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.marks.write().insert(symbol.to_string(), price);
    }

    /// Force a simulated position (test and reconciliation scenarios).
    pub fn set_position(&self, symbol: &str, qty: f64) {
        self.positions.write().insert(symbol.to_string(), qty);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl VenueGateway for PaperGateway {
    fn exchange(&self) -> &str {
        "paper"
    }

    async fn submit_order(&self, req: &OrderRequest) -> Result<OrderResult, CoreError> {
        if req.qty <= 0.0 {
            return Err(CoreError::Validation(format!(
                "order quantity must be positive, got {}",
                req.qty
            )));
        }
        let fill_price = match req.price {
            Some(p) if p > 0.0 => p,
            _ => self
                .marks
                .read()
                .get(&req.symbol)
                .copied()
                .ok_or_else(|| {
                    CoreError::Gateway(format!("no mark price for {}", req.symbol))
                })?,
        };

        let signed = match req.side {
            OrderSide::Buy => req.qty,
            OrderSide::Sell => -req.qty,
        };
        *self
            .positions
            .write()
            .entry(req.symbol.clone())
            .or_insert(0.0) += signed;

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let venue_order_id = format!("paper-{id}");
        info!(
            symbol = %req.symbol,
            side = %req.side,
            qty = req.qty,
            fill_price,
            venue_order_id = %venue_order_id,
            "paper fill"
        );

        Ok(OrderResult {
            venue_order_id,
            status: OrderStatus::Filled,
            filled_qty: req.qty,
            avg_fill_price: Some(fill_price),
        })
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<(), CoreError> {
        // Paper orders fill instantly; a cancel can only miss.
        debug!(symbol, venue_order_id, "paper cancel (no-op)");
        Ok(())
    }

    async fn get_balance(&self) -> Result<Option<VenueBalance>, CoreError> {
        Ok(Some(*self.balance.read()))
    }

    async fn get_positions(&self) -> Result<HashMap<String, f64>, CoreError> {
        Ok(self.positions.read().clone())
    }

    async fn get_server_time(&self) -> Result<Option<i64>, CoreError> {
        Ok(Some(chrono::Utc::now().timestamp_millis()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!("paper gateway closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderType;

    fn request(side: OrderSide, qty: f64, price: Option<f64>) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            side,
            order_type: OrderType::Market,
            qty,
            price,
            client_order_id: "t-1".into(),
        }
    }

    #[tokio::test]
    async fn fills_immediately_at_request_price() {
        let gw = PaperGateway::new(10_000.0);
        let res = gw.submit_order(&request(OrderSide::Buy, 1.0, Some(100.0))).await.unwrap();
        assert_eq!(res.status, OrderStatus::Filled);
        assert_eq!(res.filled_qty, 1.0);
        assert_eq!(res.avg_fill_price, Some(100.0));
        assert_eq!(gw.get_positions().await.unwrap()["BTCUSDT"], 1.0);
    }

    #[tokio::test]
    async fn market_order_uses_mark_price() {
        let gw = PaperGateway::new(10_000.0);
        gw.set_mark("BTCUSDT", 250.0);
        let res = gw.submit_order(&request(OrderSide::Sell, 2.0, None)).await.unwrap();
        assert_eq!(res.avg_fill_price, Some(250.0));
        assert_eq!(gw.get_positions().await.unwrap()["BTCUSDT"], -2.0);
    }

    #[tokio::test]
    async fn market_order_without_mark_fails() {
        let gw = PaperGateway::new(10_000.0);
        let err = gw.submit_order(&request(OrderSide::Buy, 1.0, None)).await.unwrap_err();
        assert_eq!(err.code(), "GW_ERROR");
    }

    #[tokio::test]
    async fn nonpositive_qty_rejected() {
        let gw = PaperGateway::new(10_000.0);
        let err = gw.submit_order(&request(OrderSide::Buy, 0.0, Some(1.0))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID");
    }

    #[tokio::test]
    async fn close_marks_gateway() {
        let gw = PaperGateway::new(10_000.0);
        assert!(!gw.is_closed());
        gw.close().await;
        assert!(gw.is_closed());
    }
}
