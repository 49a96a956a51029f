// =============================================================================
// Position arithmetic — signed per-strategy positions with realised PnL
// =============================================================================
//
// Rules:
//   BUY  — increases qty; avg_price is the weighted mean over the increased
//          magnitude when adding to a long, or first closes an existing short
//          at avg_price (realising PnL) before opening long with the excess.
//   SELL — mirror image: closes long at avg_price realising
//          (price - avg_price) * closeQty, then opens short with the excess.
//   |qty| < 1e-9 collapses to (qty=0, avg_price=0).
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::OrderSide;

/// Magnitudes below this are treated as a flat position.
pub const QTY_EPSILON: f64 = 1e-9;

/// A signed position row: positive qty is long, negative is short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
}

/// Outcome of applying one fill to a position.
#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    pub state: PositionState,
    /// PnL realised by this fill alone (0.0 when only opening).
    pub realized_delta: f64,
}

/// Apply a fill of `qty` at `price` on `side` to `state`.
pub fn apply_fill(state: PositionState, side: OrderSide, qty: f64, price: f64) -> FillOutcome {
    let signed = match side {
        OrderSide::Buy => qty,
        OrderSide::Sell => -qty,
    };
    let mut next = state;
    let mut realized = 0.0;

    if state.qty == 0.0 || state.qty.signum() == signed.signum() {
        // Opening or adding: weighted mean over the increased magnitude.
        let old_abs = state.qty.abs();
        let new_abs = old_abs + qty;
        next.avg_price = if new_abs > 0.0 {
            (state.avg_price * old_abs + price * qty) / new_abs
        } else {
            0.0
        };
        next.qty = state.qty + signed;
    } else {
        // Reducing or flipping: close against the existing side first.
        let close_qty = qty.min(state.qty.abs());
        let direction = state.qty.signum();
        realized = direction * (price - state.avg_price) * close_qty;
        next.realized_pnl += realized;
        next.qty = state.qty + signed;

        if next.qty.abs() < QTY_EPSILON {
            next.qty = 0.0;
            next.avg_price = 0.0;
        } else if next.qty.signum() != state.qty.signum() {
            // Flipped: the excess opens a fresh position at the fill price.
            next.avg_price = price;
        }
        // A pure reduction keeps the original avg_price.
    }

    if next.qty.abs() < QTY_EPSILON {
        next.qty = 0.0;
        next.avg_price = 0.0;
    }

    FillOutcome {
        state: next,
        realized_delta: realized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(state: PositionState, side: OrderSide, qty: f64, price: f64) -> PositionState {
        apply_fill(state, side, qty, price).state
    }

    #[test]
    fn buy_weighted_average() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 1.0, 100.0);
        s = apply(s, OrderSide::Buy, 1.0, 120.0);
        assert!((s.qty - 2.0).abs() < 1e-12);
        assert!((s.avg_price - 110.0).abs() < 1e-12);
        assert_eq!(s.realized_pnl, 0.0);
    }

    #[test]
    fn partial_sell_realises_against_avg() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 1.0, 100.0);
        s = apply(s, OrderSide::Buy, 1.0, 120.0);
        let out = apply_fill(s, OrderSide::Sell, 1.0, 130.0);
        assert!((out.state.qty - 1.0).abs() < 1e-12);
        assert!((out.state.avg_price - 110.0).abs() < 1e-12);
        assert!((out.realized_delta - 20.0).abs() < 1e-12);
        assert!((out.state.realized_pnl - 20.0).abs() < 1e-12);
    }

    #[test]
    fn full_round_trip_scenario() {
        // BUY 1 @ 100, BUY 1 @ 120 => qty=2 avg=110.
        // SELL 1 @ 130 => qty=1 avg=110 realized=+20.
        // SELL 1 @ 90  => qty=0 avg=0   realized=0 (cumulative: +20 - 20).
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 1.0, 100.0);
        s = apply(s, OrderSide::Buy, 1.0, 120.0);
        s = apply(s, OrderSide::Sell, 1.0, 130.0);
        s = apply(s, OrderSide::Sell, 1.0, 90.0);
        assert_eq!(s.qty, 0.0);
        assert_eq!(s.avg_price, 0.0);
        assert!((s.realized_pnl - 0.0).abs() < 1e-12);
    }

    #[test]
    fn round_trip_pnl_is_price_difference() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 3.0, 50.0);
        s = apply(s, OrderSide::Sell, 3.0, 57.0);
        assert_eq!(s.qty, 0.0);
        assert_eq!(s.avg_price, 0.0);
        assert!((s.realized_pnl - 21.0).abs() < 1e-12);
    }

    #[test]
    fn sell_beyond_long_opens_short_at_fill_price() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 1.0, 100.0);
        let out = apply_fill(s, OrderSide::Sell, 2.5, 110.0);
        assert!((out.state.qty + 1.5).abs() < 1e-12);
        assert!((out.state.avg_price - 110.0).abs() < 1e-12);
        assert!((out.realized_delta - 10.0).abs() < 1e-12);
    }

    #[test]
    fn short_close_realises_inverse() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Sell, 2.0, 100.0);
        let out = apply_fill(s, OrderSide::Buy, 2.0, 90.0);
        assert_eq!(out.state.qty, 0.0);
        assert_eq!(out.state.avg_price, 0.0);
        // Short from 100 covered at 90: +10 per unit.
        assert!((out.realized_delta - 20.0).abs() < 1e-12);
    }

    #[test]
    fn epsilon_dust_collapses_to_flat() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 1.0, 100.0);
        s = apply(s, OrderSide::Sell, 1.0 - 1e-12, 100.0);
        assert_eq!(s.qty, 0.0);
        assert_eq!(s.avg_price, 0.0);
    }

    #[test]
    fn reduction_preserves_avg_price() {
        let mut s = PositionState::default();
        s = apply(s, OrderSide::Buy, 4.0, 200.0);
        s = apply(s, OrderSide::Sell, 1.0, 210.0);
        assert!((s.qty - 3.0).abs() < 1e-12);
        assert!((s.avg_price - 200.0).abs() < 1e-12);
    }
}
