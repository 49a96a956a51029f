// =============================================================================
// Daily risk metrics — per-user counters with civil-day rollover
// =============================================================================
//
// `pnl` on a TradeResult is already net of fee; the fee is recorded for
// reporting but never subtracted again here.
// =============================================================================

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::types::TradeResult;

/// Per-user, per-day aggregates consumed by the evaluator and persisted via
/// an incrementing upsert keyed by civil date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub date: NaiveDate,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    /// Positive magnitude of losing PnL accumulated today.
    pub daily_losses: f64,
    pub total_realized_pnl: f64,
    pub max_drawdown: f64,
    pub max_profit: f64,
    /// Monitoring counters.
    pub evaluations: u64,
    pub rejections: u64,
}

impl DailyMetrics {
    pub fn new_for(date: NaiveDate) -> Self {
        Self {
            date,
            daily_pnl: 0.0,
            daily_trades: 0,
            daily_losses: 0.0,
            total_realized_pnl: 0.0,
            max_drawdown: 0.0,
            max_profit: 0.0,
            evaluations: 0,
            rejections: 0,
        }
    }

    pub fn today() -> Self {
        Self::new_for(Local::now().date_naive())
    }

    /// Reset the daily counters for a new civil day. Cumulative totals
    /// survive the rollover.
    pub fn roll_to(&mut self, date: NaiveDate) {
        self.date = date;
        self.daily_pnl = 0.0;
        self.daily_trades = 0;
        self.daily_losses = 0.0;
        self.evaluations = 0;
        self.rejections = 0;
    }

    /// Fold one realised trade into the counters.
    pub fn record_trade(&mut self, trade: &TradeResult) {
        self.daily_trades += 1;
        self.daily_pnl += trade.pnl;
        if trade.pnl < 0.0 {
            self.daily_losses += -trade.pnl;
        }
        self.total_realized_pnl += trade.pnl;
        if self.total_realized_pnl > self.max_profit {
            self.max_profit = self.total_realized_pnl;
        }
        let drawdown = self.max_profit - self.total_realized_pnl;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }
    }

    /// Fraction of the daily loss budget consumed.
    pub fn loss_usage(&self, max_daily_loss: f64) -> f64 {
        if max_daily_loss > 0.0 {
            self.daily_losses / max_daily_loss
        } else {
            0.0
        }
    }
}
