// =============================================================================
// RSI reversal strategy — buy oversold, sell overbought
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::indicators::calculate_rsi;
use crate::types::SignalAction;

fn default_period() -> usize {
    14
}
fn default_oversold() -> f64 {
    30.0
}
fn default_overbought() -> f64 {
    70.0
}
fn default_size() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiParams {
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    #[serde(default = "default_overbought")]
    pub overbought: f64,
    #[serde(default = "default_size")]
    pub size: f64,
}

impl RsiParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.period == 0 {
            return Err(CoreError::Validation("rsi period must be positive".into()));
        }
        if self.oversold >= self.overbought {
            return Err(CoreError::Validation(format!(
                "rsi oversold ({}) must be below overbought ({})",
                self.oversold, self.overbought
            )));
        }
        if self.size <= 0.0 {
            return Err(CoreError::Validation("rsi size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RsiState {
    pub window: Vec<f64>,
    #[serde(default)]
    pub period: usize,
}

#[derive(Debug)]
pub struct RsiReversalStrategy {
    params: RsiParams,
    /// `period + 1` prices: enough for `period` deltas.
    window: VecDeque<f64>,
}

impl RsiReversalStrategy {
    pub fn new(params: RsiParams) -> Result<Self, CoreError> {
        params.validate()?;
        Ok(Self {
            window: VecDeque::with_capacity(params.period + 1),
            params,
        })
    }

    pub fn size(&self) -> f64 {
        self.params.size
    }

    pub fn on_tick(&mut self, price: f64) -> SignalAction {
        if self.window.len() > self.params.period {
            self.window.pop_front();
        }
        self.window.push_back(price);

        let closes: Vec<f64> = self.window.iter().copied().collect();
        match calculate_rsi(&closes, self.params.period) {
            Some(rsi) if rsi < self.params.oversold => SignalAction::Buy,
            Some(rsi) if rsi > self.params.overbought => SignalAction::Sell,
            _ => SignalAction::Hold,
        }
    }

    pub fn get_state(&self) -> RsiState {
        RsiState {
            window: self.window.iter().copied().collect(),
            period: self.params.period,
        }
    }

    /// State built under a different period is discarded so the window
    /// rebuilds from scratch.
    pub fn set_state(&mut self, state: RsiState) {
        if state.period != 0 && state.period != self.params.period {
            return;
        }
        let cap = self.params.period + 1;
        let start = state.window.len().saturating_sub(cap);
        self.window = state.window[start..].iter().copied().collect();
    }
}
