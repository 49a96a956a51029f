// =============================================================================
// Bollinger band strategy — buy the lower band, sell the upper
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::indicators::calculate_bollinger;
use crate::types::SignalAction;

fn default_period() -> usize {
    20
}
fn default_num_std() -> f64 {
    2.0
}
fn default_size() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BollingerParams {
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_num_std")]
    pub num_std: f64,
    #[serde(default = "default_size")]
    pub size: f64,
}

impl BollingerParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.period < 2 {
            return Err(CoreError::Validation(
                "bollinger period must be at least 2".into(),
            ));
        }
        if self.num_std <= 0.0 {
            return Err(CoreError::Validation(
                "bollinger num_std must be positive".into(),
            ));
        }
        if self.size <= 0.0 {
            return Err(CoreError::Validation("bollinger size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BollingerState {
    pub window: Vec<f64>,
    #[serde(default)]
    pub period: usize,
}

#[derive(Debug)]
pub struct BollingerStrategy {
    params: BollingerParams,
    window: VecDeque<f64>,
}

impl BollingerStrategy {
    pub fn new(params: BollingerParams) -> Result<Self, CoreError> {
        params.validate()?;
        Ok(Self {
            window: VecDeque::with_capacity(params.period),
            params,
        })
    }

    pub fn size(&self) -> f64 {
        self.params.size
    }

    /// BUY when price touches or crosses the lower band, SELL at the upper.
    /// Degenerate (zero-width) bands hold: a flat series carries no edge.
    pub fn on_tick(&mut self, price: f64) -> SignalAction {
        if self.window.len() >= self.params.period {
            self.window.pop_front();
        }
        self.window.push_back(price);

        let closes: Vec<f64> = self.window.iter().copied().collect();
        match calculate_bollinger(&closes, self.params.period, self.params.num_std) {
            Some(bb) if bb.upper > bb.lower => {
                if price <= bb.lower {
                    SignalAction::Buy
                } else if price >= bb.upper {
                    SignalAction::Sell
                } else {
                    SignalAction::Hold
                }
            }
            _ => SignalAction::Hold,
        }
    }

    pub fn get_state(&self) -> BollingerState {
        BollingerState {
            window: self.window.iter().copied().collect(),
            period: self.params.period,
        }
    }

    /// State built under a different period is discarded so the window
    /// rebuilds from scratch.
    pub fn set_state(&mut self, state: BollingerState) {
        if state.period != 0 && state.period != self.params.period {
            return;
        }
        let start = state.window.len().saturating_sub(self.params.period);
        self.window = state.window[start..].iter().copied().collect();
    }
}
