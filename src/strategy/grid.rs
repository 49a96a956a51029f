// =============================================================================
// Grid strategy — buy the lower bound, sell the upper, with debounce
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::types::SignalAction;

/// Default debounce band: 0.2% past the bound clears the latch.
fn default_debounce_ratio() -> f64 {
    0.002
}
fn default_size() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    pub lower: f64,
    pub upper: f64,
    #[serde(default = "default_debounce_ratio")]
    pub debounce_ratio: f64,
    #[serde(default = "default_size")]
    pub size: f64,
}

impl GridParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.lower <= 0.0 || self.upper <= 0.0 {
            return Err(CoreError::Validation("grid bounds must be positive".into()));
        }
        if self.lower >= self.upper {
            return Err(CoreError::Validation(format!(
                "grid lower ({}) must be below upper ({})",
                self.lower, self.upper
            )));
        }
        if self.debounce_ratio < 0.0 {
            return Err(CoreError::Validation(
                "grid debounce_ratio cannot be negative".into(),
            ));
        }
        if self.size <= 0.0 {
            return Err(CoreError::Validation("grid size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridState {
    pub last_action: Option<SignalAction>,
}

#[derive(Debug)]
pub struct GridStrategy {
    params: GridParams,
    last_action: Option<SignalAction>,
}

impl GridStrategy {
    pub fn new(params: GridParams) -> Result<Self, CoreError> {
        params.validate()?;
        Ok(Self {
            params,
            last_action: None,
        })
    }

    pub fn size(&self) -> f64 {
        self.params.size
    }

    /// BUY at or below the lower bound unless already latched BUY; SELL
    /// symmetric at the upper bound. The latch clears once price recovers
    /// past the debounce band.
    pub fn on_tick(&mut self, price: f64) -> SignalAction {
        let debounce = self.params.debounce_ratio;

        match self.last_action {
            Some(SignalAction::Buy) if price > self.params.lower * (1.0 + debounce) => {
                self.last_action = None;
            }
            Some(SignalAction::Sell) if price < self.params.upper * (1.0 - debounce) => {
                self.last_action = None;
            }
            _ => {}
        }

        if price <= self.params.lower && self.last_action != Some(SignalAction::Buy) {
            self.last_action = Some(SignalAction::Buy);
            return SignalAction::Buy;
        }
        if price >= self.params.upper && self.last_action != Some(SignalAction::Sell) {
            self.last_action = Some(SignalAction::Sell);
            return SignalAction::Sell;
        }
        SignalAction::Hold
    }

    pub fn get_state(&self) -> GridState {
        GridState {
            last_action: self.last_action,
        }
    }

    pub fn set_state(&mut self, state: GridState) {
        self.last_action = state.last_action;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> GridStrategy {
        GridStrategy::new(GridParams {
            lower: 90.0,
            upper: 110.0,
            debounce_ratio: 0.002,
            size: 1.0,
        })
        .unwrap()
    }

    #[test]
    fn buys_at_lower_bound_once() {
        let mut s = strategy();
        assert_eq!(s.on_tick(89.0), SignalAction::Buy);
        // Still below the bound and latched: no repeat.
        assert_eq!(s.on_tick(88.0), SignalAction::Hold);
        assert_eq!(s.on_tick(89.9), SignalAction::Hold);
    }

    #[test]
    fn rebuys_after_debounce_recovery() {
        let mut s = strategy();
        assert_eq!(s.on_tick(89.0), SignalAction::Buy);
        // Recover past 90 * 1.002 = 90.18 to clear the latch.
        assert_eq!(s.on_tick(91.0), SignalAction::Hold);
        assert_eq!(s.on_tick(89.5), SignalAction::Buy);
    }

    #[test]
    fn sells_at_upper_bound_symmetrically() {
        let mut s = strategy();
        assert_eq!(s.on_tick(111.0), SignalAction::Sell);
        assert_eq!(s.on_tick(112.0), SignalAction::Hold);
        // Fall below 110 * 0.998 = 109.78 to clear, then sell again.
        assert_eq!(s.on_tick(109.0), SignalAction::Hold);
        assert_eq!(s.on_tick(110.5), SignalAction::Sell);
    }

    #[test]
    fn holds_inside_the_grid() {
        let mut s = strategy();
        for p in [95.0, 100.0, 105.0, 99.0] {
            assert_eq!(s.on_tick(p), SignalAction::Hold);
        }
    }

    #[test]
    fn state_roundtrip_preserves_latch() {
        let mut s = strategy();
        s.on_tick(89.0);
        let state = s.get_state();
        let mut restored = strategy();
        restored.set_state(state);
        // Latch restored: no duplicate BUY below the bound.
        assert_eq!(restored.on_tick(88.0), SignalAction::Hold);
    }

    #[test]
    fn invalid_bounds_rejected() {
        assert!(GridStrategy::new(GridParams {
            lower: 110.0,
            upper: 90.0,
            debounce_ratio: 0.002,
            size: 1.0
        })
        .is_err());
    }
}
