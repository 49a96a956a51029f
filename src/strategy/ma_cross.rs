// =============================================================================
// MA Cross strategy — fast/slow SMA crossover
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::indicators::calculate_sma;
use crate::types::SignalAction;

fn default_size() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaCrossParams {
    pub fast: usize,
    pub slow: usize,
    #[serde(default = "default_size")]
    pub size: f64,
}

impl MaCrossParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.fast == 0 || self.slow == 0 {
            return Err(CoreError::Validation("ma_cross periods must be positive".into()));
        }
        if self.fast >= self.slow {
            return Err(CoreError::Validation(format!(
                "ma_cross fast ({}) must be below slow ({})",
                self.fast, self.slow
            )));
        }
        if self.size <= 0.0 {
            return Err(CoreError::Validation("ma_cross size must be positive".into()));
        }
        Ok(())
    }
}

/// Serialisable accumulated state. `slow` records the window sizing the
/// state was built under, so a period edit rebuilds from scratch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaCrossState {
    pub window: Vec<f64>,
    pub prev_fast: Option<f64>,
    pub prev_slow: Option<f64>,
    #[serde(default)]
    pub slow: usize,
}

#[derive(Debug)]
pub struct MaCrossStrategy {
    params: MaCrossParams,
    window: VecDeque<f64>,
    prev_fast: Option<f64>,
    prev_slow: Option<f64>,
}

impl MaCrossStrategy {
    pub fn new(params: MaCrossParams) -> Result<Self, CoreError> {
        params.validate()?;
        Ok(Self {
            window: VecDeque::with_capacity(params.slow),
            params,
            prev_fast: None,
            prev_slow: None,
        })
    }

    pub fn size(&self) -> f64 {
        self.params.size
    }

    /// BUY on the tick where the fast SMA first rises above the slow SMA,
    /// SELL on the inverse transition, HOLD otherwise.
    pub fn on_tick(&mut self, price: f64) -> SignalAction {
        if self.window.len() >= self.params.slow {
            self.window.pop_front();
        }
        self.window.push_back(price);

        let closes: Vec<f64> = self.window.iter().copied().collect();
        let fast = calculate_sma(&closes, self.params.fast);
        let slow = calculate_sma(&closes, self.params.slow);

        let action = match (fast, slow, self.prev_fast, self.prev_slow) {
            (Some(f), Some(s), Some(pf), Some(ps)) => {
                if pf <= ps && f > s {
                    SignalAction::Buy
                } else if pf >= ps && f < s {
                    SignalAction::Sell
                } else {
                    SignalAction::Hold
                }
            }
            _ => SignalAction::Hold,
        };

        self.prev_fast = fast;
        self.prev_slow = slow;
        action
    }

    pub fn get_state(&self) -> MaCrossState {
        MaCrossState {
            window: self.window.iter().copied().collect(),
            prev_fast: self.prev_fast,
            prev_slow: self.prev_slow,
            slow: self.params.slow,
        }
    }

    /// Restore accumulated state. State built under a different slow period
    /// is discarded so the window rebuilds from scratch; an over-long window
    /// from legacy state is truncated to the most recent entries.
    pub fn set_state(&mut self, state: MaCrossState) {
        if state.slow != 0 && state.slow != self.params.slow {
            return;
        }
        let start = state.window.len().saturating_sub(self.params.slow);
        self.window = state.window[start..].iter().copied().collect();
        self.prev_fast = state.prev_fast;
        self.prev_slow = state.prev_slow;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(fast: usize, slow: usize) -> MaCrossStrategy {
        MaCrossStrategy::new(MaCrossParams {
            fast,
            slow,
            size: 1.0,
        })
        .unwrap()
    }

    #[test]
    fn golden_cross_fires_once() {
        // Ten flat ticks then a rally: exactly one BUY, no further signals.
        let mut s = strategy(3, 10);
        let prices = [
            10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 13.0, 14.0,
            15.0,
        ];
        let actions: Vec<SignalAction> = prices.iter().map(|&p| s.on_tick(p)).collect();

        let buys: Vec<usize> = actions
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == SignalAction::Buy)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(buys.len(), 1, "expected exactly one BUY, got {actions:?}");
        // Zero-based index 10 or 11 == tick 11 or 12.
        assert!(buys[0] == 10 || buys[0] == 11, "BUY at tick {}", buys[0] + 1);
        assert!(!actions.contains(&SignalAction::Sell));
    }

    #[test]
    fn death_cross_emits_sell() {
        let mut s = strategy(3, 10);
        for _ in 0..10 {
            s.on_tick(10.0);
        }
        let mut actions = Vec::new();
        for p in [9.0, 8.0, 7.0, 6.0] {
            actions.push(s.on_tick(p));
        }
        assert!(actions.contains(&SignalAction::Sell));
        assert!(!actions.contains(&SignalAction::Buy));
    }

    #[test]
    fn holds_until_window_warm() {
        let mut s = strategy(2, 5);
        for p in [1.0, 2.0, 3.0, 4.0] {
            assert_eq!(s.on_tick(p), SignalAction::Hold);
        }
    }

    #[test]
    fn state_roundtrip_preserves_window() {
        let mut s = strategy(3, 10);
        for p in [10.0, 11.0, 12.0, 13.0] {
            s.on_tick(p);
        }
        let state = s.get_state();
        let mut restored = strategy(3, 10);
        restored.set_state(state.clone());
        assert_eq!(restored.get_state().window, state.window);
        assert_eq!(restored.get_state().prev_fast, state.prev_fast);
    }

    #[test]
    fn oversized_legacy_window_is_truncated() {
        let mut s = strategy(2, 3);
        s.set_state(MaCrossState {
            window: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            prev_fast: None,
            prev_slow: None,
            slow: 0, // legacy state with no recorded sizing
        });
        assert_eq!(s.get_state().window, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn changed_period_rebuilds_from_scratch() {
        let mut old = strategy(3, 10);
        for p in [10.0, 11.0, 12.0, 13.0] {
            old.on_tick(p);
        }
        let mut resized = strategy(3, 5);
        resized.set_state(old.get_state());
        assert!(resized.get_state().window.is_empty());
    }

    #[test]
    fn invalid_params_rejected() {
        assert!(MaCrossStrategy::new(MaCrossParams {
            fast: 10,
            slow: 3,
            size: 1.0
        })
        .is_err());
        assert!(MaCrossStrategy::new(MaCrossParams {
            fast: 0,
            slow: 3,
            size: 1.0
        })
        .is_err());
        assert!(MaCrossStrategy::new(MaCrossParams {
            fast: 2,
            slow: 3,
            size: 0.0
        })
        .is_err());
    }
}
