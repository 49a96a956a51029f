// =============================================================================
// Indicator Engine — per-symbol rolling price window
// =============================================================================
//
// Every price update recomputes SMA / RSI / Bollinger bands from the window
// and yields an immutable snapshot consumed by the strategy engine.
// =============================================================================

pub mod bollinger;
pub mod rsi;
pub mod sma;

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

pub use bollinger::{calculate_bollinger, BollingerBands};
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;

/// Default periods used for the shared engine snapshot. Strategies with
/// bespoke periods maintain their own windows.
const SMA_PERIOD: usize = 20;
const RSI_PERIOD: usize = 14;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STD: f64 = 2.0;

/// Immutable per-symbol indicator view at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSnapshot {
    pub last_price: f64,
    pub sma: Option<f64>,
    pub rsi: Option<f64>,
    pub bollinger: Option<BollingerBands>,
    /// Number of prices currently in the window.
    pub window_len: usize,
}

impl IndicatorSnapshot {
    /// Snapshot with just a price and no derived values (cold window).
    pub fn price_only(price: f64) -> Self {
        Self {
            last_price: price,
            sma: None,
            rsi: None,
            bollinger: None,
            window_len: 0,
        }
    }
}

/// Thread-safe rolling close-price window per symbol.
pub struct IndicatorEngine {
    windows: RwLock<HashMap<String, VecDeque<f64>>>,
    capacity: usize,
}

impl IndicatorEngine {
    /// `capacity` bounds each symbol's window; oldest prices are evicted.
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity: capacity.max(2),
        }
    }

    /// Push a price and compute the fresh snapshot for `symbol`.
    pub fn update(&self, symbol: &str, price: f64) -> IndicatorSnapshot {
        let mut windows = self.windows.write();
        let window = windows
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if window.len() >= self.capacity {
            window.pop_front();
        }
        window.push_back(price);

        let closes: Vec<f64> = window.iter().copied().collect();
        Self::compute(&closes, price)
    }

    /// Current snapshot without pushing a new price.
    pub fn snapshot(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        let windows = self.windows.read();
        let window = windows.get(symbol)?;
        let closes: Vec<f64> = window.iter().copied().collect();
        let last = *closes.last()?;
        Some(Self::compute(&closes, last))
    }

    fn compute(closes: &[f64], last_price: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            last_price,
            sma: calculate_sma(closes, SMA_PERIOD),
            rsi: calculate_rsi(closes, RSI_PERIOD),
            bollinger: calculate_bollinger(closes, BOLLINGER_PERIOD, BOLLINGER_STD),
            window_len: closes.len(),
        }
    }
}
