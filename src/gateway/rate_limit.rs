// =============================================================================
// Rate-Limit Accounting — per-venue weight windows
// =============================================================================
//
// Gateways report consumed request weight into a shared tracker keyed by a
// time window. Callers probe before issuing a call; usage at or above 90% of
// the window limit refuses further calls until the window rolls.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Fraction of the window limit at which further calls are refused.
const REFUSE_THRESHOLD: f64 = 0.9;

/// Sliding-window weight tracker for one venue.
pub struct WeightWindow {
    window: Duration,
    limit: u32,
    inner: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    used: u32,
}

/// Serialisable view of the current window.
#[derive(Debug, Clone, Serialize)]
pub struct WeightSnapshot {
    pub used: u32,
    pub limit: u32,
    pub window_secs: u64,
}

impl WeightWindow {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            inner: Mutex::new(WindowState {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    fn roll_if_elapsed(&self, state: &mut WindowState) {
        if state.started.elapsed() >= self.window {
            debug!(used = state.used, "rate-limit window rolled");
            state.started = Instant::now();
            state.used = 0;
        }
    }

    /// Probe-and-record: returns `false` without recording when spending
    /// `weight` would push usage to or past 90% of the limit.
    pub fn try_acquire(&self, weight: u32) -> bool {
        let mut state = self.inner.lock();
        self.roll_if_elapsed(&mut state);
        let ceiling = (self.limit as f64 * REFUSE_THRESHOLD) as u32;
        if state.used + weight > ceiling {
            warn!(
                used = state.used,
                requested = weight,
                ceiling,
                limit = self.limit,
                "rate-limit window near capacity — call refused"
            );
            return false;
        }
        state.used += weight;
        true
    }

    /// Record weight reported by the venue after a call (e.g. from response
    /// headers), replacing the local estimate when it is higher.
    pub fn record_reported(&self, used: u32) {
        let mut state = self.inner.lock();
        self.roll_if_elapsed(&mut state);
        if used > state.used {
            state.used = used;
        }
    }

    pub fn snapshot(&self) -> WeightSnapshot {
        let mut state = self.inner.lock();
        self.roll_if_elapsed(&mut state);
        WeightSnapshot {
            used: state.used,
            limit: self.limit,
            window_secs: self.window.as_secs(),
        }
    }
}

impl std::fmt::Debug for WeightWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("WeightWindow")
            .field("used", &snap.used)
            .field("limit", &snap.limit)
            .field("window_secs", &snap.window_secs)
            .finish()
    }
}
