// =============================================================================
// External bridge strategy — forwards ticks to an out-of-process worker
// =============================================================================
//
// The tick path stays CPU-only: `on_tick` hands the tick to a bounded
// channel and returns immediately. A worker task posts each tick to the
// configured HTTP endpoint and maps the worker's response into a signal
// published on the bus. State is owned by the external process, so
// `get_state` has nothing to serialise.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::errors::CoreError;
use crate::types::{Signal, SignalAction};

const BRIDGE_QUEUE_DEPTH: usize = 64;
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);

fn default_size() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalParams {
    /// HTTP endpoint of the out-of-process worker.
    pub endpoint: String,
    #[serde(default = "default_size")]
    pub size: f64,
}

impl ExternalParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.endpoint.is_empty() {
            return Err(CoreError::Validation(
                "external strategy requires an endpoint".into(),
            ));
        }
        if self.size <= 0.0 {
            return Err(CoreError::Validation("external size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    strategy_id: &'a str,
    symbol: &'a str,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    action: String,
    #[serde(default)]
    size: Option<f64>,
    #[serde(default)]
    note: Option<String>,
}

struct BridgeTick {
    symbol: String,
    price: f64,
}

#[derive(Debug)]
pub struct ExternalBridge {
    params: ExternalParams,
    tx: mpsc::Sender<BridgeTick>,
}

impl ExternalBridge {
    /// Build the bridge and spawn its worker task. Must run inside a tokio
    /// runtime.
    pub fn new(
        strategy_id: String,
        params: ExternalParams,
        bus: Arc<EventBus>,
    ) -> Result<Self, CoreError> {
        params.validate()?;
        let (tx, rx) = mpsc::channel(BRIDGE_QUEUE_DEPTH);
        tokio::spawn(run_bridge_worker(
            strategy_id,
            params.endpoint.clone(),
            params.size,
            rx,
            bus,
        ));
        Ok(Self { params, tx })
    }

    pub fn size(&self) -> f64 {
        self.params.size
    }

    /// Non-blocking hand-off; a saturated bridge drops the tick.
    pub fn on_tick(&self, symbol: &str, price: f64) {
        let tick = BridgeTick {
            symbol: symbol.to_string(),
            price,
        };
        if self.tx.try_send(tick).is_err() {
            debug!(symbol, "external bridge queue full — tick dropped");
        }
    }
}

async fn run_bridge_worker(
    strategy_id: String,
    endpoint: String,
    default_size: f64,
    mut rx: mpsc::Receiver<BridgeTick>,
    bus: Arc<EventBus>,
) {
    let client = match reqwest::Client::builder().timeout(BRIDGE_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(strategy_id = %strategy_id, error = %e, "bridge HTTP client build failed");
            return;
        }
    };

    while let Some(tick) = rx.recv().await {
        let request = BridgeRequest {
            strategy_id: &strategy_id,
            symbol: &tick.symbol,
            price: tick.price,
        };
        let response = match client.post(&endpoint).json(&request).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(strategy_id = %strategy_id, error = %e, "bridge request failed");
                continue;
            }
        };
        let parsed: BridgeResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(strategy_id = %strategy_id, error = %e, "bridge response parse failed");
                continue;
            }
        };

        let action = match parsed.action.to_ascii_uppercase().as_str() {
            "BUY" => SignalAction::Buy,
            "SELL" => SignalAction::Sell,
            "HOLD" => continue,
            other => {
                warn!(strategy_id = %strategy_id, action = other, "bridge returned unknown action");
                continue;
            }
        };

        bus.publish(
            Topic::StrategySignal,
            Event::Signal(Signal {
                strategy_id: strategy_id.clone(),
                action,
                symbol: tick.symbol,
                size: parsed.size.unwrap_or(default_size),
                note: parsed.note,
            }),
        );
    }
    debug!(strategy_id = %strategy_id, "bridge worker exited");
}
