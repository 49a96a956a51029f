// =============================================================================
// Strategy variants — a closed sum type with a shared capability set
// =============================================================================
//
// Capabilities: `id`, `name`, `on_tick`, `get_state`, `set_state`. Unknown
// type tags are a ValidationError, never silently skipped. The volume-profile
// and order-book-imbalance variants are driven by domain events outside the
// tick path and emit nothing from `on_tick`; the external bridge owns no
// local state.
// =============================================================================

pub mod bollinger;
pub mod engine;
pub mod external;
pub mod grid;
pub mod ma_cross;
pub mod rsi_reversal;

pub use engine::StrategyEngine;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::errors::CoreError;
use crate::indicators::IndicatorSnapshot;
use crate::types::{Signal, SignalAction, StrategyDefinition};

use bollinger::{BollingerParams, BollingerStrategy};
use external::{ExternalBridge, ExternalParams};
use grid::{GridParams, GridStrategy};
use ma_cross::{MaCrossParams, MaCrossStrategy};
use rsi_reversal::{RsiParams, RsiReversalStrategy};

/// Parameter bags for the event-driven variants. Their inputs (volume
/// buckets, order-book depth) arrive outside the tick path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeProfileParams {
    #[serde(default)]
    pub bucket_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObImbalanceParams {
    #[serde(default)]
    pub depth_levels: Option<usize>,
}

/// A concrete, configured, state-carrying strategy instance.
#[derive(Debug)]
pub struct Strategy {
    id: String,
    variant: Variant,
}

#[derive(Debug)]
enum Variant {
    MaCross(MaCrossStrategy),
    Rsi(RsiReversalStrategy),
    Bollinger(BollingerStrategy),
    Grid(GridStrategy),
    VolumeProfile(VolumeProfileParams),
    OrderBookImbalance(ObImbalanceParams),
    External(ExternalBridge),
}

impl Strategy {
    /// Instantiate the correct variant from a persisted definition. The
    /// parameter bag is validated against the variant's shape; an unknown
    /// type tag is a validation error.
    pub fn from_definition(
        def: &StrategyDefinition,
        bus: &Arc<EventBus>,
    ) -> Result<Self, CoreError> {
        let variant = match def.strategy_type.as_str() {
            "ma_cross" => {
                let params: MaCrossParams = serde_json::from_value(def.params.clone())?;
                Variant::MaCross(MaCrossStrategy::new(params)?)
            }
            "rsi" => {
                let params: RsiParams = serde_json::from_value(def.params.clone())?;
                Variant::Rsi(RsiReversalStrategy::new(params)?)
            }
            "bollinger" => {
                let params: BollingerParams = serde_json::from_value(def.params.clone())?;
                Variant::Bollinger(BollingerStrategy::new(params)?)
            }
            "grid" => {
                let params: GridParams = serde_json::from_value(def.params.clone())?;
                Variant::Grid(GridStrategy::new(params)?)
            }
            "volume_profile" => {
                let params: VolumeProfileParams = serde_json::from_value(def.params.clone())?;
                Variant::VolumeProfile(params)
            }
            "order_book_imbalance" => {
                let params: ObImbalanceParams = serde_json::from_value(def.params.clone())?;
                Variant::OrderBookImbalance(params)
            }
            "external" => {
                let params: ExternalParams = serde_json::from_value(def.params.clone())?;
                Variant::External(ExternalBridge::new(def.id.clone(), params, bus.clone())?)
            }
            other => {
                return Err(CoreError::Validation(format!(
                    "unknown strategy type '{other}'"
                )))
            }
        };
        Ok(Self {
            id: def.id.clone(),
            variant,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &'static str {
        match &self.variant {
            Variant::MaCross(_) => "ma_cross",
            Variant::Rsi(_) => "rsi",
            Variant::Bollinger(_) => "bollinger",
            Variant::Grid(_) => "grid",
            Variant::VolumeProfile(_) => "volume_profile",
            Variant::OrderBookImbalance(_) => "order_book_imbalance",
            Variant::External(_) => "external",
        }
    }

    /// Evaluate one tick. CPU-only; expected to return in microseconds.
    pub fn on_tick(
        &mut self,
        symbol: &str,
        price: f64,
        _indicators: &IndicatorSnapshot,
    ) -> Option<Signal> {
        let (action, size) = match &mut self.variant {
            Variant::MaCross(s) => (s.on_tick(price), s.size()),
            Variant::Rsi(s) => (s.on_tick(price), s.size()),
            Variant::Bollinger(s) => (s.on_tick(price), s.size()),
            Variant::Grid(s) => (s.on_tick(price), s.size()),
            // Event-driven variants do not participate in the tick path.
            Variant::VolumeProfile(_) | Variant::OrderBookImbalance(_) => return None,
            Variant::External(s) => {
                s.on_tick(symbol, price);
                return None;
            }
        };
        Some(Signal {
            strategy_id: self.id.clone(),
            action,
            symbol: symbol.to_string(),
            size,
            note: None,
        })
    }

    /// Opaque serialisable per-instance state. `None` when the variant owns
    /// no local state.
    pub fn get_state(&self) -> Option<serde_json::Value> {
        match &self.variant {
            Variant::MaCross(s) => serde_json::to_value(s.get_state()).ok(),
            Variant::Rsi(s) => serde_json::to_value(s.get_state()).ok(),
            Variant::Bollinger(s) => serde_json::to_value(s.get_state()).ok(),
            Variant::Grid(s) => serde_json::to_value(s.get_state()).ok(),
            Variant::VolumeProfile(_) | Variant::OrderBookImbalance(_) => None,
            Variant::External(_) => None,
        }
    }

    /// Rehydrate serialised state. Shapes that no longer match the current
    /// parameters are rejected so a resized window rebuilds from scratch.
    pub fn set_state(&mut self, state: serde_json::Value) -> Result<(), CoreError> {
        match &mut self.variant {
            Variant::MaCross(s) => s.set_state(serde_json::from_value(state)?),
            Variant::Rsi(s) => s.set_state(serde_json::from_value(state)?),
            Variant::Bollinger(s) => s.set_state(serde_json::from_value(state)?),
            Variant::Grid(s) => s.set_state(serde_json::from_value(state)?),
            Variant::VolumeProfile(_) | Variant::OrderBookImbalance(_) | Variant::External(_) => {}
        }
        Ok(())
    }

    /// Dedup helper: signals repeating the last emitted action are dropped.
    pub fn dedup(last: Option<SignalAction>, action: SignalAction) -> bool {
        last != Some(action)
    }
}
