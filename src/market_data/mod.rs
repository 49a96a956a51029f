// =============================================================================
// Market Feed Adapter — external tick streams to PriceTick events
// =============================================================================
//
// A feed task per symbol reads the venue trade WebSocket, parses each
// message into a `PriceTick`, and publishes it on the bus. Disconnects
// reconnect with capped exponential backoff. A REST history endpoint
// supplies closed bars for strategy warm-up, and a simulated driver feeds
// dry-run sessions and tests.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Topic};
use crate::errors::CoreError;
use crate::types::{Bar, PriceTick};

/// Initial reconnect delay; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Live WebSocket feed
// ---------------------------------------------------------------------------

/// Run the tick stream for one symbol until cancellation. Reconnects with
/// exponential backoff on every error.
pub async fn run_tick_feed(
    symbol: String,
    ws_base: String,
    bus: Arc<EventBus>,
    token: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if token.is_cancelled() {
            return;
        }
        match stream_once(&symbol, &ws_base, &bus, &token).await {
            Ok(()) => return, // cancelled mid-stream
            Err(e) => {
                error!(symbol = %symbol, error = %e, backoff_secs = backoff.as_secs(), "tick stream error — reconnecting");
            }
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn stream_once(
    symbol: &str,
    ws_base: &str,
    bus: &EventBus,
    token: &CancellationToken,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{ws_base}/ws/{lower}@trade");
    info!(url = %url, symbol = %symbol, "connecting to tick WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to tick WebSocket")?;
    info!(symbol = %symbol, "tick WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(symbol = %symbol, "tick feed cancelled");
                return Ok(());
            }
            msg = read.next() => match msg {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    match parse_tick_message(&text) {
                        Ok(tick) => bus.publish(Topic::PriceTick, Event::Tick(tick)),
                        Err(e) => warn!(symbol = %symbol, error = %e, "tick parse failed"),
                    }
                }
                Some(Ok(_)) => {} // ping/pong/binary frames
                Some(Err(e)) => return Err(e).context("tick stream read error"),
                None => anyhow::bail!("tick stream closed by venue"),
            }
        }
    }
}

/// Parse one venue trade message.
///
/// Expected shape: `{ "s": "BTCUSDT", "p": "57000.10", "T": 1700000000000 }`
/// with the price encoded as a string.
pub fn parse_tick_message(text: &str) -> Result<PriceTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse tick JSON")?;
    let symbol = root["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("price is not numeric")?;
    let ts = root["T"].as_i64().unwrap_or(0);
    Ok(PriceTick { symbol, price, ts })
}

// ---------------------------------------------------------------------------
// Warm-up bar history
// ---------------------------------------------------------------------------

/// Source of recent closed bars for strategy warm-up.
#[async_trait]
pub trait BarHistory: Send + Sync {
    async fn recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, CoreError>;
}

/// REST-backed history provider.
///
/// The venue returns an array of arrays:
/// `[0]` openTime, `[1]` open, `[2]` high, `[3]` low, `[4]` close,
/// `[5]` volume, `[6]` closeTime.
pub struct RestHistory {
    client: reqwest::Client,
    base_url: String,
}

impl RestHistory {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BarHistory for RestHistory {
    async fn recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, CoreError> {
        let url = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Gateway(format!("history request failed: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CoreError::Gateway(format!("history response parse failed: {e}")))?;
        if !status.is_success() {
            return Err(CoreError::Gateway(format!(
                "history endpoint returned {status}: {body}"
            )));
        }

        let raw = body
            .as_array()
            .ok_or_else(|| CoreError::Gateway("history response is not an array".into()))?;
        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed history entry");
                    continue;
                }
            };
            bars.push(Bar {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
            });
        }
        debug!(symbol, interval, count = bars.len(), "history bars fetched");
        Ok(bars)
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64, CoreError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| CoreError::Gateway(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(CoreError::Gateway(format!(
            "expected string or number, got {val}"
        )))
    }
}

/// In-memory history for dry-run mode and tests.
#[derive(Default)]
pub struct StaticHistory {
    bars: RwLock<HashMap<(String, String), Vec<Bar>>>,
}

impl StaticHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, symbol: &str, interval: &str, closes: &[f64]) {
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                open_time: i as i64 * 60_000,
                close_time: (i as i64 + 1) * 60_000 - 1,
                open: close,
                high: close,
                low: close,
                close,
                volume: 0.0,
            })
            .collect();
        self.bars
            .write()
            .insert((symbol.to_string(), interval.to_string()), bars);
    }
}

#[async_trait]
impl BarHistory for StaticHistory {
    async fn recent_bars(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Bar>, CoreError> {
        let bars = self.bars.read();
        let all = bars
            .get(&(symbol.to_string(), interval.to_string()))
            .cloned()
            .unwrap_or_default();
        let start = all.len().saturating_sub(limit as usize);
        Ok(all[start..].to_vec())
    }
}

// ---------------------------------------------------------------------------
// Simulated feed (dry-run)
// ---------------------------------------------------------------------------

/// Publish a fixed price series as ticks. Dry-run and test driver.
pub fn publish_series(bus: &EventBus, symbol: &str, prices: &[f64]) {
    for (i, &price) in prices.iter().enumerate() {
        bus.publish(
            Topic::PriceTick,
            Event::Tick(PriceTick {
                symbol: symbol.to_string(),
                price,
                ts: i as i64,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_tick() {
        let text = r#"{"e":"trade","s":"btcusdt","p":"57000.10","q":"0.5","T":1700000000000}"#;
        let tick = parse_tick_message(text).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert!((tick.price - 57_000.10).abs() < 1e-9);
        assert_eq!(tick.ts, 1_700_000_000_000);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse_tick_message(r#"{"p":"1.0"}"#).is_err());
        assert!(parse_tick_message(r#"{"s":"BTCUSDT"}"#).is_err());
        assert!(parse_tick_message("not json").is_err());
        assert!(parse_tick_message(r#"{"s":"BTCUSDT","p":"abc"}"#).is_err());
    }

    #[tokio::test]
    async fn static_history_respects_limit() {
        let history = StaticHistory::new();
        let closes: Vec<f64> = (0..150).map(|i| i as f64).collect();
        history.seed("BTCUSDT", "1m", &closes);

        let bars = history.recent_bars("BTCUSDT", "1m", 100).await.unwrap();
        assert_eq!(bars.len(), 100);
        assert_eq!(bars[0].close, 50.0);
        assert_eq!(bars[99].close, 149.0);

        let none = history.recent_bars("ETHUSDT", "1m", 100).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn simulated_feed_publishes_in_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::PriceTick, 16);
        publish_series(&bus, "BTCUSDT", &[1.0, 2.0, 3.0]);
        let mut prices = Vec::new();
        while let Some(ev) = sub.try_recv() {
            if let Event::Tick(t) = ev.as_ref() {
                prices.push(t.price);
            }
        }
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);
    }
}
