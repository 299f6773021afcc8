// =============================================================================
// Binance MarketSource — REST klines + kline WebSocket stream
// =============================================================================
//
// Only public market-data endpoints are used, so no request signing is
// involved. `fetch_range` maps one `GET /api/v3/klines` call; `stream_live`
// runs a reconnecting WebSocket loop feeding the data callback until the
// subscription handle is stopped.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::market_source::{
    LiveDataCallback, MarketSource, StreamErrorCallback, SubscriptionHandle,
};
use crate::types::{Candle, Interval, LiveCandle, StreamError, TimeRange};

/// Pause before reconnecting a dropped kline stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Binance caps klines responses at 1000 rows.
const MAX_KLINES_LIMIT: usize = 1000;

pub struct BinanceMarketSource {
    rest_base: String,
    ws_base: String,
    client: reqwest::Client,
}

impl Default for BinanceMarketSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceMarketSource {
    pub fn new() -> Self {
        Self::with_endpoints("https://api.binance.com", "wss://stream.binance.com:9443")
    }

    /// Endpoint override, used against testnets and in tests.
    pub fn with_endpoints(rest_base: impl Into<String>, ws_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            rest_base: rest_base.into(),
            ws_base: ws_base.into(),
            client,
        }
    }
}

#[async_trait]
impl MarketSource for BinanceMarketSource {
    async fn fetch_range(
        &self,
        symbol: &str,
        interval: Interval,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, MAX_KLINES_LIMIT);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.rest_base,
            symbol.to_uppercase(),
            interval.label(),
            range.start,
            range.end,
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {status}: {body}");
        }

        let rows = body
            .as_array()
            .context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_kline_row(row) {
                Ok(candle) => candles.push(candle),
                Err(err) => warn!(error = %err, "skipping malformed kline row"),
            }
        }

        debug!(
            symbol = %symbol,
            interval = %interval,
            start = range.start,
            end = range.end,
            count = candles.len(),
            "klines fetched"
        );
        Ok(candles)
    }

    fn stream_live(
        &self,
        symbol: &str,
        interval: Interval,
        on_data: LiveDataCallback,
        on_error: StreamErrorCallback,
    ) -> Result<SubscriptionHandle> {
        let url = format!(
            "{}/ws/{}@kline_{}",
            self.ws_base,
            symbol.to_lowercase(),
            interval.label()
        );

        let stop_flag = Arc::new(AtomicBool::new(false));
        let task_stop = stop_flag.clone();
        let symbol = symbol.to_string();

        let task = tokio::spawn(async move {
            while !task_stop.load(Ordering::Acquire) {
                match run_kline_stream(&url, &symbol, &task_stop, &on_data).await {
                    Ok(()) => {
                        if task_stop.load(Ordering::Acquire) {
                            break;
                        }
                        warn!(symbol = %symbol, "kline stream ended, reconnecting");
                    }
                    Err(err) => {
                        if task_stop.load(Ordering::Acquire) {
                            break;
                        }
                        warn!(symbol = %symbol, error = %err, "kline stream error, reconnecting");
                        on_error(StreamError {
                            code: -1,
                            message: err.to_string(),
                        });
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(SubscriptionHandle::new(stop_flag, Some(task)))
    }
}

/// Run one WebSocket connection until it drops, feeding parsed candles into
/// `on_data`. The caller loops for reconnection.
async fn run_kline_stream(
    url: &str,
    symbol: &str,
    stop: &AtomicBool,
    on_data: &LiveDataCallback,
) -> Result<()> {
    info!(url = %url, symbol = %symbol, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(());
        }
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_event(&text) {
                        Ok(live) => {
                            debug!(
                                open_time = live.candle.open_time,
                                close = live.candle.close,
                                closed = live.is_final,
                                "live candle update"
                            );
                            on_data(live);
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to parse kline message");
                        }
                    }
                }
                // Ping / Pong / Binary / Close frames are ignored --
                // tungstenite answers pongs automatically.
            }
            Some(Err(err)) => return Err(err.into()),
            None => return Ok(()),
        }
    }
}

/// Parse one row of the array-form REST klines payload:
/// `[openTime, "o", "h", "l", "c", "v", closeTime, "qv", trades, ...]`.
fn parse_kline_row(row: &serde_json::Value) -> Result<Candle> {
    let cells = row.as_array().context("kline row is not an array")?;
    if cells.len() < 9 {
        anyhow::bail!("kline row has {} cells, expected at least 9", cells.len());
    }

    Ok(Candle {
        open_time: cells[0].as_i64().context("missing open time")?,
        close_time: cells[6].as_i64().context("missing close time")?,
        open: parse_string_f64(&cells[1], "open")?,
        high: parse_string_f64(&cells[2], "high")?,
        low: parse_string_f64(&cells[3], "low")?,
        close: parse_string_f64(&cells[4], "close")?,
        base_volume: parse_string_f64(&cells[5], "volume")?,
        quote_volume: parse_string_f64(&cells[7], "quote volume")?,
        trades: cells[8].as_u64().unwrap_or(0).min(u32::MAX as u64) as u32,
        is_closed: true,
    })
}

/// Parse a single-stream kline event:
/// `{ "e": "kline", "s": "BTCUSDT", "k": { ... } }` (a combined-stream
/// envelope with an outer `data` field is also accepted).
fn parse_kline_event(text: &str) -> Result<LiveCandle> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = &data["k"];
    let is_final = k["x"].as_bool().context("missing field k.x")?;

    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        base_volume: parse_string_f64(&k["v"], "k.v")?,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        trades: k["n"].as_u64().unwrap_or(0).min(u32::MAX as u64) as u32,
        is_closed: is_final,
    };

    Ok(LiveCandle { candle, is_final })
}

/// Binance sends numeric values as JSON strings inside kline payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_row_ok() {
        let row = serde_json::json!([
            1_700_000_000_000i64,
            "37000.00",
            "37050.00",
            "36990.00",
            "37020.00",
            "123.456",
            1_700_000_059_999i64,
            "4567890.12",
            1500,
            "60.123",
            "2224455.66",
            "0"
        ]);
        let candle = parse_kline_row(&row).expect("should parse");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.close_time, 1_700_000_059_999);
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert_eq!(candle.trades, 1500);
        assert!(candle.is_closed);
    }

    #[test]
    fn parse_kline_row_rejects_short_rows() {
        let row = serde_json::json!([1_700_000_000_000i64, "1.0"]);
        assert!(parse_kline_row(&row).is_err());
    }

    #[test]
    fn parse_kline_event_ok() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "T": 1700000059999,
                "i": "1m",
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "123.456",
                "q": "4567890.12",
                "n": 1500,
                "V": "60.123",
                "Q": "2224455.66",
                "x": false
            }
        }"#;
        let live = parse_kline_event(json).expect("should parse");
        assert!(!live.is_final);
        assert!(!live.candle.is_closed);
        assert_eq!(live.candle.open_time, 1_700_000_000_000);
        assert!((live.candle.close - 37020.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_kline_event_combined_envelope() {
        let json = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline",
                "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000,
                    "T": 1700000059999,
                    "i": "1m",
                    "o": "1.0", "h": "2.0", "l": "0.5", "c": "1.5",
                    "v": "10", "q": "15", "n": 3, "x": true
                }
            }
        }"#;
        let live = parse_kline_event(json).expect("should parse");
        assert!(live.is_final);
        assert!(live.candle.is_closed);
    }
}
