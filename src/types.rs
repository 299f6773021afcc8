// =============================================================================
// Shared domain types used across the ChartSync engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Millisecond UNIX epoch timestamp.
pub type TimestampMs = i64;

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60_000;
const MS_PER_HOUR: i64 = 3_600_000;
const MS_PER_DAY: i64 = 86_400_000;

/// Floor `t` to a multiple of `step`. Returns `t` unchanged for a
/// non-positive step.
pub fn align_down_ms(t: TimestampMs, step: TimestampMs) -> TimestampMs {
    if step > 0 {
        (t / step) * step
    } else {
        t
    }
}

/// Ceil `t` to a multiple of `step`. Returns `t` unchanged for a
/// non-positive step.
pub fn align_up_ms(t: TimestampMs, step: TimestampMs) -> TimestampMs {
    if step > 0 {
        ((t + step - 1) / step) * step
    } else {
        t
    }
}

// =============================================================================
// Interval
// =============================================================================

/// The fixed duration of one candle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub ms: TimestampMs,
}

impl Interval {
    pub const fn from_ms(ms: TimestampMs) -> Self {
        Self { ms }
    }

    /// An interval is usable only with a strictly positive step.
    pub const fn valid(&self) -> bool {
        self.ms > 0
    }

    /// Parse a label like `"1m"`, `"5m"`, `"1h"`, `"1d"`, `"30s"`. A bare
    /// number is taken as milliseconds. Returns an invalid interval (ms = 0)
    /// when the label does not start with digits or encodes a non-positive
    /// duration.
    pub fn from_label(label: &str) -> Self {
        let trimmed = label.trim();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let Ok(value) = trimmed[..digits_end].parse::<i64>() else {
            return Self { ms: 0 };
        };
        if value <= 0 {
            return Self { ms: 0 };
        }

        let multiplier = match trimmed[digits_end..].trim().chars().next() {
            Some('s') | Some('S') => MS_PER_SECOND,
            Some('m') | Some('M') => MS_PER_MINUTE,
            Some('h') | Some('H') => MS_PER_HOUR,
            Some('d') | Some('D') => MS_PER_DAY,
            None => 1,
            Some(_) => return Self { ms: 0 },
        };

        Self {
            ms: value * multiplier,
        }
    }

    /// Render the canonical label for this interval (`"1m"`, `"4h"`, ...).
    /// Falls back to a raw millisecond label for off-grid durations.
    pub fn label(&self) -> String {
        if !self.valid() {
            return String::new();
        }
        let ms = self.ms;
        if ms % MS_PER_DAY == 0 {
            format!("{}d", ms / MS_PER_DAY)
        } else if ms % MS_PER_HOUR == 0 {
            format!("{}h", ms / MS_PER_HOUR)
        } else if ms % MS_PER_MINUTE == 0 {
            format!("{}m", ms / MS_PER_MINUTE)
        } else if ms % MS_PER_SECOND == 0 {
            format!("{}s", ms / MS_PER_SECOND)
        } else {
            format!("{ms}ms")
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// =============================================================================
// CandleKey
// =============================================================================

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: Interval,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// =============================================================================
// Candle / CandleSeries / LiveCandle
// =============================================================================

/// A single OHLCV candle. `open_time` is floor-aligned to the interval and
/// `close_time` is `open_time + interval - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: TimestampMs,
    pub close_time: TimestampMs,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub trades: u32,
    pub is_closed: bool,
}

/// An ordered run of candles with the first/last open times cached for cheap
/// range checks by readers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CandleSeries {
    pub interval: Interval,
    pub data: Vec<Candle>,
    pub first_open: TimestampMs,
    pub last_open: TimestampMs,
}

impl CandleSeries {
    /// Build a series from candles already sorted by `open_time`, caching the
    /// boundary open times.
    pub fn from_candles(interval: Interval, data: Vec<Candle>) -> Self {
        let first_open = data.first().map_or(0, |c| c.open_time);
        let last_open = data.last().map_or(0, |c| c.open_time);
        Self {
            interval,
            data,
            first_open,
            last_open,
        }
    }

    pub fn empty(interval: Interval) -> Self {
        Self {
            interval,
            data: Vec::new(),
            first_open: 0,
            last_open: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// A candle as delivered by the live stream. `is_final` is true when the
/// exchange declared the interval closed.
#[derive(Debug, Clone)]
pub struct LiveCandle {
    pub candle: Candle,
    pub is_final: bool,
}

/// Error surfaced by the live stream's error callback.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub code: i32,
    pub message: String,
}

// =============================================================================
// TimeRange
// =============================================================================

/// Inclusive [start, end] window of open times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: TimestampMs,
    pub end: TimestampMs,
}

impl TimeRange {
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

// =============================================================================
// Append outcomes & repository metadata
// =============================================================================

/// Outcome class of an append/replace against the stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeState {
    /// Appended at the expected slot.
    #[default]
    Ok,
    /// The tail was rewritten in place (same open time).
    Replaced,
    /// The candle landed past the expected slot; nothing was stored.
    Gap,
    /// Out-of-order past tick, or an open candle colliding with a closed
    /// tail; ignored.
    Overlap,
}

/// Summary of one `append_or_replace` call or a whole batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendResult {
    pub state: RangeState,
    /// First missing open time, set only on `Gap`.
    pub expected_from: TimestampMs,
    /// Last missing open time (inclusive), set only on `Gap`.
    pub expected_to: TimestampMs,
    pub appended: usize,
    pub touched_disk: bool,
    /// At least one stored candle is memory-only (open tail).
    pub live_only: bool,
}

/// Observer view over the closed candles of a bound repository.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RepoMetadata {
    pub min_open: TimestampMs,
    pub max_open: TimestampMs,
    pub count: usize,
    pub has_gap: bool,
}

// =============================================================================
// UiDataState
// =============================================================================

/// Coarse readiness state published alongside every series snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiDataState {
    Loading,
    LiveOnly,
    Ready,
}

impl Default for UiDataState {
    fn default() -> Self {
        Self::Loading
    }
}

impl std::fmt::Display for UiDataState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "Loading"),
            Self::LiveOnly => write!(f, "LiveOnly"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) fn sample_candle(open_time: TimestampMs, close: f64, is_closed: bool) -> Candle {
    Candle {
        open_time,
        close_time: open_time + 59_999,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        base_volume: 100.0,
        quote_volume: 200.0,
        trades: 50,
        is_closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_label_round_trip() {
        for label in ["30s", "1m", "5m", "15m", "1h", "4h", "1d"] {
            let interval = Interval::from_label(label);
            assert!(interval.valid(), "label {label} should parse");
            assert_eq!(interval.label(), label);
        }
    }

    #[test]
    fn interval_bare_number_is_millis() {
        assert_eq!(Interval::from_label("500").ms, 500);
    }

    #[test]
    fn interval_rejects_garbage() {
        assert!(!Interval::from_label("").valid());
        assert!(!Interval::from_label("m1").valid());
        assert!(!Interval::from_label("0m").valid());
        assert!(!Interval::from_label("5x").valid());
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down_ms(125, 60), 120);
        assert_eq!(align_down_ms(120, 60), 120);
        assert_eq!(align_up_ms(121, 60), 180);
        assert_eq!(align_up_ms(120, 60), 120);
        // Non-positive step passes through.
        assert_eq!(align_down_ms(125, 0), 125);
    }

    #[test]
    fn candle_key_display() {
        let key = CandleKey {
            symbol: "BTCUSDT".into(),
            interval: Interval::from_label("1m"),
        };
        assert_eq!(key.to_string(), "BTCUSDT@1m");
    }

    #[test]
    fn series_caches_boundary_opens() {
        let interval = Interval::from_label("1m");
        let candles = vec![
            sample_candle(0, 100.0, true),
            sample_candle(60_000, 101.0, true),
            sample_candle(120_000, 102.0, false),
        ];
        let series = CandleSeries::from_candles(interval, candles);
        assert_eq!(series.first_open, 0);
        assert_eq!(series.last_open, 120_000);
        assert_eq!(series.len(), 3);

        let empty = CandleSeries::empty(interval);
        assert!(empty.is_empty());
        assert_eq!(empty.first_open, 0);
        assert_eq!(empty.last_open, 0);
    }
}
