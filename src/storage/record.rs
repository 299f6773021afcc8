// =============================================================================
// Fixed-size binary candle record
// =============================================================================
//
// One record per closed candle, little-endian, no header and no checksum.
// Layout (92 bytes):
//
//   offset  size  field
//        0     8  open_time    (i64, aligned to the interval)
//        8     8  close_time   (i64)
//       16     8  open         (f64)
//       24     8  high         (f64)
//       32     8  low          (f64)
//       40     8  close        (f64)
//       48     8  base_volume  (f64)
//       56     8  quote_volume (f64)
//       64     4  trades       (i32)
//       68    16  symbol       (NUL-padded ASCII)
//       84     8  interval     (NUL-padded label, e.g. "1m")
//
// A record is valid iff both timestamps are positive and both text fields are
// non-empty. Recovery truncates the file at the first invalid record.
// =============================================================================

use crate::types::{align_down_ms, Candle, TimestampMs};

pub const RECORD_SIZE: usize = 92;

const SYMBOL_LEN: usize = 16;
const INTERVAL_LEN: usize = 8;

/// In-memory form of one on-disk candle record.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRecord {
    pub open_time: TimestampMs,
    pub close_time: TimestampMs,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub trades: i32,
    pub symbol: String,
    pub interval: String,
}

impl CandleRecord {
    /// Build a record from a candle, aligning the open time down to the
    /// interval and recomputing the close time from it.
    pub fn from_candle(
        candle: &Candle,
        symbol: &str,
        interval_label: &str,
        interval_ms: TimestampMs,
    ) -> Self {
        let aligned_open = align_down_ms(candle.open_time, interval_ms);
        let close_time = if aligned_open > 0 && interval_ms > 0 {
            aligned_open + interval_ms - 1
        } else {
            0
        };
        Self {
            open_time: aligned_open,
            close_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            base_volume: candle.base_volume,
            quote_volume: candle.quote_volume,
            trades: candle.trades.min(i32::MAX as u32) as i32,
            symbol: truncate_field(symbol, SYMBOL_LEN),
            interval: truncate_field(interval_label, INTERVAL_LEN),
        }
    }

    /// Records only ever describe closed candles, so `is_closed` is true.
    pub fn to_candle(&self) -> Candle {
        Candle {
            open_time: self.open_time,
            close_time: self.close_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            base_volume: self.base_volume,
            quote_volume: self.quote_volume,
            trades: self.trades.max(0) as u32,
            is_closed: true,
        }
    }

    /// Positive timestamps and non-empty text fields.
    pub fn is_valid(&self) -> bool {
        self.open_time > 0
            && self.close_time > 0
            && !self.symbol.is_empty()
            && !self.interval.is_empty()
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.open_time.to_le_bytes());
        buf[8..16].copy_from_slice(&self.close_time.to_le_bytes());
        buf[16..24].copy_from_slice(&self.open.to_le_bytes());
        buf[24..32].copy_from_slice(&self.high.to_le_bytes());
        buf[32..40].copy_from_slice(&self.low.to_le_bytes());
        buf[40..48].copy_from_slice(&self.close.to_le_bytes());
        buf[48..56].copy_from_slice(&self.base_volume.to_le_bytes());
        buf[56..64].copy_from_slice(&self.quote_volume.to_le_bytes());
        buf[64..68].copy_from_slice(&self.trades.to_le_bytes());
        write_padded(&mut buf[68..68 + SYMBOL_LEN], &self.symbol);
        write_padded(&mut buf[84..84 + INTERVAL_LEN], &self.interval);
        buf
    }

    /// Decode one record from exactly [`RECORD_SIZE`] bytes. The caller
    /// checks [`is_valid`](Self::is_valid) to decide whether to keep it.
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        Self {
            open_time: i64::from_le_bytes(buf[0..8].try_into().expect("slice length")),
            close_time: i64::from_le_bytes(buf[8..16].try_into().expect("slice length")),
            open: f64::from_le_bytes(buf[16..24].try_into().expect("slice length")),
            high: f64::from_le_bytes(buf[24..32].try_into().expect("slice length")),
            low: f64::from_le_bytes(buf[32..40].try_into().expect("slice length")),
            close: f64::from_le_bytes(buf[40..48].try_into().expect("slice length")),
            base_volume: f64::from_le_bytes(buf[48..56].try_into().expect("slice length")),
            quote_volume: f64::from_le_bytes(buf[56..64].try_into().expect("slice length")),
            trades: i32::from_le_bytes(buf[64..68].try_into().expect("slice length")),
            symbol: read_padded(&buf[68..68 + SYMBOL_LEN]),
            interval: read_padded(&buf[84..84 + INTERVAL_LEN]),
        }
    }
}

fn truncate_field(s: &str, max: usize) -> String {
    // Text fields are short opaque ASCII identifiers; anything longer is
    // clipped to the record slot, minus the trailing NUL.
    s.chars().filter(char::is_ascii).take(max - 1).collect()
}

fn write_padded(slot: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(slot.len() - 1);
    slot[..len].copy_from_slice(&bytes[..len]);
}

fn read_padded(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sample_candle;

    #[test]
    fn encode_decode_round_trip() {
        let candle = sample_candle(1_700_000_000_000 - (1_700_000_000_000 % 60_000), 42.5, true);
        let record = CandleRecord::from_candle(&candle, "BTCUSDT", "1m", 60_000);
        assert!(record.is_valid());

        let decoded = CandleRecord::decode(&record.encode());
        assert_eq!(decoded, record);
        assert_eq!(decoded.symbol, "BTCUSDT");
        assert_eq!(decoded.interval, "1m");

        let back = decoded.to_candle();
        assert!(back.is_closed);
        assert_eq!(back.open_time, record.open_time);
        assert_eq!(back.close_time, record.open_time + 59_999);
        assert!((back.close - 42.5).abs() < f64::EPSILON);
    }

    #[test]
    fn from_candle_aligns_open_time() {
        let mut candle = sample_candle(60_000, 10.0, true);
        candle.open_time = 61_234;
        let record = CandleRecord::from_candle(&candle, "BTCUSDT", "1m", 60_000);
        assert_eq!(record.open_time, 60_000);
        assert_eq!(record.close_time, 119_999);
    }

    #[test]
    fn invalid_when_fields_missing() {
        let candle = sample_candle(60_000, 10.0, true);
        let record = CandleRecord::from_candle(&candle, "", "1m", 60_000);
        assert!(!record.is_valid());

        let mut record = CandleRecord::from_candle(&candle, "BTCUSDT", "1m", 60_000);
        record.open_time = 0;
        assert!(!record.is_valid());
    }

    #[test]
    fn long_symbol_is_clipped_to_slot() {
        let candle = sample_candle(60_000, 10.0, true);
        let record =
            CandleRecord::from_candle(&candle, "AVERYLONGSYMBOLNAME1234", "1m", 60_000);
        let decoded = CandleRecord::decode(&record.encode());
        assert_eq!(decoded.symbol.len(), 15);
        assert!(decoded.is_valid());
    }
}
