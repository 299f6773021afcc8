// =============================================================================
// Sync Settings — engine configuration with atomic save
// =============================================================================
//
// Every tunable of the sync engine lives here. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Interval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_cache_dir() -> String {
    "./cache".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_publish_candles() -> usize {
    600
}

fn default_backfill_chunk() -> usize {
    1000
}

fn default_backfill_min_sleep_ms() -> u64 {
    250
}

fn default_lookback_max_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_ws_conflation_ms() -> u64 {
    150
}

fn default_min_history_ready() -> usize {
    300
}

fn default_live_publish_throttle_ms() -> u64 {
    75
}

fn default_live_batch_min_ms() -> u64 {
    50
}

fn default_live_batch_max_ms() -> u64 {
    100
}

fn default_live_batch_immediate() -> usize {
    32
}

fn default_targeted_gap_padding() -> usize {
    300
}

fn default_coalesce_min_interval_ms() -> u64 {
    33
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

// =============================================================================
// SyncSettings
// =============================================================================

/// Top-level configuration for the sync engine and its adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    // --- Session ------------------------------------------------------------
    /// Trading pair the engine binds on startup.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Candle interval label ("1m", "5m", "1h", "1d").
    #[serde(default = "default_interval")]
    pub interval: String,

    // --- Storage ------------------------------------------------------------
    /// Directory holding the per-(symbol, interval) candle files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Directory for auxiliary data (config snapshots, exports).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // --- Backfill -----------------------------------------------------------
    /// Snapshot size requested by the publish path.
    #[serde(default = "default_publish_candles")]
    pub publish_candles: usize,

    /// Candles fetched per reverse-backfill window.
    #[serde(default = "default_backfill_chunk")]
    pub backfill_chunk: usize,

    /// Pause between backfill windows.
    #[serde(default = "default_backfill_min_sleep_ms")]
    pub backfill_min_sleep_ms: u64,

    /// Oldest history fetched, relative to now.
    #[serde(default = "default_lookback_max_ms")]
    pub lookback_max_ms: i64,

    // --- Live path ----------------------------------------------------------
    /// Conflation window of the outbound live hub.
    #[serde(default = "default_ws_conflation_ms")]
    pub ws_conflation_ms: u64,

    /// Closed candles required before the series is Ready.
    #[serde(default = "default_min_history_ready")]
    pub min_history_ready: usize,

    /// Floor between publishes driven purely by tail replacement.
    #[serde(default = "default_live_publish_throttle_ms")]
    pub live_publish_throttle_ms: u64,

    /// Lower bound of the live batching window.
    #[serde(default = "default_live_batch_min_ms")]
    pub live_batch_min_ms: u64,

    /// Upper bound of the live batching window.
    #[serde(default = "default_live_batch_max_ms")]
    pub live_batch_max_ms: u64,

    /// Queue depth that drains the live batch immediately.
    #[serde(default = "default_live_batch_immediate")]
    pub live_batch_immediate: usize,

    /// Candles of left padding added to a targeted gap fetch.
    #[serde(default = "default_targeted_gap_padding")]
    pub targeted_gap_padding: usize,

    /// Floor between coalesced snapshot publishes.
    #[serde(default = "default_coalesce_min_interval_ms")]
    pub coalesce_min_interval_ms: u64,

    // --- API ----------------------------------------------------------------
    /// Address the REST/WS façade listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            interval: default_interval(),
            cache_dir: default_cache_dir(),
            data_dir: default_data_dir(),
            publish_candles: default_publish_candles(),
            backfill_chunk: default_backfill_chunk(),
            backfill_min_sleep_ms: default_backfill_min_sleep_ms(),
            lookback_max_ms: default_lookback_max_ms(),
            ws_conflation_ms: default_ws_conflation_ms(),
            min_history_ready: default_min_history_ready(),
            live_publish_throttle_ms: default_live_publish_throttle_ms(),
            live_batch_min_ms: default_live_batch_min_ms(),
            live_batch_max_ms: default_live_batch_max_ms(),
            live_batch_immediate: default_live_batch_immediate(),
            targeted_gap_padding: default_targeted_gap_padding(),
            coalesce_min_interval_ms: default_coalesce_min_interval_ms(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl SyncSettings {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse sync config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            interval = %config.interval,
            "sync config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise sync config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "sync config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides (`CHARTSYNC_SYMBOL`, `CHARTSYNC_INTERVAL`,
    /// `CHARTSYNC_BIND_ADDR`, `CHARTSYNC_CACHE_DIR`).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("CHARTSYNC_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.symbol = symbol;
            }
        }
        if let Ok(interval) = std::env::var("CHARTSYNC_INTERVAL") {
            if Interval::from_label(&interval).valid() {
                self.interval = interval.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("CHARTSYNC_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("CHARTSYNC_CACHE_DIR") {
            if !dir.trim().is_empty() {
                self.cache_dir = dir.trim().to_string();
            }
        }
    }

    /// The configured interval as a parsed [`Interval`].
    pub fn interval_parsed(&self) -> Interval {
        Interval::from_label(&self.interval)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = SyncSettings::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval, "1m");
        assert_eq!(cfg.publish_candles, 600);
        assert_eq!(cfg.backfill_chunk, 1000);
        assert_eq!(cfg.backfill_min_sleep_ms, 250);
        assert_eq!(cfg.lookback_max_ms, 7 * 24 * 60 * 60 * 1000);
        assert_eq!(cfg.ws_conflation_ms, 150);
        assert_eq!(cfg.min_history_ready, 300);
        assert_eq!(cfg.live_publish_throttle_ms, 75);
        assert_eq!(cfg.live_batch_min_ms, 50);
        assert_eq!(cfg.live_batch_max_ms, 100);
        assert_eq!(cfg.live_batch_immediate, 32);
        assert_eq!(cfg.targeted_gap_padding, 300);
        assert_eq!(cfg.coalesce_min_interval_ms, 33);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: SyncSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.cache_dir, "./cache");
        assert_eq!(cfg.min_history_ready, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "interval": "5m" }"#;
        let cfg: SyncSettings = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.interval, "5m");
        assert_eq!(cfg.backfill_chunk, 1000);
        assert_eq!(cfg.interval_parsed().ms, 300_000);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = SyncSettings::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: SyncSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.publish_candles, cfg2.publish_candles);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
    }
}
