// =============================================================================
// Series Cache — lock-free publication slot for the latest snapshot
// =============================================================================
//
// Writers atomically swap in a new immutable series; readers take a shared
// handle with a single atomic load and never observe a partially built
// snapshot. The slot is never null: cold start holds an empty series.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::types::CandleSeries;

pub struct SeriesCache {
    slot: ArcSwap<CandleSeries>,
    version: AtomicU64,
}

impl Default for SeriesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesCache {
    pub fn new() -> Self {
        Self {
            slot: ArcSwap::from_pointee(CandleSeries::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Replace the published snapshot and bump the version.
    pub fn update(&self, series: Arc<CandleSeries>) {
        self.slot.store(series);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Shared handle to the current snapshot; always non-empty as a pointer.
    pub fn snapshot(&self) -> Arc<CandleSeries> {
        self.slot.load_full()
    }

    /// Monotonically increasing update counter. Readers poll this to detect
    /// change without holding a snapshot.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{sample_candle, Interval};

    #[test]
    fn cold_start_is_empty_series() {
        let cache = SeriesCache::new();
        let snap = cache.snapshot();
        assert!(snap.is_empty());
        assert_eq!(cache.version(), 0);
    }

    #[test]
    fn update_bumps_version_and_replaces_slot() {
        let cache = SeriesCache::new();
        let interval = Interval::from_label("1m");
        let series = CandleSeries::from_candles(
            interval,
            vec![sample_candle(60_000, 1.0, true), sample_candle(120_000, 2.0, true)],
        );

        cache.update(Arc::new(series));
        assert_eq!(cache.version(), 1);

        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.first_open, 60_000);
        assert_eq!(snap.last_open, 120_000);
    }

    #[test]
    fn concurrent_readers_see_consistent_snapshots() {
        let cache = Arc::new(SeriesCache::new());
        let interval = Interval::from_label("1m");

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 1..=1_000i64 {
                    let data: Vec<_> =
                        (1..=i.min(16)).map(|j| sample_candle(j * 60_000, j as f64, true)).collect();
                    cache.update(Arc::new(CandleSeries::from_candles(interval, data)));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = cache.snapshot();
                        // Boundary caches always agree with the data.
                        assert_eq!(snap.first_open, snap.data.first().map_or(0, |c| c.open_time));
                        assert_eq!(snap.last_open, snap.data.last().map_or(0, |c| c.open_time));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cache.version(), 1_000);
    }
}
