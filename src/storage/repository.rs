// =============================================================================
// Time-Series Repository — ordered, gap-aware candle store for one bound key
// =============================================================================
//
// Holds the in-memory candle vector (closed history plus at most one open
// tail) and mirrors every closed candle into an append-only file. Appends
// follow strict interval spacing: a candle past the expected slot is rejected
// with Gap bounds so the orchestrator can schedule a targeted repair, and an
// out-of-order past tick is ignored as Overlap. Closed history is never
// mutated once persisted; the only rewrite is the open tail closing in place.
//
// Durable writes are buffered and flushed when forced, or when the dirty
// window exceeds a time/size threshold. A failed flush keeps the buffer for
// the next attempt; in-memory state is never rolled back.
// =============================================================================

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::file::CandleFile;
use super::record::CandleRecord;
use crate::error::{SyncError, SyncResult};
use crate::types::{
    align_down_ms, AppendResult, Candle, CandleSeries, Interval, RangeState, RepoMetadata,
    TimeRange, TimestampMs,
};

/// Flush when pending writes have been sitting this long.
const DIRTY_WINDOW: Duration = Duration::from_millis(500);
/// Flush when this many records are pending regardless of age.
const DIRTY_MAX_PENDING: usize = 256;

/// Storage locations for bound repositories.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    pub cache_dir: PathBuf,
}

pub struct TimeSeriesRepository {
    inner: Mutex<RepoInner>,
}

#[derive(Default)]
struct RepoInner {
    bound: bool,
    symbol: String,
    interval: Interval,
    interval_label: String,
    file: Option<CandleFile>,

    candles: Vec<Candle>,
    meta: RepoMetadata,
    has_gap: bool,

    pending: Vec<CandleRecord>,
    dirty_since: Option<Instant>,
}

impl Default for TimeSeriesRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesRepository {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RepoInner::default()),
        }
    }

    /// Bind the repository to a (symbol, interval) key and its backing file.
    ///
    /// Creates the cache directory and file if missing, then loads, sorts,
    /// deduplicates (last wins at equal open time) and validates existing
    /// records. Any non-interval spacing between consecutive loaded candles
    /// marks the series as gapped.
    pub fn bind(&self, symbol: &str, interval: Interval, paths: &Paths) -> SyncResult<()> {
        let interval = if interval.valid() {
            interval
        } else {
            Interval::from_label("1m")
        };
        let label = interval.label();
        let path = paths.cache_dir.join(format!("{symbol}_{label}.bin"));

        let file = CandleFile::open(&path).map_err(|source| SyncError::BindFailed {
            path: path.clone(),
            source,
        })?;

        let mut records = match file.read_all() {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read candle file, starting empty");
                Vec::new()
            }
        };

        records.retain(|r| r.is_valid());
        records.sort_by_key(|r| r.open_time);

        let mut candles: Vec<Candle> = Vec::with_capacity(records.len());
        for record in records {
            let mut candle = record.to_candle();
            candle.open_time = align_down_ms(candle.open_time, interval.ms);
            candle.close_time = candle.open_time + interval.ms - 1;
            candle.is_closed = true;
            match candles.last_mut() {
                // Last wins at equal open time.
                Some(last) if last.open_time == candle.open_time => *last = candle,
                _ => candles.push(candle),
            }
        }

        let has_gap = candles
            .windows(2)
            .any(|pair| pair[1].open_time - pair[0].open_time != interval.ms);

        let mut inner = self.inner.lock();
        inner.bound = true;
        inner.symbol = symbol.to_string();
        inner.interval = interval;
        inner.interval_label = label;
        inner.file = Some(file);
        inner.candles = candles;
        inner.has_gap = has_gap;
        inner.pending.clear();
        inner.dirty_since = None;
        inner.rebuild_metadata();

        info!(
            symbol = %inner.symbol,
            interval = %inner.interval,
            loaded = inner.candles.len(),
            has_gap = inner.has_gap,
            "repository bound"
        );
        Ok(())
    }

    /// Append one candle, replacing the open tail when the open times match.
    pub fn append_or_replace(&self, candle: &Candle) -> AppendResult {
        let mut inner = self.inner.lock();
        let result = inner.append_or_replace_locked(candle);
        inner.flush_if_needed_locked(false);
        result
    }

    /// Append a batch: pre-sorts by open time, applies the single-candle
    /// algorithm, and short-circuits at the first gap (its bounds are
    /// returned). Overlap and Replaced outcomes are absorbed into the
    /// summary.
    pub fn append_batch(&self, batch: &[Candle]) -> AppendResult {
        let mut summary = AppendResult::default();
        if batch.is_empty() {
            return summary;
        }

        let mut ordered: Vec<Candle> = batch.to_vec();
        ordered.sort_by_key(|c| c.open_time);

        let mut inner = self.inner.lock();
        for candle in &ordered {
            let result = inner.append_or_replace_locked(candle);
            summary.appended += result.appended;
            summary.touched_disk = summary.touched_disk || result.touched_disk;
            summary.live_only = summary.live_only || result.live_only;

            match result.state {
                RangeState::Gap => {
                    summary.state = RangeState::Gap;
                    summary.expected_from = result.expected_from;
                    summary.expected_to = result.expected_to;
                    break;
                }
                RangeState::Overlap => {
                    summary.state = RangeState::Overlap;
                }
                RangeState::Replaced if summary.state == RangeState::Ok => {
                    summary.state = RangeState::Replaced;
                }
                _ => {}
            }
        }

        inner.flush_if_needed_locked(false);
        summary
    }

    /// Most recent up-to-`count` candles, closed history plus the open tail.
    pub fn get_latest(&self, count: usize) -> SyncResult<CandleSeries> {
        let inner = self.inner.lock();
        if !inner.bound {
            return Err(SyncError::NotBound);
        }

        let start = inner.candles.len().saturating_sub(count);
        Ok(CandleSeries::from_candles(
            inner.interval,
            inner.candles[start..].to_vec(),
        ))
    }

    /// Candles with open time inside the inclusive range. Empty when the
    /// range does not intersect stored data.
    pub fn get_range(&self, range: TimeRange) -> SyncResult<CandleSeries> {
        let inner = self.inner.lock();
        if !inner.bound {
            return Err(SyncError::NotBound);
        }
        if range.end < range.start {
            return Ok(CandleSeries::empty(inner.interval));
        }

        let data: Vec<Candle> = inner
            .candles
            .iter()
            .skip_while(|c| c.open_time < range.start)
            .take_while(|c| c.open_time <= range.end)
            .cloned()
            .collect();
        Ok(CandleSeries::from_candles(inner.interval, data))
    }

    /// Flush pending durable writes when forced or past the dirty window.
    pub fn flush_if_needed(&self, force: bool) {
        self.inner.lock().flush_if_needed_locked(force);
    }

    pub fn metadata(&self) -> RepoMetadata {
        self.inner.lock().meta
    }

    pub fn has_gap(&self) -> bool {
        self.inner.lock().has_gap
    }

    pub fn interval_ms(&self) -> TimestampMs {
        self.inner.lock().interval.ms
    }

    pub fn candle_count(&self) -> usize {
        self.inner.lock().candles.len()
    }

    /// Open time of the newest closed candle, or the metadata maximum when
    /// nothing closed is in memory.
    pub fn last_closed_open_time(&self) -> TimestampMs {
        let inner = self.inner.lock();
        inner
            .candles
            .iter()
            .rev()
            .find(|c| c.is_closed)
            .map(|c| c.open_time)
            .unwrap_or(inner.meta.max_open)
    }
}

impl RepoInner {
    fn append_or_replace_locked(&mut self, candle: &Candle) -> AppendResult {
        let mut result = AppendResult::default();
        let step = self.interval.ms;
        if step <= 0 {
            return result;
        }

        let mut normalized = candle.clone();
        normalized.open_time = align_down_ms(candle.open_time, step);
        normalized.close_time = normalized.open_time + step - 1;
        if normalized.open_time <= 0 {
            return result;
        }

        let Some(last) = self.candles.last() else {
            let closed = normalized.is_closed;
            self.push_candle(normalized);
            if closed {
                result.touched_disk = true;
            } else {
                result.live_only = true;
            }
            result.appended = 1;
            self.has_gap = false;
            self.meta.has_gap = false;
            return result;
        };

        let last_open = last.open_time;
        let last_closed = last.is_closed;
        let expected = last_open + step;

        if normalized.open_time == last_open {
            // Closed data is authoritative; a late partial never downgrades it.
            if last_closed && !normalized.is_closed {
                result.state = RangeState::Overlap;
                return result;
            }

            let closed = normalized.is_closed;
            self.replace_tail(normalized);
            result.state = RangeState::Replaced;
            if closed {
                result.touched_disk = true;
            } else {
                result.live_only = true;
            }
            self.has_gap = false;
            self.meta.has_gap = false;
            return result;
        }

        if normalized.open_time < expected {
            result.state = RangeState::Overlap;
            return result;
        }

        if normalized.open_time > expected {
            self.has_gap = true;
            self.meta.has_gap = true;
            result.state = RangeState::Gap;
            result.expected_from = expected;
            result.expected_to = normalized.open_time - step;
            return result;
        }

        // Expected slot. An open tail is force-closed before the new candle
        // lands behind it.
        if !last_closed {
            let tail = self.candles.last_mut().expect("tail checked above");
            tail.is_closed = true;
            self.persist_tail_close();
            result.touched_disk = true;
        }

        let closed = normalized.is_closed;
        self.push_candle(normalized);
        result.appended = 1;
        if closed {
            result.touched_disk = true;
        } else {
            result.live_only = true;
        }
        self.has_gap = false;
        self.meta.has_gap = false;
        result
    }

    /// Append a candle at the tail and queue it for persistence when closed.
    fn push_candle(&mut self, candle: Candle) {
        if candle.is_closed {
            self.queue_persist(&candle);
            if self.meta.count == 0 {
                self.meta.min_open = candle.open_time;
            }
            self.meta.max_open = candle.open_time;
            self.meta.count += 1;
        }
        self.candles.push(candle);
    }

    /// Replace the tail in place. A closed replacement is re-queued, which
    /// the candle file turns into an in-place rewrite of the last record.
    fn replace_tail(&mut self, candle: Candle) {
        let was_closed = self.candles.last().map_or(false, |c| c.is_closed);
        if candle.is_closed {
            self.queue_persist(&candle);
            if !was_closed {
                if self.meta.count == 0 {
                    self.meta.min_open = candle.open_time;
                }
                self.meta.max_open = candle.open_time;
                self.meta.count += 1;
            }
        }
        *self.candles.last_mut().expect("tail exists") = candle;
    }

    /// Queue the just-closed tail for persistence.
    fn persist_tail_close(&mut self) {
        let tail = self.candles.last().expect("tail exists").clone();
        self.queue_persist(&tail);
        if self.meta.count == 0 {
            self.meta.min_open = tail.open_time;
        }
        self.meta.max_open = tail.open_time;
        self.meta.count += 1;
    }

    fn queue_persist(&mut self, candle: &Candle) {
        let record = CandleRecord::from_candle(
            candle,
            &self.symbol,
            &self.interval_label,
            self.interval.ms,
        );
        if !record.is_valid() {
            return;
        }
        self.pending.push(record);
        if self.dirty_since.is_none() {
            self.dirty_since = Some(Instant::now());
        }
    }

    fn flush_if_needed_locked(&mut self, force: bool) {
        if self.pending.is_empty() {
            self.dirty_since = None;
            return;
        }

        let due = force
            || self.pending.len() >= DIRTY_MAX_PENDING
            || self
                .dirty_since
                .map_or(false, |since| since.elapsed() >= DIRTY_WINDOW);
        if !due {
            return;
        }

        let Some(file) = &self.file else {
            self.pending.clear();
            self.dirty_since = None;
            return;
        };

        match file.write_batch(&self.pending) {
            Ok(()) => {
                self.pending.clear();
                self.dirty_since = None;
            }
            Err(err) => {
                // Keep the buffer; the next flush retries. Memory state is
                // already ahead of disk by design.
                warn!(
                    path = %file.path().display(),
                    pending = self.pending.len(),
                    error = %err,
                    "candle flush failed, will retry"
                );
            }
        }
    }

    fn rebuild_metadata(&mut self) {
        let mut meta = RepoMetadata {
            has_gap: self.has_gap,
            ..Default::default()
        };
        for candle in self.candles.iter().filter(|c| c.is_closed) {
            if meta.count == 0 {
                meta.min_open = candle.open_time;
            }
            meta.max_open = candle.open_time;
            meta.count += 1;
        }
        self.meta = meta;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sample_candle;

    const STEP: TimestampMs = 60_000;

    fn bound_repo(dir: &std::path::Path) -> TimeSeriesRepository {
        let repo = TimeSeriesRepository::new();
        repo.bind(
            "BTCUSDT",
            Interval::from_ms(STEP),
            &Paths {
                cache_dir: dir.to_path_buf(),
            },
        )
        .unwrap();
        repo
    }

    #[test]
    fn appends_stay_aligned_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        for i in 1..=5 {
            let mut candle = sample_candle(i * STEP, 100.0 + i as f64, true);
            candle.open_time += 123; // misaligned input is floored
            let result = repo.append_or_replace(&candle);
            assert_eq!(result.state, RangeState::Ok);
            assert_eq!(result.appended, 1);
        }

        let series = repo.get_latest(100).unwrap();
        assert_eq!(series.len(), 5);
        for pair in series.data.windows(2) {
            assert_eq!(pair[1].open_time - pair[0].open_time, STEP);
            assert_eq!(pair[0].open_time % STEP, 0);
        }
    }

    #[test]
    fn open_tail_is_single_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        repo.append_or_replace(&sample_candle(STEP, 1.0, true));
        repo.append_or_replace(&sample_candle(2 * STEP, 2.0, false));

        let series = repo.get_latest(100).unwrap();
        let open_count = series.data.iter().filter(|c| !c.is_closed).count();
        assert_eq!(open_count, 1);
        assert!(!series.data.last().unwrap().is_closed);

        // Appending the next slot force-closes the previous tail.
        repo.append_or_replace(&sample_candle(3 * STEP, 3.0, false));
        let series = repo.get_latest(100).unwrap();
        assert_eq!(series.data.iter().filter(|c| !c.is_closed).count(), 1);
        assert!(series.data[1].is_closed);
        assert_eq!(repo.metadata().count, 2);
    }

    #[test]
    fn closed_tail_ignores_late_partial() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        repo.append_or_replace(&sample_candle(STEP, 1.0, true));
        let result = repo.append_or_replace(&sample_candle(STEP, 9.0, false));
        assert_eq!(result.state, RangeState::Overlap);

        let series = repo.get_latest(1).unwrap();
        assert!((series.data[0].close - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn closed_duplicate_replaces_tail() {
        // Pinned policy: a strict duplicate of the closed tail is Replaced.
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        repo.append_or_replace(&sample_candle(STEP, 1.0, true));
        let result = repo.append_or_replace(&sample_candle(STEP, 2.0, true));
        assert_eq!(result.state, RangeState::Replaced);
        assert_eq!(result.appended, 0);
        assert_eq!(repo.metadata().count, 1);

        let series = repo.get_latest(1).unwrap();
        assert!((series.data[0].close - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn past_tick_is_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        repo.append_or_replace(&sample_candle(STEP, 1.0, true));
        repo.append_or_replace(&sample_candle(2 * STEP, 2.0, true));
        repo.append_or_replace(&sample_candle(3 * STEP, 3.0, true));

        let result = repo.append_or_replace(&sample_candle(STEP, 9.0, true));
        assert_eq!(result.state, RangeState::Overlap);
        assert_eq!(repo.candle_count(), 3);
    }

    #[test]
    fn gap_reports_missing_bounds_and_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        repo.append_or_replace(&sample_candle(STEP, 1.0, true));
        let result = repo.append_or_replace(&sample_candle(4 * STEP, 4.0, true));
        assert_eq!(result.state, RangeState::Gap);
        assert_eq!(result.expected_from, 2 * STEP);
        assert_eq!(result.expected_to, 3 * STEP);
        assert!(repo.has_gap());
        assert_eq!(repo.candle_count(), 1);

        // Repair: the expected slots append cleanly and the gap clears.
        repo.append_or_replace(&sample_candle(2 * STEP, 2.0, true));
        repo.append_or_replace(&sample_candle(3 * STEP, 3.0, true));
        assert!(!repo.has_gap());
        repo.append_or_replace(&sample_candle(4 * STEP, 4.0, true));
        assert_eq!(repo.metadata().count, 4);
    }

    #[test]
    fn batch_short_circuits_on_gap() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        let batch = vec![
            sample_candle(2 * STEP, 2.0, true),
            sample_candle(STEP, 1.0, true),
            sample_candle(5 * STEP, 5.0, true), // gap after 2*STEP
            sample_candle(6 * STEP, 6.0, true),
        ];
        let summary = repo.append_batch(&batch);
        assert_eq!(summary.state, RangeState::Gap);
        assert_eq!(summary.appended, 2); // sorted: STEP, 2*STEP landed
        assert_eq!(summary.expected_from, 3 * STEP);
        assert_eq!(summary.expected_to, 4 * STEP);
        assert_eq!(repo.metadata().count, 2);
    }

    #[test]
    fn batch_absorbs_overlap_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());
        repo.append_batch(&[
            sample_candle(STEP, 1.0, true),
            sample_candle(2 * STEP, 2.0, true),
        ]);

        let summary = repo.append_batch(&[
            sample_candle(STEP, 9.0, true),     // overlap (older than tail)
            sample_candle(2 * STEP, 8.0, true), // replaces tail
            sample_candle(3 * STEP, 3.0, true), // appends
        ]);
        assert_ne!(summary.state, RangeState::Gap);
        assert_eq!(summary.appended, 1);
        assert_eq!(repo.metadata().count, 3);
    }

    #[test]
    fn metadata_counts_closed_candles_only() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());

        repo.append_or_replace(&sample_candle(STEP, 1.0, true));
        repo.append_or_replace(&sample_candle(2 * STEP, 2.0, true));
        repo.append_or_replace(&sample_candle(3 * STEP, 3.0, false));

        let meta = repo.metadata();
        assert_eq!(meta.count, 2);
        assert_eq!(meta.min_open, STEP);
        assert_eq!(meta.max_open, 2 * STEP);
        assert_eq!(repo.last_closed_open_time(), 2 * STEP);
    }

    #[test]
    fn get_range_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let repo = bound_repo(dir.path());
        for i in 1..=5 {
            repo.append_or_replace(&sample_candle(i * STEP, i as f64, true));
        }

        let series = repo.get_range(TimeRange {
            start: 2 * STEP,
            end: 4 * STEP,
        });
        let series = series.unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.first_open, 2 * STEP);
        assert_eq!(series.last_open, 4 * STEP);

        let outside = repo
            .get_range(TimeRange {
                start: 10 * STEP,
                end: 20 * STEP,
            })
            .unwrap();
        assert!(outside.is_empty());
    }

    #[test]
    fn durability_round_trip_loses_open_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = bound_repo(dir.path());
            for i in 1..=500 {
                repo.append_or_replace(&sample_candle(i * STEP, i as f64, true));
            }
            // Memory-only open tail.
            repo.append_or_replace(&sample_candle(501 * STEP, 501.0, false));
            repo.flush_if_needed(true);
        }

        // Rebind simulates a restart after an abrupt exit.
        let repo = bound_repo(dir.path());
        let meta = repo.metadata();
        assert_eq!(meta.count, 500);
        assert!(!meta.has_gap);
        assert_eq!(repo.last_closed_open_time(), 500 * STEP);
        assert_eq!(repo.candle_count(), 500);
    }

    #[test]
    fn tail_close_persists_single_record() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = bound_repo(dir.path());
            repo.append_or_replace(&sample_candle(STEP, 1.0, true));
            // Partial then final for the same slot: one record on disk.
            repo.append_or_replace(&sample_candle(2 * STEP, 100.0, false));
            repo.append_or_replace(&sample_candle(2 * STEP, 101.0, true));
            repo.flush_if_needed(true);
        }

        let repo = bound_repo(dir.path());
        let series = repo.get_latest(10).unwrap();
        assert_eq!(series.len(), 2);
        assert!((series.data[1].close - 101.0).abs() < f64::EPSILON);
        assert_eq!(repo.metadata().count, 2);
    }

    #[test]
    fn bind_detects_gap_in_persisted_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = bound_repo(dir.path());
            repo.append_batch(&[
                sample_candle(STEP, 1.0, true),
                sample_candle(2 * STEP, 2.0, true),
            ]);
            repo.flush_if_needed(true);
        }
        {
            // A second writer continues further ahead, leaving a hole.
            let file =
                super::super::file::CandleFile::open(dir.path().join("BTCUSDT_1m.bin")).unwrap();
            file.write_batch(&[CandleRecord::from_candle(
                &sample_candle(5 * STEP, 5.0, true),
                "BTCUSDT",
                "1m",
                STEP,
            )])
            .unwrap();
        }

        let repo = bound_repo(dir.path());
        assert!(repo.has_gap());
        assert!(repo.metadata().has_gap);
        assert_eq!(repo.metadata().count, 3);
    }

    #[test]
    fn unbound_queries_fail() {
        let repo = TimeSeriesRepository::new();
        assert!(repo.get_latest(10).is_err());
        assert!(repo
            .get_range(TimeRange {
                start: 0,
                end: STEP
            })
            .is_err());
    }
}
