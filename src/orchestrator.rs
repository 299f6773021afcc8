// =============================================================================
// Sync Orchestrator — session lifecycle for one (symbol, interval) stream
// =============================================================================
//
// Drives a session end-to-end: binds the repository, seeds history with a
// reverse backfill, merges the live stream in small batches, schedules
// targeted repairs when the live path lands past the expected slot, and
// publishes coalesced immutable snapshots through the cache and the bus.
//
// Task model per active session:
//   - live stream callback: enqueue-only, never blocks
//   - live-batch task: drains the queue on a 50-100 ms window
//   - reverse-backfill task: long-running, checks the stop flag per chunk
//   - zero or one targeted-backfill task (joined before restart)
//   - coalescer task: flushes the pending-snapshot flag at most every 33 ms
//   - hub timer task: the conflation hub's periodic sweep
//
// Shutdown joins the live subscription, backfill, targeted repair, live
// batch, coalescer and hub timer in that order, then force-flushes the
// repository.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conflation::{CandlePayload, ConflationHub};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::event_bus::{EventBus, SeriesUpdated};
use crate::market_source::{LiveDataCallback, MarketSource, StreamErrorCallback};
use crate::series_cache::SeriesCache;
use crate::storage::{Paths, TimeSeriesRepository};
use crate::types::{
    align_down_ms, align_up_ms, Candle, CandleSeries, Interval, LiveCandle, RangeState, TimeRange,
    TimestampMs, UiDataState,
};

/// Flush cadence inside the backfill loop.
const BACKFILL_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Pause when a backfill chunk came back full (rate-limit friendliness).
const BACKFILL_SATURATED_SLEEP: Duration = Duration::from_millis(10);
/// Consecutive fetch failures before the backfill bails.
const BACKFILL_MAX_RETRIES: usize = 5;
/// Pause after a targeted repair completes.
const TARGETED_BACKFILL_MIN_SLEEP: Duration = Duration::from_millis(10);
/// Candles hashed for the cheap tail-change check.
const TAIL_HASH_CANDLES: usize = 8;
/// Live queue bound; oldest entries are dropped past this.
const LIVE_QUEUE_MAX: usize = 4096;

// =============================================================================
// Session & config
// =============================================================================

/// The key a session is bound to.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub symbol: String,
    pub interval: Interval,
}

/// Orchestrator tunables; see the configuration surface for defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub publish_candles: usize,
    pub backfill_chunk: usize,
    pub backfill_min_sleep: Duration,
    pub lookback_max_ms: i64,
    pub min_history_ready: usize,
    pub live_publish_throttle: Duration,
    pub live_batch_min: Duration,
    pub live_batch_max: Duration,
    pub live_batch_immediate: usize,
    pub targeted_gap_padding: usize,
    pub coalesce_min_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            publish_candles: 600,
            backfill_chunk: 1000,
            backfill_min_sleep: Duration::from_millis(250),
            lookback_max_ms: 7 * 24 * 60 * 60 * 1000,
            min_history_ready: 300,
            live_publish_throttle: Duration::from_millis(75),
            live_batch_min: Duration::from_millis(50),
            live_batch_max: Duration::from_millis(100),
            live_batch_immediate: 32,
            targeted_gap_padding: 300,
            coalesce_min_interval: Duration::from_millis(33),
        }
    }
}

impl SyncConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            publish_candles: settings.publish_candles,
            backfill_chunk: settings.backfill_chunk.max(1),
            backfill_min_sleep: Duration::from_millis(settings.backfill_min_sleep_ms),
            lookback_max_ms: settings.lookback_max_ms.max(0),
            min_history_ready: settings.min_history_ready,
            live_publish_throttle: Duration::from_millis(settings.live_publish_throttle_ms),
            live_batch_min: Duration::from_millis(settings.live_batch_min_ms),
            live_batch_max: Duration::from_millis(settings.live_batch_max_ms),
            live_batch_immediate: settings.live_batch_immediate.max(1),
            targeted_gap_padding: settings.targeted_gap_padding,
            coalesce_min_interval: Duration::from_millis(settings.coalesce_min_interval_ms),
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Default)]
struct SessionSlot {
    session_id: u64,
    active: Option<SessionState>,
    live_sub: Option<crate::market_source::SubscriptionHandle>,
}

#[derive(Default)]
struct LiveQueue {
    queue: VecDeque<LiveCandle>,
    first_enqueue: Option<Instant>,
}

#[derive(Default)]
struct Workers {
    backfill: Option<JoinHandle<()>>,
    targeted: Option<JoinHandle<()>>,
    live_batch: Option<JoinHandle<()>>,
    coalescer: Option<JoinHandle<()>>,
}

struct PublishState {
    publish_count: usize,
    last_stable_count: usize,
    last_published_version: u64,
    last_published_count: usize,
    last_published_state: UiDataState,
    last_published_symbol: String,
    last_published_interval: String,
    last_published_tail: Vec<Candle>,
    last_published_series: Option<Arc<CandleSeries>>,
    last_published_live_gap: bool,
    last_publish_time: Option<Instant>,
    last_live_publish: Option<Instant>,
}

impl PublishState {
    fn new(publish_count: usize) -> Self {
        Self {
            publish_count,
            last_stable_count: 0,
            last_published_version: 0,
            last_published_count: 0,
            last_published_state: UiDataState::Loading,
            last_published_symbol: String::new(),
            last_published_interval: String::new(),
            last_published_tail: Vec::new(),
            last_published_series: None,
            last_published_live_gap: false,
            last_publish_time: None,
            last_live_publish: None,
        }
    }

    /// Anything material changed since the last publish?
    fn should_publish(
        &self,
        state: UiDataState,
        symbol: &str,
        interval: &str,
        count: usize,
        tail: &[Candle],
    ) -> bool {
        if self.last_published_version == 0 {
            return true;
        }
        if state != self.last_published_state {
            return true;
        }
        if symbol != self.last_published_symbol || interval != self.last_published_interval {
            return true;
        }
        if count != self.last_published_count {
            return true;
        }
        if tail.len() != self.last_published_tail.len() {
            return true;
        }
        tail.iter().zip(&self.last_published_tail).any(|(curr, prev)| {
            curr.open_time != prev.open_time
                || curr.close_time != prev.close_time
                || curr.open != prev.open
                || curr.high != prev.high
                || curr.low != prev.low
                || curr.close != prev.close
                || curr.is_closed != prev.is_closed
        })
    }
}

// =============================================================================
// SyncOrchestrator
// =============================================================================

pub struct SyncOrchestrator {
    source: Arc<dyn MarketSource>,
    repo: Arc<TimeSeriesRepository>,
    paths: Paths,
    cache: Arc<SeriesCache>,
    bus: Arc<EventBus>,
    hub: Arc<ConflationHub>,
    cfg: SyncConfig,
    publish_count_base: usize,

    session: Mutex<SessionSlot>,
    running: AtomicBool,
    backfilling: AtomicBool,
    live_gap_pending: AtomicBool,
    gap_in_flight: AtomicBool,
    snapshot_version: AtomicU64,

    pending_snapshot: AtomicBool,
    snapshot_signal: Notify,
    stop_coalesce: AtomicBool,

    live_queue: Mutex<LiveQueue>,
    live_notify: Notify,
    stop_live_batch: AtomicBool,

    publish: Mutex<PublishState>,
    workers: Mutex<Workers>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn MarketSource>,
        repo: Arc<TimeSeriesRepository>,
        paths: Paths,
        cache: Arc<SeriesCache>,
        bus: Arc<EventBus>,
        hub: Arc<ConflationHub>,
        cfg: SyncConfig,
    ) -> Arc<Self> {
        let publish_count_base = cfg.publish_candles.max(cfg.min_history_ready);
        info!(publish_candles = publish_count_base, "orchestrator ready");

        Arc::new(Self {
            source,
            repo,
            paths,
            cache,
            bus,
            hub,
            publish_count_base,
            cfg,
            session: Mutex::new(SessionSlot::default()),
            running: AtomicBool::new(false),
            backfilling: AtomicBool::new(false),
            live_gap_pending: AtomicBool::new(false),
            gap_in_flight: AtomicBool::new(false),
            snapshot_version: AtomicU64::new(0),
            pending_snapshot: AtomicBool::new(false),
            snapshot_signal: Notify::new(),
            stop_coalesce: AtomicBool::new(false),
            live_queue: Mutex::new(LiveQueue::default()),
            live_notify: Notify::new(),
            stop_live_batch: AtomicBool::new(false),
            publish: Mutex::new(PublishState::new(publish_count_base)),
            workers: Mutex::new(Workers::default()),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start a session. Only `InvalidSession` and `BindFailed` surface;
    /// everything downstream recovers locally.
    pub async fn start(self: &Arc<Self>, s: SessionState) -> SyncResult<()> {
        if s.symbol.is_empty() || !s.interval.valid() {
            warn!(
                symbol = %s.symbol,
                interval_ms = s.interval.ms,
                "session start ignored: invalid key"
            );
            return Err(SyncError::InvalidSession {
                symbol: s.symbol,
                interval_ms: s.interval.ms,
            });
        }

        let sid = {
            let mut slot = self.session.lock();
            slot.session_id += 1;
            self.running.store(true, Ordering::Release);
            slot.active = Some(s.clone());
            slot.session_id
        };

        *self.publish.lock() = PublishState::new(self.publish_count_base);
        self.snapshot_version.store(0, Ordering::Relaxed);
        self.live_gap_pending.store(false, Ordering::Release);
        self.gap_in_flight.store(false, Ordering::Release);
        self.pending_snapshot.store(false, Ordering::Release);

        if let Err(err) = self.repo.bind(&s.symbol, s.interval, &self.paths) {
            error!(
                symbol = %s.symbol,
                interval = %s.interval,
                error = %err,
                "repository bind failed"
            );
            self.running.store(false, Ordering::Release);
            self.session.lock().active = None;
            return Err(err);
        }

        self.publish_snapshot_loading(&s);

        self.start_live_batcher().await;
        self.start_coalescer().await;
        self.hub.start();

        let on_data: LiveDataCallback = {
            let this = self.clone();
            Arc::new(move |live| this.handle_live_candle(sid, live))
        };
        let on_error: StreamErrorCallback = Arc::new(|err| {
            warn!(code = err.code, message = %err.message, "live stream error");
        });
        match self.source.stream_live(&s.symbol, s.interval, on_data, on_error) {
            Ok(handle) => {
                self.session.lock().live_sub = Some(handle);
            }
            Err(err) => {
                error!(
                    symbol = %s.symbol,
                    interval = %s.interval,
                    error = %err,
                    "live stream start failed"
                );
            }
        }

        self.spawn_backfill(sid, s).await;
        Ok(())
    }

    /// Idempotent shutdown of the active session. Joins workers in a fixed
    /// order and force-flushes the repository; never propagates errors.
    pub async fn stop(&self) {
        let live = {
            let mut slot = self.session.lock();
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            self.running.store(false, Ordering::Release);
            slot.active = None;
            slot.live_sub.take()
        };

        if let Some(live) = live {
            live.stop().await;
        }

        let backfill = self.workers.lock().backfill.take();
        join_logged(backfill, "backfill").await;

        let targeted = self.workers.lock().targeted.take();
        join_logged(targeted, "targeted backfill").await;

        self.stop_live_batcher().await;
        self.stop_coalescer().await;
        self.hub.stop().await;

        self.repo.flush_if_needed(true);
    }

    /// Equivalent to `stop()` followed by `start(next)`.
    pub async fn switch_to(self: &Arc<Self>, next: SessionState) -> SyncResult<()> {
        self.stop().await;
        self.start(next).await
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    pub fn is_backfilling(&self) -> bool {
        self.backfilling.load(Ordering::Acquire)
    }

    pub fn has_live_gap(&self) -> bool {
        self.live_gap_pending.load(Ordering::Acquire)
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version.load(Ordering::Acquire)
    }

    fn is_session_current(&self, sid: u64) -> bool {
        let slot = self.session.lock();
        slot.session_id == sid && self.running.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Live path
    // -------------------------------------------------------------------------

    /// Stream callback: enqueue and wake the batcher. Never blocks beyond
    /// the queue lock.
    fn handle_live_candle(&self, sid: u64, live: LiveCandle) {
        if !self.running.load(Ordering::Acquire) || !self.is_session_current(sid) {
            return;
        }
        if self.stop_live_batch.load(Ordering::Acquire) {
            return;
        }

        {
            let mut q = self.live_queue.lock();
            if q.queue.is_empty() {
                q.first_enqueue = Some(Instant::now());
            }
            if q.queue.len() >= LIVE_QUEUE_MAX {
                warn!(dropped_open = q.queue[0].candle.open_time, "live queue full, dropping oldest");
                q.queue.pop_front();
            }
            q.queue.push_back(live);
        }
        self.live_notify.notify_one();
    }

    async fn start_live_batcher(self: &Arc<Self>) {
        self.stop_live_batcher().await;
        self.stop_live_batch.store(false, Ordering::Release);
        {
            let mut q = self.live_queue.lock();
            q.queue.clear();
            q.first_enqueue = None;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move { this.live_batch_loop().await });
        self.workers.lock().live_batch = Some(handle);
    }

    async fn stop_live_batcher(&self) {
        self.stop_live_batch.store(true, Ordering::Release);
        self.live_notify.notify_waiters();
        let handle = self.workers.lock().live_batch.take();
        join_logged(handle, "live batch").await;
        let mut q = self.live_queue.lock();
        q.queue.clear();
        q.first_enqueue = None;
    }

    /// Drain the live queue in batches: immediately at the size threshold,
    /// otherwise between the min and max batching windows measured from the
    /// first enqueue.
    async fn live_batch_loop(self: Arc<Self>) {
        loop {
            // Wait until something is queued or we are told to stop.
            loop {
                if self.stop_live_batch.load(Ordering::Acquire) {
                    break;
                }
                if !self.live_queue.lock().queue.is_empty() {
                    break;
                }
                let _ = tokio::time::timeout(self.cfg.live_batch_max, self.live_notify.notified())
                    .await;
            }

            if self.stop_live_batch.load(Ordering::Acquire) {
                break;
            }
            if self.live_queue.lock().queue.is_empty() {
                continue;
            }

            let first = {
                let mut q = self.live_queue.lock();
                *q.first_enqueue.get_or_insert_with(Instant::now)
            };
            let min_deadline = first + self.cfg.live_batch_min;
            let max_deadline = first + self.cfg.live_batch_max;

            // Batching window: leave early on the immediate threshold.
            loop {
                if self.stop_live_batch.load(Ordering::Acquire) {
                    break;
                }
                let now = Instant::now();
                if now >= min_deadline || now >= max_deadline {
                    break;
                }
                if self.live_queue.lock().queue.len() >= self.cfg.live_batch_immediate {
                    break;
                }
                let wait = min_deadline.saturating_duration_since(now);
                let _ = tokio::time::timeout(wait, self.live_notify.notified()).await;
            }

            let batch: Vec<LiveCandle> = {
                let mut q = self.live_queue.lock();
                q.first_enqueue = None;
                q.queue.drain(..).collect()
            };
            self.process_live_batch(batch).await;
        }

        // Drain whatever arrived before the stop flag flipped.
        let remaining: Vec<LiveCandle> = {
            let mut q = self.live_queue.lock();
            q.first_enqueue = None;
            q.queue.drain(..).collect()
        };
        self.process_live_batch(remaining).await;
    }

    async fn process_live_batch(self: &Arc<Self>, batch: Vec<LiveCandle>) {
        if batch.is_empty() {
            return;
        }

        let session = { self.session.lock().active.clone() };
        let Some(session) = session else {
            return;
        };

        let mut candles = Vec::with_capacity(batch.len());
        let mut any_closed_final = false;
        for live in &batch {
            let mut candle = live.candle.clone();
            if live.is_final {
                candle.is_closed = true;
            }
            any_closed_final = any_closed_final || live.is_final;
            candles.push(candle);
        }

        let summary = self.repo.append_batch(&candles);

        // Fan the merged updates out to the conflation hub. Partials keep
        // flowing while a gap repair is pending; the SeriesUpdated event
        // carries the gap flag instead.
        for (live, candle) in batch.iter().zip(&candles) {
            let payload = CandlePayload {
                symbol: session.symbol.clone(),
                interval: session.interval,
                candle: candle.clone(),
            };
            if live.is_final {
                self.hub.on_close_candle(payload);
            } else {
                self.hub.on_live_tick(payload);
            }
        }

        if summary.state == RangeState::Gap {
            self.live_gap_pending.store(true, Ordering::Release);
            self.gap_in_flight.store(true, Ordering::Release);

            let step = self.repo.interval_ms();
            let reference_open = candles.last().map_or(summary.expected_to, |c| c.open_time);
            let mut padded_to = if summary.expected_to > 0 {
                summary.expected_to
            } else {
                reference_open
            };
            if padded_to <= 0 {
                padded_to = reference_open;
            }
            let mut padded_from = if summary.expected_from > 0 {
                summary.expected_from
            } else {
                padded_to
            };
            if step > 0 {
                let padding = step * self.cfg.targeted_gap_padding as i64;
                padded_from = (padded_from - padding).max(0);
            }

            info!(
                symbol = %session.symbol,
                interval = %session.interval,
                expected_from = summary.expected_from,
                expected_to = summary.expected_to,
                live_open = reference_open,
                "live candle gap detected"
            );

            if padded_to >= padded_from {
                self.schedule_targeted_backfill(padded_from, padded_to).await;
            }
            return;
        }

        if self.live_gap_pending.load(Ordering::Acquire) {
            self.live_gap_pending.store(false, Ordering::Release);
        }

        let appended = summary.appended > 0;
        let replaced = summary.state == RangeState::Replaced;

        let mut should_publish = appended || (replaced && any_closed_final);
        if !should_publish {
            // Keep the UI responsive during pure replacement churn.
            let publish = self.publish.lock();
            should_publish = publish
                .last_live_publish
                .map_or(true, |t| t.elapsed() >= self.cfg.live_publish_throttle);
        }

        if should_publish {
            self.publish.lock().last_live_publish = Some(Instant::now());
            self.schedule_snapshot_publish();
        }
    }

    // -------------------------------------------------------------------------
    // Reverse backfill
    // -------------------------------------------------------------------------

    async fn spawn_backfill(self: &Arc<Self>, sid: u64, s: SessionState) {
        let previous = self.workers.lock().backfill.take();
        join_logged(previous, "previous backfill").await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.backfilling.store(true, Ordering::Release);
            this.run_backfill_reverse(sid, s).await;
            this.backfilling.store(false, Ordering::Release);
        });
        self.workers.lock().backfill = Some(handle);
    }

    /// Walk backward from now in `backfill_chunk` windows until the lookback
    /// horizon, appending each sorted chunk and publishing as data lands.
    async fn run_backfill_reverse(self: &Arc<Self>, sid: u64, s: SessionState) {
        let step = s.interval.ms;
        info!(
            symbol = %s.symbol,
            interval = %s.interval,
            lookback_max_ms = self.cfg.lookback_max_ms,
            chunk = self.cfg.backfill_chunk,
            "reverse backfill start"
        );

        let mut end = align_down_ms(now_ms(), step);
        let mut oldest = if self.cfg.lookback_max_ms > 0 {
            (end - self.cfg.lookback_max_ms).max(0)
        } else {
            0
        };

        let meta = self.repo.metadata();
        if meta.count > 0 {
            if meta.max_open > 0 {
                end = end.min(meta.max_open);
            }
            if meta.min_open > 0 {
                oldest = oldest.min(meta.min_open);
            }
        }

        let limit = self.cfg.backfill_chunk.max(1);
        let mut last_flush = Instant::now();
        let mut consecutive_errors = 0usize;

        while self.running.load(Ordering::Acquire) && end >= oldest {
            if !self.is_session_current(sid) {
                break;
            }

            if last_flush.elapsed() >= BACKFILL_FLUSH_INTERVAL {
                self.repo.flush_if_needed(false);
                last_flush = Instant::now();
            }

            let chunk_span = step * limit as i64;
            let start = (end - chunk_span + step).max(oldest).max(0);
            if start >= end {
                break;
            }

            let range = TimeRange {
                start,
                end: end + step - 1,
            };
            debug!(start = range.start, end = range.end, limit, "reverse backfill window");

            let mut batch = match self
                .source
                .fetch_range(&s.symbol, s.interval, range, limit)
                .await
            {
                Ok(batch) => {
                    consecutive_errors = 0;
                    batch
                }
                Err(err) => {
                    warn!(
                        start = range.start,
                        end = range.end,
                        error = %err,
                        "backfill fetch failed"
                    );
                    consecutive_errors += 1;
                    if consecutive_errors >= BACKFILL_MAX_RETRIES {
                        warn!(retries = consecutive_errors, "reverse backfill giving up");
                        break;
                    }
                    tokio::time::sleep(self.cfg.backfill_min_sleep).await;
                    continue;
                }
            };

            if !self.running.load(Ordering::Acquire) || !self.is_session_current(sid) {
                break;
            }

            batch.sort_by_key(|c| c.open_time);

            let summary = self.repo.append_batch(&batch);
            info!(
                window_start = batch.first().map_or(range.start, |c| c.open_time),
                window_end = batch.last().map_or(range.end, |c| c.open_time),
                count = batch.len(),
                appended = summary.appended,
                "reverse backfill chunk"
            );

            if !batch.is_empty() && summary.appended > 0 {
                self.schedule_snapshot_publish();
            }

            end = match batch.first() {
                Some(front) => front.open_time - step,
                None => start - step,
            };

            if !self.cfg.backfill_min_sleep.is_zero() {
                tokio::time::sleep(self.cfg.backfill_min_sleep).await;
            } else if batch.len() >= limit {
                tokio::time::sleep(BACKFILL_SATURATED_SLEEP).await;
            }
        }

        info!(symbol = %s.symbol, interval = %s.interval, "reverse backfill done");
        self.schedule_snapshot_publish();
        if !self.repo.has_gap() {
            self.gap_in_flight.store(false, Ordering::Release);
        }
        self.repo.flush_if_needed(true);
    }

    // -------------------------------------------------------------------------
    // Targeted gap repair
    // -------------------------------------------------------------------------

    async fn schedule_targeted_backfill(self: &Arc<Self>, from: TimestampMs, to: TimestampMs) {
        if !self.running.load(Ordering::Acquire) || to <= 0 {
            return;
        }

        let (sid, session) = {
            let slot = self.session.lock();
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            (slot.session_id, slot.active.clone())
        };
        let Some(session) = session else {
            return;
        };

        // One repair at a time: the previous task is joined first.
        let previous = self.workers.lock().targeted.take();
        join_logged(previous, "previous targeted backfill").await;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_targeted_backfill(sid, session, from.max(0), to).await;
        });
        self.workers.lock().targeted = Some(handle);
    }

    async fn run_targeted_backfill(
        self: Arc<Self>,
        sid: u64,
        session: SessionState,
        from: TimestampMs,
        to: TimestampMs,
    ) {
        if !self.running.load(Ordering::Acquire) || !self.is_session_current(sid) {
            return;
        }

        let step = session.interval.ms.max(1);
        let range_start = align_down_ms(from.min(to), step);
        let range_end = align_up_ms(from.max(to), step);

        let mut range = TimeRange {
            start: range_start,
            end: range_end + step - 1,
        };
        if range.end <= range.start {
            range.end = range.start + step;
        }

        let span = (range_end - range_start).max(step);
        let limit = ((span / step) as usize + 2)
            .max(self.cfg.targeted_gap_padding)
            .max(self.cfg.backfill_chunk);

        info!(
            symbol = %session.symbol,
            interval = %session.interval,
            window_start = range_start,
            window_end = range_end,
            limit,
            "targeted backfill scheduled"
        );

        let mut batch = match self
            .source
            .fetch_range(&session.symbol, session.interval, range, limit)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    window_start = range.start,
                    window_end = range.end,
                    error = %err,
                    "targeted backfill fetch failed"
                );
                return;
            }
        };

        if !self.running.load(Ordering::Acquire) || !self.is_session_current(sid) {
            return;
        }

        batch.sort_by_key(|c| c.open_time);
        let summary = self.repo.append_batch(&batch);

        info!(
            window_start = batch.first().map_or(range.start, |c| c.open_time),
            window_end = batch.last().map_or(range.end, |c| c.open_time),
            fetched = batch.len(),
            appended = summary.appended,
            "targeted backfill finished"
        );

        if summary.appended > 0 {
            if !self.repo.has_gap() {
                self.gap_in_flight.store(false, Ordering::Release);
            }
            self.schedule_snapshot_publish();
        }

        tokio::time::sleep(TARGETED_BACKFILL_MIN_SLEEP).await;
    }

    // -------------------------------------------------------------------------
    // Snapshot publication
    // -------------------------------------------------------------------------

    /// Request a snapshot publish; the coalescer folds bursts into one flush
    /// per minimum interval.
    pub fn schedule_snapshot_publish(&self) {
        self.pending_snapshot.store(true, Ordering::Release);
        self.snapshot_signal.notify_one();
    }

    async fn start_coalescer(self: &Arc<Self>) {
        self.stop_coalescer().await;
        self.stop_coalesce.store(false, Ordering::Release);
        self.pending_snapshot.store(false, Ordering::Release);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.coalesce_loop().await });
        self.workers.lock().coalescer = Some(handle);
    }

    async fn stop_coalescer(&self) {
        self.stop_coalesce.store(true, Ordering::Release);
        self.snapshot_signal.notify_waiters();
        let handle = self.workers.lock().coalescer.take();
        join_logged(handle, "coalescer").await;
        self.stop_coalesce.store(false, Ordering::Release);
        self.pending_snapshot.store(false, Ordering::Release);
    }

    async fn coalesce_loop(self: Arc<Self>) {
        let min_interval = self.cfg.coalesce_min_interval;
        while !self.stop_coalesce.load(Ordering::Acquire) {
            if self.pending_snapshot.swap(false, Ordering::AcqRel) {
                let wait = {
                    self.publish
                        .lock()
                        .last_publish_time
                        .and_then(|t| min_interval.checked_sub(t.elapsed()))
                };
                if let Some(wait) = wait {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
                self.flush_snapshot();
                self.publish.lock().last_publish_time = Some(Instant::now());
            } else {
                let _ = tokio::time::timeout(min_interval, self.snapshot_signal.notified()).await;
            }
        }

        // A publish requested during shutdown still lands.
        if self.pending_snapshot.swap(false, Ordering::AcqRel) {
            self.flush_snapshot();
        }
    }

    fn publish_snapshot_loading(&self, s: &SessionState) {
        info!(
            state = %UiDataState::Loading,
            symbol = %s.symbol,
            interval = %s.interval,
            "snapshot published"
        );

        self.cache
            .update(Arc::new(CandleSeries::empty(s.interval)));

        self.bus.publish_series_updated(&SeriesUpdated {
            first_open: 0,
            last_open: 0,
            count: 0,
            last_closed: false,
            tail_hash: None,
            state: UiDataState::Loading,
            live_gap: false,
        });
    }

    /// Derive and publish the current snapshot if anything material changed.
    /// While a gap repair is in flight the previously published series is
    /// reused so the chart does not flicker down to a short window.
    fn flush_snapshot(&self) {
        let session = { self.session.lock().active.clone() };
        let gap_in_flight = self.gap_in_flight.load(Ordering::Acquire);

        let mut publish = self.publish.lock();

        let meta = self.repo.metadata();
        let repo_has_gap = self.repo.has_gap();
        let min_history = self.cfg.min_history_ready;

        let mut desired = publish.publish_count;
        if repo_has_gap {
            publish.publish_count = publish.publish_count.max(min_history);
            desired = publish.publish_count;
        }
        if meta.count >= min_history {
            desired = desired.max(min_history);
        }
        if gap_in_flight || repo_has_gap {
            desired = desired.max(publish.last_stable_count.max(min_history));
        }

        let mut reused = false;
        let series: Arc<CandleSeries> =
            if gap_in_flight && repo_has_gap && publish.last_published_series.is_some() {
                reused = true;
                publish
                    .last_published_series
                    .clone()
                    .expect("presence checked above")
            } else {
                match self.repo.get_latest(desired) {
                    Ok(series) => Arc::new(series),
                    Err(err) => {
                        warn!(error = %err, "unable to fetch latest candles for snapshot");
                        return;
                    }
                }
            };

        if !repo_has_gap && gap_in_flight {
            self.gap_in_flight.store(false, Ordering::Release);
        }

        let count = if reused {
            publish.last_published_count
        } else {
            series.len()
        };

        let ui_state = if reused {
            publish.last_published_state
        } else if count == 0 {
            UiDataState::Loading
        } else if count < min_history && desired < min_history {
            UiDataState::LiveOnly
        } else {
            UiDataState::Ready
        };

        if ui_state == UiDataState::Ready && !repo_has_gap && !reused {
            publish.last_stable_count = series.len();
        }

        let live_gap_active = self.live_gap_pending.load(Ordering::Acquire);
        let (symbol, interval_label) = session
            .as_ref()
            .map(|s| (s.symbol.clone(), s.interval.label()))
            .unwrap_or_else(|| ("?".to_string(), "?".to_string()));

        let tail_start = series.len().saturating_sub(TAIL_HASH_CANDLES);
        let tail: Vec<Candle> = series.data[tail_start..].to_vec();
        let tail_hash = (!tail.is_empty()).then(|| hash_candle_tail(&tail));

        let mut should =
            publish.should_publish(ui_state, &symbol, &interval_label, count, &tail);
        if !should && live_gap_active != publish.last_published_live_gap {
            should = true;
        }
        if !should {
            return;
        }

        let state_transition = ui_state != publish.last_published_state;
        let identity_changed = symbol != publish.last_published_symbol
            || interval_label != publish.last_published_interval;

        self.cache.update(series.clone());

        if state_transition || identity_changed {
            info!(
                state = %ui_state,
                symbol = %symbol,
                interval = %interval_label,
                candles = count,
                "snapshot published"
            );
        } else {
            debug!(
                state = %ui_state,
                symbol = %symbol,
                interval = %interval_label,
                candles = count,
                "snapshot published"
            );
        }

        let version = self.snapshot_version.fetch_add(1, Ordering::AcqRel) + 1;
        publish.last_published_version = version;
        publish.last_published_state = ui_state;
        publish.last_published_symbol = symbol;
        publish.last_published_interval = interval_label;
        publish.last_published_count = count;
        publish.last_published_tail = tail;
        publish.last_published_series = Some(series.clone());
        publish.last_published_live_gap = live_gap_active;

        self.bus.publish_series_updated(&SeriesUpdated {
            first_open: series.first_open,
            last_open: series.last_open,
            count: series.len(),
            last_closed: series.data.last().map_or(false, |c| c.is_closed),
            tail_hash,
            state: ui_state,
            live_gap: live_gap_active,
        });
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn now_ms() -> TimestampMs {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

async fn join_logged(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                warn!(worker = name, error = %err, "worker join failed");
            }
        }
    }
}

/// FNV-1a over the tail candles' identity fields. Cheap way for consumers to
/// spot a trailing-window change when count and range are identical.
fn hash_candle_tail(tail: &[Candle]) -> u64 {
    const OFFSET_BASIS: u64 = 1_469_598_103_934_665_603;
    const PRIME: u64 = 1_099_511_628_211;

    fn mix(hash: &mut u64, bytes: &[u8]) {
        for &b in bytes {
            *hash ^= b as u64;
            *hash = hash.wrapping_mul(PRIME);
        }
    }

    let mut hash = OFFSET_BASIS;
    for candle in tail {
        mix(&mut hash, &candle.open_time.to_le_bytes());
        mix(&mut hash, &candle.close_time.to_le_bytes());
        mix(&mut hash, &candle.open.to_le_bytes());
        mix(&mut hash, &candle.high.to_le_bytes());
        mix(&mut hash, &candle.low.to_le_bytes());
        mix(&mut hash, &candle.close.to_le_bytes());
        mix(&mut hash, &[candle.is_closed as u8]);
    }
    hash
}

// =============================================================================
// Tests
// =============================================================================
