// =============================================================================
// MarketSource port — the only exchange dependency of the sync engine
// =============================================================================
//
// `fetch_range` pulls historical candles for an inclusive time window;
// `stream_live` delivers live candle updates through callbacks and hands back
// an idempotent stop handle. The data callback must not block: the engine
// only enqueues from it.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::types::{Candle, Interval, LiveCandle, StreamError, TimeRange};

pub type LiveDataCallback = Arc<dyn Fn(LiveCandle) + Send + Sync>;
pub type StreamErrorCallback = Arc<dyn Fn(StreamError) + Send + Sync>;

#[async_trait]
pub trait MarketSource: Send + Sync {
    /// Fetch up to `limit` candles whose open times fall inside `range`
    /// (inclusive). The caller sorts and deduplicates.
    async fn fetch_range(
        &self,
        symbol: &str,
        interval: Interval,
        range: TimeRange,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>>;

    /// Start a live candle stream. `on_data` must only enqueue; `on_error`
    /// receives stream-level errors (the source handles reconnection).
    fn stream_live(
        &self,
        symbol: &str,
        interval: Interval,
        on_data: LiveDataCallback,
        on_error: StreamErrorCallback,
    ) -> anyhow::Result<SubscriptionHandle>;
}

/// Handle for one live subscription. `stop` is idempotent and aborts the
/// underlying stream task.
pub struct SubscriptionHandle {
    stop_flag: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub fn new(stop_flag: Arc<AtomicBool>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            stop_flag,
            task: Mutex::new(task),
        }
    }

    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "live subscription task join failed");
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }
}

// =============================================================================
// Tests
// =============================================================================
