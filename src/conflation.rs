// =============================================================================
// Live Conflation Hub — per-key coalescing of outbound candle updates
// =============================================================================
//
// Bursts of partial tick updates collapse to at most one Partial message per
// sweep window; Close messages bypass the window and are emitted on the
// caller's task. Per key, emitted sequence numbers are strictly increasing
// and a Partial prepared before a Close is dropped at the post-sweep
// re-check, so a Close is never trailed by a stale Partial.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::types::{Candle, CandleKey, Interval};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(150);

/// One outbound candle bound to its series key.
#[derive(Debug, Clone)]
pub struct CandlePayload {
    pub symbol: String,
    pub interval: Interval,
    pub candle: Candle,
}

impl CandlePayload {
    fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            interval: self.interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Partial,
    Close,
}

/// Message handed to the downstream transport.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub kind: MessageKind,
    pub symbol: String,
    pub interval: Interval,
    pub candle: Candle,
    pub sequence: u64,
}

pub type Emitter = Arc<dyn Fn(HubMessage) + Send + Sync>;

#[derive(Default)]
struct PendingState {
    payload: Option<CandlePayload>,
    has_pending: bool,
    sequence: u64,
}

#[derive(Default)]
struct HubState {
    pending: HashMap<CandleKey, PendingState>,
    emitter: Option<Emitter>,
}

pub struct ConflationHub {
    state: Mutex<HubState>,
    sweep_interval: Duration,
    stopped: AtomicBool,
    stop_signal: Notify,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConflationHub {
    /// Build a hub with the given sweep period (0 falls back to the 150 ms
    /// default). Call [`start`](Self::start) inside a tokio runtime to run
    /// the sweep timer.
    pub fn new(sweep_interval: Duration) -> Self {
        let sweep_interval = if sweep_interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            sweep_interval
        };
        Self {
            state: Mutex::new(HubState::default()),
            sweep_interval,
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            timer: Mutex::new(None),
        }
    }

    /// Install the single downstream sink.
    pub fn set_emitter(&self, emitter: Emitter) {
        self.state.lock().emitter = Some(emitter);
    }

    /// Spawn the periodic sweep task. A stopped hub can be started again;
    /// the installed emitter survives the restart.
    pub fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::Release);
        let hub = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(hub.sweep_interval) => {
                        if hub.stopped.load(Ordering::Acquire) {
                            break;
                        }
                        hub.sweep_once();
                    }
                    _ = hub.stop_signal.notified() => break,
                }
            }
        });
        let previous = self.timer.lock().replace(handle);
        if previous.is_some() {
            warn!("conflation hub started twice, aborting previous timer");
            if let Some(prev) = previous {
                prev.abort();
            }
        }
    }

    /// Stop the timer and discard pending entries. The emitter is not
    /// invoked again until the next `start`.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_signal.notify_waiters();
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "conflation timer join failed");
                }
            }
        }
        self.state.lock().pending.clear();
    }

    /// Record the latest pending partial for the payload's key. Cheap: one
    /// map upsert under the hub lock.
    pub fn on_live_tick(&self, payload: CandlePayload) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let key = payload.key();
        let mut state = self.state.lock();
        let entry = state.pending.entry(key).or_default();
        entry.payload = Some(payload);
        entry.has_pending = true;
    }

    /// Emit a Close immediately, dropping any pending partial for the key.
    /// The key's sequence advances past every prepared Partial, which kills
    /// them at the sweep re-check.
    pub fn on_close_candle(&self, payload: CandlePayload) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let (emitter, message) = {
            let mut state = self.state.lock();
            let entry = state.pending.entry(payload.key()).or_default();
            entry.sequence += 1;
            entry.has_pending = false;
            entry.payload = None;
            let sequence = entry.sequence;

            let Some(emitter) = state.emitter.clone() else {
                return;
            };
            (
                emitter,
                HubMessage {
                    kind: MessageKind::Close,
                    symbol: payload.symbol,
                    interval: payload.interval,
                    candle: payload.candle,
                    sequence,
                },
            )
        };

        emitter(message);
    }

    /// One conflation sweep: capture pending partials under the lock, emit
    /// outside it, and re-verify each message under the lock before handing
    /// it to the emitter (a newer tick or a Close in between suppresses it).
    pub fn sweep_once(&self) {
        let (emitter, prepared) = {
            let mut state = self.state.lock();
            let Some(emitter) = state.emitter.clone() else {
                return;
            };

            let mut prepared = Vec::new();
            for (key, entry) in state.pending.iter_mut() {
                if !entry.has_pending {
                    continue;
                }
                let Some(payload) = entry.payload.clone() else {
                    entry.has_pending = false;
                    continue;
                };
                entry.sequence += 1;
                entry.has_pending = false;
                prepared.push((
                    key.clone(),
                    HubMessage {
                        kind: MessageKind::Partial,
                        symbol: payload.symbol,
                        interval: payload.interval,
                        candle: payload.candle,
                        sequence: entry.sequence,
                    },
                ));
            }
            (emitter, prepared)
        };

        for (key, message) in prepared {
            let should_emit = {
                let state = self.state.lock();
                state
                    .pending
                    .get(&key)
                    .map_or(false, |entry| {
                        entry.sequence == message.sequence && !entry.has_pending
                    })
            };
            if should_emit && !self.stopped.load(Ordering::Acquire) {
                emitter(message);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sample_candle;

    fn payload(symbol: &str, open_time: i64, close: f64, closed: bool) -> CandlePayload {
        CandlePayload {
            symbol: symbol.into(),
            interval: Interval::from_label("1m"),
            candle: sample_candle(open_time, close, closed),
        }
    }

    fn collecting_hub() -> (Arc<ConflationHub>, Arc<Mutex<Vec<HubMessage>>>) {
        let hub = Arc::new(ConflationHub::new(Duration::from_millis(150)));
        let seen: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.set_emitter(Arc::new(move |msg| sink.lock().push(msg)));
        (hub, seen)
    }

    #[test]
    fn burst_coalesces_to_latest_payload() {
        let (hub, seen) = collecting_hub();

        for close in [100.0, 100.5, 101.0, 101.5, 102.0] {
            hub.on_live_tick(payload("BTCUSDT", 60_000, close, false));
        }
        hub.sweep_once();

        let msgs = seen.lock();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Partial);
        assert!((msgs[0].candle.close - 102.0).abs() < f64::EPSILON);
        assert_eq!(msgs[0].sequence, 1);
    }

    #[test]
    fn idle_sweep_emits_nothing() {
        let (hub, seen) = collecting_hub();
        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        hub.sweep_once();
        hub.sweep_once();
        hub.sweep_once();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn close_emits_immediately_and_drops_pending() {
        let (hub, seen) = collecting_hub();

        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        hub.on_close_candle(payload("BTCUSDT", 60_000, 101.0, true));
        hub.sweep_once();

        let msgs = seen.lock();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Close);
        assert!((msgs[0].candle.close - 101.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sequences_strictly_increase_per_key() {
        let (hub, seen) = collecting_hub();

        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        hub.sweep_once();
        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.5, false));
        hub.sweep_once();
        hub.on_close_candle(payload("BTCUSDT", 60_000, 101.0, true));
        hub.on_live_tick(payload("BTCUSDT", 120_000, 102.0, false));
        hub.sweep_once();

        let msgs = seen.lock();
        let sequences: Vec<u64> = msgs.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(msgs[2].kind, MessageKind::Close);
    }

    #[test]
    fn keys_conflate_independently() {
        let (hub, seen) = collecting_hub();

        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        hub.on_live_tick(payload("ETHUSDT", 60_000, 20.0, false));
        hub.sweep_once();

        let msgs = seen.lock();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.sequence == 1));
        let mut symbols: Vec<&str> = msgs.iter().map(|m| m.symbol.as_str()).collect();
        symbols.sort_unstable();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[tokio::test]
    async fn stopped_hub_never_emits() {
        let (hub, seen) = collecting_hub();
        hub.start();

        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        hub.stop().await;
        hub.on_live_tick(payload("BTCUSDT", 60_000, 101.0, false));
        hub.on_close_candle(payload("BTCUSDT", 60_000, 102.0, true));
        hub.sweep_once();

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn stopped_hub_can_be_restarted() {
        let (hub, seen) = collecting_hub();
        hub.start();
        hub.stop().await;

        // Restart: the emitter is still installed and sweeps emit again.
        hub.start();
        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        hub.sweep_once();
        hub.stop().await;

        let msgs = seen.lock();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Partial);
        assert_eq!(msgs[0].sequence, 1);
    }

    #[tokio::test]
    async fn timer_drains_pending_partials() {
        let hub = Arc::new(ConflationHub::new(Duration::from_millis(10)));
        let seen: Arc<Mutex<Vec<HubMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.set_emitter(Arc::new(move |msg| sink.lock().push(msg)));
        hub.start();

        hub.on_live_tick(payload("BTCUSDT", 60_000, 100.0, false));
        tokio::time::sleep(Duration::from_millis(60)).await;
        hub.stop().await;

        let msgs = seen.lock();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind, MessageKind::Partial);
    }
}
