//!  src/util/debounce.rs
//!  ===================================================================
//!  Trailing-edge debouncer for keystroke-rate input.
//!
//!  • `schedule` replaces the pending value and restarts the timer; only
//!    the last value of a burst is ever delivered.
//!  • Uses a spawned `tokio::time::sleep_until` task per burst. Superseded
//!    sleepers are aborted, and an epoch counter guards the window between
//!    a sleeper waking and the slot lock being taken.
//!  • `cancel` (or dropping the debouncer) discards the pending value so the
//!    callback never runs against a torn-down consumer.
//!  • Delivery happens with the slot lock held. Once `cancel`, `flush` or
//!    drop returns, no earlier value can still be on its way, and the
//!    callback must not call back into the same debouncer.
//!  -------------------------------------------------------------------

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, trace};

/* ======================== DebounceConfig ============================ */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Quiet period required before the pending value is delivered.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    /// Upper bound on how long a continuous burst may postpone delivery.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_wait: Option<Duration>,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self::search_input()
    }
}

impl DebounceConfig {
    /// Quick config for search input debouncing
    #[must_use]
    pub const fn search_input() -> Self {
        Self {
            delay: Duration::from_millis(300),
            max_wait: None,
        }
    }

    #[must_use]
    pub const fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            max_wait: None,
        }
    }
}

/* ============================ Debouncer ============================ */

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Slot<T> {
    pending: Option<T>,
    burst_start: Option<Instant>,
    sleeper: Option<JoinHandle<()>>,
    // Bumped on every schedule/cancel/flush; a sleeper only fires for its own epoch.
    epoch: u64,
}

impl<T> Slot<T> {
    fn disarm(&mut self) {
        if let Some(handle) = self.sleeper.take() {
            handle.abort();
        }
        self.burst_start = None;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

/// Coalesces a stream of values into one delayed callback invocation.
pub struct Debouncer<T> {
    cfg: DebounceConfig,
    slot: Arc<Mutex<Slot<T>>>,
    callback: Callback<T>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Create a debouncer that invokes `callback` with the last value of each burst.
    pub fn new<F>(cfg: DebounceConfig, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            cfg,
            slot: Arc::new(Mutex::new(Slot {
                pending: None,
                burst_start: None,
                sleeper: None,
                epoch: 0,
            })),
            callback: Arc::new(callback),
        }
    }

    /// Create a debouncer and its Rx endpoint
    #[must_use]
    pub fn channel(cfg: DebounceConfig) -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deb = Self::new(cfg, move |value| {
            // Receiver gone means the consumer was torn down.
            let _ = tx.send(value);
        });
        (deb, rx)
    }

    #[must_use]
    pub const fn config(&self) -> &DebounceConfig {
        &self.cfg
    }

    /// Replace the pending value and restart the quiet-period timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, value: T) {
        let mut slot = self.slot.lock();
        let now = Instant::now();

        let burst_start = slot.burst_start.unwrap_or(now);
        slot.disarm();
        slot.burst_start = Some(burst_start);
        slot.pending = Some(value);

        let mut deadline = now + self.cfg.delay;
        if let Some(max_wait) = self.cfg.max_wait {
            deadline = deadline.min(burst_start + max_wait);
        }

        let epoch = slot.epoch;
        let slot_ptr = Arc::clone(&self.slot);
        let callback = Arc::clone(&self.callback);

        trace!(epoch, delay_ms = self.cfg.delay.as_millis(), "Debounce timer armed");

        slot.sleeper = Some(tokio::spawn(async move {
            sleep_until(deadline).await;

            let mut slot = slot_ptr.lock();
            if slot.epoch != epoch {
                return;
            }
            slot.sleeper = None;
            slot.burst_start = None;

            if let Some(value) = slot.pending.take() {
                debug!(epoch, "Debounce timer elapsed, delivering value");
                (*callback)(value);
            }
        }));
    }

    /// Drop the pending value without delivering it.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        let had_pending = slot.pending.take().is_some();
        slot.disarm();
        if had_pending {
            debug!("Debounced value cancelled");
        }
        had_pending
    }

    /// Deliver the pending value immediately, if any.
    pub fn flush(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.disarm();

        match slot.pending.take() {
            Some(value) => {
                debug!("Flushing debounced value");
                (*self.callback)(value);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.disarm();
    }
}

impl<T> std::fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    const D: Duration = Duration::from_millis(300);

    #[tokio::test(start_paused = true)]
    async fn test_burst_delivers_only_last_value() {
        let (deb, mut rx) = Debouncer::channel(DebounceConfig::with_delay(D));

        deb.schedule("a");
        sleep(Duration::from_millis(50)).await;
        deb.schedule("ab");
        sleep(Duration::from_millis(50)).await;
        deb.schedule("abc");
        let last_keystroke = Instant::now();

        let value = rx.recv().await.unwrap();
        assert_eq!(value, "abc");
        let waited = last_keystroke.elapsed();
        assert!(waited >= D && waited < D + Duration::from_millis(5), "{waited:?}");

        sleep(D * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_calls_fire_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(0));
        let (f, l) = (Arc::clone(&fired), Arc::clone(&last));
        let deb = Debouncer::new(DebounceConfig::with_delay(D), move |v: u32| {
            f.fetch_add(1, Ordering::SeqCst);
            *l.lock() = v;
        });

        for i in 0..25 {
            deb.schedule(i);
            sleep(Duration::from_millis(299)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock(), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_fire_separately() {
        let (deb, mut rx) = Debouncer::channel(DebounceConfig::with_delay(D));

        deb.schedule(1);
        assert_eq!(rx.recv().await, Some(1));

        deb.schedule(2);
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_delivery() {
        let (deb, mut rx) = Debouncer::channel(DebounceConfig::with_delay(D));

        deb.schedule("query");
        assert!(deb.is_pending());
        assert!(deb.cancel());
        assert!(!deb.is_pending());

        sleep(D * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(!deb.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_immediately_once() {
        let (deb, mut rx) = Debouncer::channel(DebounceConfig::with_delay(D));

        deb.schedule(7);
        assert!(deb.flush());
        assert_eq!(rx.try_recv().ok(), Some(7));

        sleep(D * 2).await;
        assert!(rx.try_recv().is_err());
        assert!(!deb.flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_timer() {
        let (deb, mut rx) = Debouncer::channel(DebounceConfig::with_delay(D));
        deb.schedule(1);
        drop(deb);

        advance(D * 2).await;
        // Sender lived inside the callback, so the channel closes without a value.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_waits_for_delivery_in_progress() {
        let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let (e, sink) = (Arc::clone(&entered), Arc::clone(&delivered));
        let deb = Debouncer::new(DebounceConfig::with_delay(Duration::from_millis(5)), move |v: u32| {
            e.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            sink.lock().push(v);
        });

        deb.schedule(1);
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(!deb.cancel());
        // The callback finished before cancel returned.
        assert_eq!(*delivered.lock(), vec![1]);

        drop(deb);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*delivered.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_bounds_long_bursts() {
        let cfg = DebounceConfig {
            delay: D,
            max_wait: Some(Duration::from_millis(500)),
        };
        let start = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let deb = Debouncer::new(cfg, move |v: u32| sink.lock().push((v, start.elapsed())));

        for i in 0..10 {
            deb.schedule(i);
            sleep(Duration::from_millis(90)).await;
        }

        let seen = seen.lock();
        let (value, at) = seen[0];
        assert_eq!(value, 5);
        assert!(at >= Duration::from_millis(500) && at < Duration::from_millis(505), "{at:?}");
    }
}
