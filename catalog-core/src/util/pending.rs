//! Busy indicator shared by the mutation coordinator and download executor.
//!
//! Each running operation holds a [`PendingGuard`]; the flag reads `true`
//! while at least one guard is alive. Observers subscribe to a watch channel
//! to enable/disable controls.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    count: Mutex<usize>,
    tx: watch::Sender<bool>,
}

/// Counting pending flag. Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct PendingFlag {
    inner: Arc<Inner>,
}

impl PendingFlag {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                count: Mutex::new(0),
                tx,
            }),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        *self.inner.count.lock() > 0
    }

    /// Number of operations currently holding the flag.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.inner.count.lock()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Mark one operation as running until the guard drops.
    #[must_use = "the flag clears as soon as the guard is dropped"]
    pub fn begin(&self) -> PendingGuard {
        let mut count = self.inner.count.lock();
        *count += 1;
        if *count == 1 {
            self.inner.tx.send_replace(true);
        }
        PendingGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for PendingFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps its [`PendingFlag`] raised while alive.
#[derive(Debug)]
pub struct PendingGuard {
    inner: Arc<Inner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.tx.send_replace(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_tracks_overlapping_guards() {
        let flag = PendingFlag::new();
        let rx = flag.subscribe();
        assert!(!flag.is_pending());

        let a = flag.begin();
        let b = flag.begin();
        assert!(flag.is_pending());
        assert_eq!(flag.in_flight(), 2);
        assert!(*rx.borrow());

        drop(a);
        assert!(flag.is_pending());

        drop(b);
        assert!(!flag.is_pending());
        assert!(!*rx.borrow());
    }
}
