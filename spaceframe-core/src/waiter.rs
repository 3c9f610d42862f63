//! Bounded-wait task accounting, plus the queue drain helper used at
//! shutdown.
//!
//! [`Waiter`] is how an engine knows its worker tasks have wound down: every
//! worker holds a [`WaitGuard`] for its lifetime, and `wait_deadline` blocks
//! until all guards are dropped or the deadline passes. Tying the count to a
//! guard keeps registration and completion symmetric even when a worker
//! exits early.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Shared {
    count: AtomicUsize,
    notify_tx: flume::Sender<()>,
    notify_rx: flume::Receiver<()>,
}

/// Counts outstanding worker tasks and supports waiting, with a deadline,
/// for the count to reach zero.
#[derive(Clone)]
pub struct Waiter {
    shared: Arc<Shared>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    #[must_use]
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = flume::unbounded();
        Self {
            shared: Arc::new(Shared {
                count: AtomicUsize::new(0),
                notify_tx,
                notify_rx,
            }),
        }
    }

    /// Register one worker. The returned guard must be moved into the worker
    /// task; dropping it marks the worker complete.
    #[must_use]
    pub fn guard(&self) -> WaitGuard {
        self.shared.count.fetch_add(1, Ordering::SeqCst);
        WaitGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Wait until every guard has been dropped or `deadline` passes.
    /// Returns true when the count reached zero.
    pub async fn wait_deadline(&self, deadline: Instant) -> bool {
        loop {
            if self.shared.count.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = compio::time::timeout(
                deadline - now,
                self.shared.notify_rx.recv_async(),
            )
            .await;
        }
    }
}

/// Completion token for one worker task. Dropping it decrements the count
/// and wakes waiters when the last worker finishes.
pub struct WaitGuard {
    shared: Arc<Shared>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.shared.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.shared.notify_tx.try_send(());
        }
    }
}

/// Poll `queue` until it is empty or `deadline` passes, sleeping in 10 ms
/// steps. Returns true when the queue drained. Used during linger: messages
/// already queued get a bounded chance to reach their pipe before teardown.
pub async fn drain_queue<T>(queue: &flume::Sender<T>, deadline: Instant) -> bool {
    const STEP: Duration = Duration::from_millis(10);

    loop {
        if queue.is_empty() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        compio::time::sleep(STEP.min(deadline - now)).await;
    }
}
