//! Job-scope cancellation: one cooperative signal shared by every worker.
//!
//! Blocking code (curl transfers, the token bucket) polls `is_cancelled`;
//! async tasks await `cancelled`. Cancelling is idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared cancel signal for one job. Clone is cheap; all clones observe
/// the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes every task blocked in `cancelled`.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Completes when the token is cancelled. Returns immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Blocking sleep that wakes early on cancellation. Returns false if the
/// token was cancelled before the delay elapsed.
pub(crate) fn sleep_cancellable(delay: std::time::Duration, cancel: &CancelToken) -> bool {
    const SLICE: std::time::Duration = std::time::Duration::from_millis(100);
    let deadline = std::time::Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) else {
            return true;
        };
        std::thread::sleep(left.min(SLICE));
    }
}
