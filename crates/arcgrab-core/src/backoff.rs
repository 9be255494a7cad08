//! Shared backoff gate: a process-wide "quiet until" stamp.
//!
//! Any worker that sees a throttling signal trips the gate; every worker
//! calls `wait` before touching the network. Trips are randomized within
//! [30 s, 60 s) so a pool does not storm the server in lockstep, and
//! concurrent trips merge by taking the later stamp.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::control::CancelToken;

/// Default quiet period bounds after a trip.
const QUIET_MIN: Duration = Duration::from_secs(30);
const QUIET_MAX: Duration = Duration::from_secs(60);

/// Sleep slice while waiting out a quiet period; bounds cancellation latency.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Server signal that caused a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    /// HTTP 429.
    Throttled,
    /// HTTP 503.
    Overloaded,
}

/// Shared quiet-until gate. Lock-guarded with constant-time critical
/// sections; safe to call from blocking transfer threads and async tasks.
pub struct BackoffGate {
    quiet_until: Mutex<Option<Instant>>,
    trips: AtomicU64,
    quiet_min: Duration,
    quiet_max: Duration,
}

impl Default for BackoffGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffGate {
    pub fn new() -> Self {
        Self::with_range(QUIET_MIN, QUIET_MAX)
    }

    /// Gate with custom quiet bounds. Tests use short ranges so trips can be
    /// waited out.
    pub fn with_range(quiet_min: Duration, quiet_max: Duration) -> Self {
        Self {
            quiet_until: Mutex::new(None),
            trips: AtomicU64::new(0),
            quiet_min,
            quiet_max,
        }
    }

    /// Raise the quiet-until stamp to `now + random(min, max)`. A trip never
    /// shortens an existing longer pause. Returns the quiet period applied.
    pub fn trip(&self, reason: TripReason) -> Duration {
        let quiet = if self.quiet_max > self.quiet_min {
            rand::thread_rng().gen_range(self.quiet_min..self.quiet_max)
        } else {
            self.quiet_min
        };
        let proposed = Instant::now() + quiet;
        let mut stamp = self.quiet_until.lock().unwrap();
        match *stamp {
            Some(current) if current >= proposed => {}
            _ => *stamp = Some(proposed),
        }
        self.trips.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(?reason, quiet_secs = quiet.as_secs(), "backoff gate tripped");
        quiet
    }

    /// Time left until the gate opens, if it is currently closed.
    pub fn remaining(&self) -> Option<Duration> {
        let stamp = self.quiet_until.lock().unwrap();
        stamp.and_then(|t| t.checked_duration_since(Instant::now()))
    }

    /// Total trips since the gate was created.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Block until the wall clock passes the quiet-until stamp. Returns
    /// false immediately if the job is cancelled while waiting.
    pub fn wait(&self, cancel: &CancelToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(left) = self.remaining() else {
                return true;
            };
            std::thread::sleep(left.min(WAIT_SLICE));
        }
    }
}
