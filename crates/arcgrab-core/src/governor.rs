//! Shared token-bucket bandwidth governor.
//!
//! One bucket per job, shared by every worker. Workers call `consume(n)`
//! before handing n bytes to disk; the call blocks until the bucket refills.
//! Capacity equals one second of the configured rate, so bursts are capped
//! at `rate` bytes. A rate of 0 disables the governor entirely.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::control::CancelToken;

/// Sleep slice while waiting for refill; bounds how long a cancelled worker
/// can stay blocked in `consume`.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Process-wide token bucket. `consume` is called from blocking transfer
/// threads; the critical section is constant-time token arithmetic.
pub struct RateGovernor {
    /// Bytes per second; 0 = unlimited.
    rate: u64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateGovernor {
    /// Bucket starts full: one second of burst is available immediately.
    pub fn new(rate_bps: u64) -> Self {
        Self {
            rate: rate_bps,
            bucket: Mutex::new(Bucket {
                tokens: rate_bps as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// True when no rate is enforced.
    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Block until `n` tokens are available, then take them. Returns false
    /// without taking anything if the job is cancelled while waiting.
    ///
    /// A chunk larger than the bucket capacity is granted once the bucket is
    /// full; the overdraft is paid back by subsequent refills, so the
    /// long-term average still honors the rate.
    pub fn consume(&self, n: u64, cancel: &CancelToken) -> bool {
        if self.rate == 0 || n == 0 {
            return !cancel.is_cancelled();
        }
        let capacity = self.rate as f64;
        let need = (n as f64).min(capacity);
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate as f64).min(capacity);
                bucket.last_refill = now;
                if bucket.tokens >= need {
                    bucket.tokens -= n as f64;
                    return true;
                }
                Duration::from_secs_f64((need - bucket.tokens) / self.rate as f64)
            };
            std::thread::sleep(wait.min(WAIT_SLICE));
        }
    }
}
