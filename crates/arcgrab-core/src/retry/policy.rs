use serde::{Deserialize, Serialize};
use std::time::Duration;

/// High-level classification of a fetch failure.
///
/// Transient kinds are recovered locally by the fetcher; terminal kinds are
/// recorded on the file row and surfaced through metrics and the log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, DNS, connection resets, 5xx other than 503.
    Transient,
    /// HTTP 429: trip the shared backoff gate, then retry.
    Throttled,
    /// HTTP 503: trip the shared backoff gate, then retry.
    Overloaded,
    /// HTTP 401/403: terminal for the file, no retry.
    Auth,
    /// HTTP 404: terminal, recorded as `missing`.
    Missing,
    /// Size or digest mismatch on finalize: discard partial, retry within
    /// the attempt ceiling.
    Integrity,
    /// The on-disk offset is unusable (range ignored, 416): discard the
    /// partial and restart from zero.
    Restart,
    /// Local disk/OS failure: terminal for the file.
    Io,
    /// Job cancellation observed mid-fetch.
    Cancelled,
    /// Any other failure (unexpected 4xx, malformed response): terminal.
    Terminal,
}

impl ErrorKind {
    /// Short code stored in the file row's `last_error` column.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Transient => "net",
            ErrorKind::Throttled => "throttled",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Auth => "auth",
            ErrorKind::Missing => "missing",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Restart => "restart",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Terminal => "http",
        }
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff policy with caps, persisted with the job config.
///
/// Conservative defaults per the engine contract: 5 attempts, base 2 s,
/// capped at 60 s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per file (including the first).
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in seconds.
    pub base_delay_secs: u64,
    /// Upper bound on a single backoff delay, in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 2,
            max_delay_secs: 60,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (1-based: 1 = delay after
    /// the first failure). `base * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 1u64 << attempt.saturating_sub(1).min(8);
        let raw = Duration::from_secs(self.base_delay_secs.saturating_mul(exp));
        raw.min(Duration::from_secs(self.max_delay_secs))
    }

    /// Decide whether to retry after `attempt` failed with `kind`.
    ///
    /// Throttled/overloaded failures answer `RetryAfter(ZERO)` while under
    /// the ceiling: the shared backoff gate supplies the actual wait.
    /// Restart and integrity failures also retry immediately; their recovery
    /// (discarding the partial) happens in the fetcher.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        match kind {
            ErrorKind::Transient => RetryDecision::RetryAfter(self.delay(attempt)),
            ErrorKind::Throttled
            | ErrorKind::Overloaded
            | ErrorKind::Integrity
            | ErrorKind::Restart => RetryDecision::RetryAfter(Duration::ZERO),
            ErrorKind::Auth
            | ErrorKind::Missing
            | ErrorKind::Io
            | ErrorKind::Cancelled
            | ErrorKind::Terminal => RetryDecision::NoRetry,
        }
    }
}
