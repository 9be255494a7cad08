//! Job metrics: aggregate snapshots published once a second.
//!
//! Counts come from the state store (eventually consistent, may lag by one
//! publish interval); throughput comes from a shared byte counter the
//! transfer threads bump on every chunk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::backoff::BackoffGate;
use crate::control::CancelToken;
use crate::pool::PoolGauges;
use crate::store::{ProgressCounts, StateStore};

/// Publish interval for metrics snapshots.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Resolving,
    Downloading,
    Finalizing,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Resolving => "resolving",
            Phase::Downloading => "downloading",
            Phase::Finalizing => "finalizing",
            Phase::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of a job, published to the metrics sink and returned
/// by `Engine::status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub phase: Phase,
    pub total_files: u64,
    pub done: u64,
    pub failed: u64,
    pub in_progress: u64,
    pub pending: u64,
    pub skipped: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub workers_active: usize,
    pub workers_target: usize,
    /// Rolling one-second throughput.
    pub bytes_per_sec: u64,
    /// Derived from rolling throughput; None when the rate is zero.
    pub eta_secs: Option<u64>,
    /// Seconds until the backoff gate opens, when it is closed.
    pub quiet_until_secs: Option<u64>,
}

impl Snapshot {
    pub(crate) fn from_counts(phase: Phase, counts: &ProgressCounts) -> Self {
        Snapshot {
            phase,
            total_files: counts.total_files(),
            done: counts.done,
            failed: counts.failed,
            in_progress: counts.in_progress,
            pending: counts.pending,
            skipped: counts.skipped,
            bytes_done: counts.bytes_done,
            bytes_total: counts.bytes_total,
            ..Snapshot::default()
        }
    }

    pub(crate) fn with_rate(mut self, bytes_per_sec: u64) -> Self {
        self.bytes_per_sec = bytes_per_sec;
        let remaining = self.bytes_total.saturating_sub(self.bytes_done);
        self.eta_secs = if remaining == 0 {
            Some(0)
        } else if bytes_per_sec > 0 {
            Some(remaining / bytes_per_sec)
        } else {
            None
        };
        self
    }
}

/// Counters shared between the transfer threads, the pool, and the
/// publisher.
#[derive(Default)]
pub struct EngineMetrics {
    /// Monotonic count of body bytes written this session.
    pub bytes_counter: Arc<AtomicU64>,
    pub gauges: Arc<PoolGauges>,
    phase: Mutex<Phase>,
}

impl EngineMetrics {
    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }
}

/// Publish a snapshot every second until the job is cancelled. The
/// controller publishes the final snapshot itself when the job drains.
pub(crate) async fn run_publisher(
    store: StateStore,
    job_id: String,
    metrics: Arc<EngineMetrics>,
    gate: Arc<BackoffGate>,
    cancel: CancelToken,
    snapshot_tx: watch::Sender<Snapshot>,
) {
    let mut last_bytes = metrics.bytes_counter.load(Ordering::Relaxed);
    let mut last_at = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PUBLISH_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }

        let counts = match store.progress_snapshot(&job_id).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "metrics snapshot query failed");
                continue;
            }
        };

        let now = Instant::now();
        let bytes = metrics.bytes_counter.load(Ordering::Relaxed);
        let elapsed = now.duration_since(last_at).as_secs_f64();
        let rate = if elapsed > 0.0 {
            ((bytes - last_bytes) as f64 / elapsed) as u64
        } else {
            0
        };
        last_bytes = bytes;
        last_at = now;

        let mut snapshot =
            Snapshot::from_counts(metrics.phase(), &counts).with_rate(rate);
        snapshot.workers_active = metrics.gauges.active.load(Ordering::Relaxed);
        snapshot.workers_target = metrics.gauges.target.load(Ordering::Relaxed);
        snapshot.quiet_until_secs = gate.remaining().map(|d| d.as_secs());
        if snapshot_tx.send(snapshot).is_err() {
            break; // every receiver is gone
        }
    }
}
