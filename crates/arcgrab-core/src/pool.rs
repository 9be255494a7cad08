//! Worker pool: bounded concurrent fetch execution with dynamic scaling.
//!
//! A dispatcher pulls file ids off the work queue and keeps at most the
//! current target number of fetches in flight. Every outcome feeds the
//! scaling policy: five consecutive successes grow the target by one (up to
//! the ceiling), any non-skip failure or backoff trip shrinks it by one
//! (down to one) and resets the streak.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::fetcher::{self, FetchContext, FetchOutcome, FetchReport};
use crate::retry::ErrorKind;
use crate::store::{FileId, FileStatus, FileUpdate, StateStore};

/// Live pool gauges sampled by the metrics publisher.
#[derive(Default)]
pub struct PoolGauges {
    pub active: AtomicUsize,
    pub target: AtomicUsize,
}

/// How one outcome moves the scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutcomeClass {
    Success,
    /// Skips, cancellations, lost claims, permanent 404 skips.
    Neutral,
    Failure,
}

fn classify_report(report: &FetchReport) -> OutcomeClass {
    if report.trips > 0 {
        return OutcomeClass::Failure;
    }
    match &report.outcome {
        FetchOutcome::Done => OutcomeClass::Success,
        FetchOutcome::Skipped | FetchOutcome::Cancelled => OutcomeClass::Neutral,
        FetchOutcome::Failed { kind, .. } => {
            if *kind == ErrorKind::Missing {
                OutcomeClass::Neutral
            } else {
                OutcomeClass::Failure
            }
        }
    }
}

/// The dynamic scaling rule: start at one worker, grow by one after five
/// consecutive successes, shrink by one (floor one) on any failure or trip.
/// With `dynamic` off the target is pinned at the ceiling.
struct ScalePolicy {
    ceiling: usize,
    dynamic: bool,
    target: usize,
    streak: u32,
}

impl ScalePolicy {
    fn new(ceiling: usize, dynamic: bool) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            ceiling,
            dynamic,
            target: if dynamic { 1 } else { ceiling },
            streak: 0,
        }
    }

    fn target(&self) -> usize {
        self.target
    }

    fn record(&mut self, class: OutcomeClass) {
        if !self.dynamic {
            return;
        }
        match class {
            OutcomeClass::Success => {
                self.streak += 1;
                if self.streak >= 5 {
                    self.target = (self.target + 1).min(self.ceiling);
                    self.streak = 0;
                    tracing::debug!(target = self.target, "worker target raised");
                }
            }
            OutcomeClass::Failure => {
                self.target = self.target.saturating_sub(1).max(1);
                self.streak = 0;
                tracing::debug!(target = self.target, "worker target lowered");
            }
            OutcomeClass::Neutral => {}
        }
    }
}

/// Drain the work queue. Returns once the queue is closed and every
/// in-flight fetch has been released, or once cancellation has drained the
/// running set.
pub async fn run_pool(
    store: StateStore,
    ctx: Arc<FetchContext>,
    mut queue_rx: mpsc::UnboundedReceiver<FileId>,
    ceiling: usize,
    dynamic: bool,
    gauges: Arc<PoolGauges>,
) -> Result<()> {
    let mut scale = ScalePolicy::new(ceiling, dynamic);
    let mut pending: VecDeque<FileId> = VecDeque::new();
    let mut tasks: JoinSet<Result<Option<FetchReport>>> = JoinSet::new();
    let mut queue_open = true;

    loop {
        let cancelled = ctx.cancel.is_cancelled();
        if cancelled {
            // Stop handing out work; queued rows stay pending in the store.
            pending.clear();
        } else {
            while tasks.len() < scale.target() {
                let Some(file_id) = pending.pop_front() else {
                    break;
                };
                let store = store.clone();
                let ctx = Arc::clone(&ctx);
                tasks.spawn(fetch_one(store, ctx, file_id));
            }
        }
        gauges.active.store(tasks.len(), Ordering::Relaxed);
        gauges.target.store(scale.target(), Ordering::Relaxed);

        if tasks.is_empty() && (cancelled || (!queue_open && pending.is_empty())) {
            break;
        }

        tokio::select! {
            joined = tasks.join_next(), if !tasks.is_empty() => {
                let Some(joined) = joined else { continue };
                let report = joined.context("fetch task panicked")??;
                let Some(report) = report else { continue };
                scale.record(classify_report(&report));
            }
            received = queue_rx.recv(), if queue_open && !cancelled => {
                match received {
                    Some(file_id) => pending.push_back(file_id),
                    None => queue_open = false,
                }
            }
            _ = ctx.cancel.cancelled(), if !cancelled => {}
        }
    }

    gauges.active.store(0, Ordering::Relaxed);
    Ok(())
}

/// Claim, fetch, release. Returns None when the claim was lost (someone
/// else holds the file) so the scheduler treats it as a non-event.
async fn fetch_one(
    store: StateStore,
    ctx: Arc<FetchContext>,
    file_id: FileId,
) -> Result<Option<FetchReport>> {
    if !store.claim_file(file_id).await? {
        return Ok(None);
    }
    let Some(file) = store.get_file(file_id).await? else {
        return Ok(None);
    };
    let Some(item) = store.get_item(file.item_id).await? else {
        return Ok(None);
    };

    let dest = PathBuf::from(&file.dest_path);
    if let Some(parent) = dest.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            let update = FileUpdate {
                status: FileStatus::Failed,
                bytes_done: file.bytes_done,
                attempts: file.attempts,
                last_error: Some(ErrorKind::Io.code().to_string()),
                http_status: None,
            };
            store.release_file(file_id, &update).await?;
            tracing::warn!(name = %file.name, error = %e, "cannot create destination directory");
            return Ok(Some(FetchReport {
                outcome: FetchOutcome::Failed {
                    kind: ErrorKind::Io,
                    http_status: None,
                    message: e.to_string(),
                },
                trips: 0,
                attempts: file.attempts.max(0) as u32,
                bytes_done: file.bytes_done.max(0) as u64,
            }));
        }
    }

    let blocking_ctx = Arc::clone(&ctx);
    let blocking_file = file.clone();
    let identifier = item.identifier.clone();
    let report = tokio::task::spawn_blocking(move || {
        fetcher::fetch_file(&blocking_ctx, &blocking_file, &identifier)
    })
    .await
    .context("fetch task join")?;

    let update = match &report.outcome {
        FetchOutcome::Done => FileUpdate {
            status: FileStatus::Done,
            bytes_done: report.bytes_done as i64,
            attempts: report.attempts as i64,
            last_error: None,
            http_status: None,
        },
        FetchOutcome::Skipped => FileUpdate {
            status: FileStatus::Skipped,
            bytes_done: report.bytes_done as i64,
            attempts: report.attempts as i64,
            last_error: None,
            http_status: None,
        },
        FetchOutcome::Failed {
            kind, http_status, ..
        } => FileUpdate {
            status: FileStatus::Failed,
            bytes_done: report.bytes_done as i64,
            attempts: report.attempts as i64,
            last_error: Some(kind.code().to_string()),
            http_status: http_status.map(|s| s as i64),
        },
        // The partial stays on disk; resumption picks it up.
        FetchOutcome::Cancelled => FileUpdate {
            status: FileStatus::Pending,
            bytes_done: report.bytes_done as i64,
            attempts: report.attempts as i64,
            last_error: None,
            http_status: None,
        },
    };
    store.release_file(file_id, &update).await?;
    Ok(Some(report))
}
