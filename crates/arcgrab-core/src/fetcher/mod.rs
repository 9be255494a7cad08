//! Per-file download protocol: preflight, resume probe, backoff wait,
//! ranged transfer, verification, atomic finalize.
//!
//! One call to [`fetch_file`] owns one claimed file for the duration of the
//! attempt loop and reports a single terminal outcome. Runs on a blocking
//! thread; every suspension point observes the job cancel token.

mod stream;

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::backoff::{BackoffGate, TripReason};
use crate::checksum;
use crate::control::CancelToken;
use crate::governor::RateGovernor;
use crate::manifest;
use crate::retry::{classify, ErrorKind, FetchError, RetryDecision, RetryPolicy};
use crate::store::{FileId, FileRecord};

/// Durable progress message sent to the checkpoint persistence task.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub file_id: FileId,
    pub bytes_done: i64,
}

/// Everything a fetch shares with the rest of the engine. Coordinators are
/// injected so tests can replace them with deterministic instances.
pub struct FetchContext {
    pub endpoint: String,
    pub auth: Option<String>,
    pub sync: bool,
    pub policy: RetryPolicy,
    pub governor: Arc<RateGovernor>,
    pub gate: Arc<BackoffGate>,
    pub cancel: CancelToken,
    pub checkpoint_tx: tokio::sync::mpsc::Sender<Checkpoint>,
    pub bytes_counter: Arc<AtomicU64>,
}

/// Terminal outcome of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Verified and renamed into place.
    Done,
    /// Sync preflight found a verified object already on disk; no traffic.
    Skipped,
    /// Terminal failure recorded on the file row.
    Failed {
        kind: ErrorKind,
        http_status: Option<u32>,
        message: String,
    },
    /// Job cancel observed; the file goes back to pending.
    Cancelled,
}

/// Outcome plus the bookkeeping the scheduler and store need.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    /// Backoff trips raised during this fetch; any trip scales the pool down.
    pub trips: u32,
    pub attempts: u32,
    /// Bytes present on disk when the fetch returned.
    pub bytes_done: u64,
}

impl FetchReport {
    fn new(outcome: FetchOutcome, trips: u32, attempts: u32, bytes_done: u64) -> Self {
        Self {
            outcome,
            trips,
            attempts,
            bytes_done,
        }
    }
}

/// Download one claimed file. `identifier` is the owning item's archive id.
pub fn fetch_file(ctx: &FetchContext, file: &FileRecord, identifier: &str) -> FetchReport {
    let dest = PathBuf::from(&file.dest_path);
    let part = part_path(&dest);
    let expected_size = file.size.max(0) as u64;
    let expected_md5 = file.checksum.as_deref();
    let mut attempts = file.attempts.max(0) as u32;
    let mut trips = 0u32;

    // Preflight: in sync mode a verified final object counts as complete
    // without any network traffic.
    if ctx.sync && dest.is_file() {
        match verify_on_disk(&dest, expected_size, expected_md5) {
            Ok(true) => {
                tracing::debug!(name = %file.name, "sync: existing object verified, skipping");
                return FetchReport::new(FetchOutcome::Skipped, 0, attempts, disk_size(&dest));
            }
            Ok(false) => {
                tracing::debug!(name = %file.name, "sync: existing object does not match, refetching");
            }
            Err(e) => {
                return FetchReport::new(io_failed(e), 0, attempts, 0);
            }
        }
    }

    let url = match manifest::file_url(&ctx.endpoint, identifier, &file.name) {
        Ok(url) => url,
        Err(e) => {
            let outcome = FetchOutcome::Failed {
                kind: ErrorKind::Terminal,
                http_status: None,
                message: format!("{e:#}"),
            };
            return FetchReport::new(outcome, 0, attempts, 0);
        }
    };

    loop {
        attempts += 1;

        if !ctx.gate.wait(&ctx.cancel) {
            return FetchReport::new(FetchOutcome::Cancelled, trips, attempts, disk_size(&part));
        }

        // Resume probe: take the partial's current length and re-seed the
        // digest from its content. A partial at or past the remote size is
        // either finished (verify + finalize) or garbage (discard).
        let mut resume_from = disk_size(&part);
        if expected_size > 0 && resume_from >= expected_size {
            if resume_from == expected_size {
                match finalize(&part, &dest, expected_size, expected_md5, None) {
                    Ok(()) => {
                        return FetchReport::new(
                            FetchOutcome::Done,
                            trips,
                            attempts,
                            expected_size,
                        );
                    }
                    Err(FetchError::Storage(e)) => {
                        return FetchReport::new(io_failed(e), trips, attempts, 0);
                    }
                    Err(_) => {
                        // Digest mismatch: fall through to a clean restart.
                    }
                }
            }
            if let Err(e) = remove_part(&part) {
                return FetchReport::new(io_failed(e), trips, attempts, 0);
            }
            resume_from = 0;
        }

        let mut hasher = Md5::new();
        if resume_from > 0 {
            match checksum::md5_seed(&part) {
                Ok((seeded, n)) if n == resume_from => hasher = seeded,
                Ok(_) | Err(_) => {
                    // Partial changed under us or is unreadable; restart.
                    if let Err(e) = remove_part(&part) {
                        return FetchReport::new(io_failed(e), trips, attempts, 0);
                    }
                    resume_from = 0;
                }
            }
        }

        let result = stream::stream_to_part(stream::StreamParams {
            url: &url,
            auth: ctx.auth.as_deref(),
            part_path: &part,
            resume_from,
            expected_size,
            file_id: file.id,
            hasher: &mut hasher,
            governor: &ctx.governor,
            cancel: &ctx.cancel,
            checkpoint_tx: &ctx.checkpoint_tx,
            bytes_counter: &ctx.bytes_counter,
        });

        let err = match result {
            Ok(total) => {
                match finalize(&part, &dest, expected_size, expected_md5, Some((hasher, total))) {
                    Ok(()) => {
                        return FetchReport::new(FetchOutcome::Done, trips, attempts, total);
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        let kind = classify(&err);
        match kind {
            ErrorKind::Throttled => {
                ctx.gate.trip(TripReason::Throttled);
                trips += 1;
            }
            ErrorKind::Overloaded => {
                ctx.gate.trip(TripReason::Overloaded);
                trips += 1;
            }
            ErrorKind::Integrity | ErrorKind::Restart => {
                // The partial is poisoned (bad digest, wrong offset basis);
                // the next attempt starts from zero.
                if let Err(e) = remove_part(&part) {
                    return FetchReport::new(io_failed(e), trips, attempts, 0);
                }
            }
            ErrorKind::Cancelled => {
                return FetchReport::new(
                    FetchOutcome::Cancelled,
                    trips,
                    attempts,
                    disk_size(&part),
                );
            }
            _ => {}
        }

        match ctx.policy.decide(attempts, kind) {
            RetryDecision::NoRetry => {
                let http_status = match &err {
                    FetchError::Http(code) => Some(*code),
                    _ => None,
                };
                tracing::warn!(name = %file.name, error = %err, kind = kind.code(), "fetch failed");
                let bytes = disk_size(&part);
                if bytes == 0 {
                    // Nothing worth keeping (e.g. the 404 never wrote a byte).
                    let _ = remove_part(&part);
                }
                let outcome = FetchOutcome::Failed {
                    kind,
                    http_status,
                    message: err.to_string(),
                };
                return FetchReport::new(outcome, trips, attempts, bytes);
            }
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(
                    name = %file.name,
                    attempt = attempts,
                    error = %err,
                    delay_secs = delay.as_secs(),
                    "fetch retry"
                );
                if !delay.is_zero() && !crate::control::sleep_cancellable(delay, &ctx.cancel) {
                    return FetchReport::new(
                        FetchOutcome::Cancelled,
                        trips,
                        attempts,
                        disk_size(&part),
                    );
                }
            }
        }
    }
}

/// `<dest>.part`, the never-complete staging object next to the final one.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Verify the completed partial and atomically rename it into place.
///
/// When `streamed` is provided the digest comes from the live hasher;
/// otherwise (resume probe found a full-length partial) the partial is
/// re-hashed from disk.
fn finalize(
    part: &Path,
    dest: &Path,
    expected_size: u64,
    expected_md5: Option<&str>,
    streamed: Option<(Md5, u64)>,
) -> Result<(), FetchError> {
    let (observed_digest, observed_size) = match streamed {
        Some((hasher, total)) => (hex::encode(hasher.finalize()), total),
        None => {
            let digest = checksum::md5_path(part)
                .map_err(|e| FetchError::Storage(std::io::Error::other(format!("{e:#}"))))?;
            (digest, disk_size(part))
        }
    };

    if expected_size > 0 && observed_size != expected_size {
        return Err(FetchError::SizeMismatch {
            expected: expected_size,
            observed: observed_size,
        });
    }
    if let Some(expected) = expected_md5 {
        if !observed_digest.eq_ignore_ascii_case(expected) {
            return Err(FetchError::DigestMismatch {
                expected: expected.to_string(),
                observed: observed_digest,
            });
        }
    }

    std::fs::rename(part, dest).map_err(FetchError::Storage)?;
    Ok(())
}

/// Check an existing final object against the manifest (sync preflight).
fn verify_on_disk(
    dest: &Path,
    expected_size: u64,
    expected_md5: Option<&str>,
) -> std::io::Result<bool> {
    let size = std::fs::metadata(dest)?.len();
    if expected_size > 0 && size != expected_size {
        return Ok(false);
    }
    if let Some(expected) = expected_md5 {
        let digest = checksum::md5_path(dest)
            .map_err(|e| std::io::Error::other(format!("{e:#}")))?;
        if !digest.eq_ignore_ascii_case(expected) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn disk_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remove_part(part: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(part) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn io_failed(e: std::io::Error) -> FetchOutcome {
    FetchOutcome::Failed {
        kind: ErrorKind::Io,
        http_status: None,
        message: e.to_string(),
    }
}
