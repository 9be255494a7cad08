//! One ranged HTTP transfer appended to a `.part` file.
//!
//! Streams the body through the rate governor and the digest, checkpoints
//! durable progress at a coarse cadence, and aborts promptly on
//! cancellation or local write failure by returning 0 from the curl write
//! callback.

use md5::{Digest, Md5};
use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::control::CancelToken;
use crate::governor::RateGovernor;
use crate::retry::FetchError;
use crate::store::FileId;

use super::Checkpoint;

/// Persist bytes-downloaded every this many bytes, or every
/// [`CHECKPOINT_INTERVAL`], whichever comes sooner.
const CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

pub(super) struct StreamParams<'a> {
    pub url: &'a str,
    pub auth: Option<&'a str>,
    pub part_path: &'a Path,
    /// Offset to resume from; 0 issues a plain request.
    pub resume_from: u64,
    /// Remote size in bytes; 0 = unknown.
    pub expected_size: u64,
    pub file_id: FileId,
    /// Digest state, already seeded with the partial's content.
    pub hasher: &'a mut Md5,
    pub governor: &'a RateGovernor,
    pub cancel: &'a CancelToken,
    pub checkpoint_tx: &'a tokio::sync::mpsc::Sender<Checkpoint>,
    /// Rolling throughput counter shared with the metrics publisher.
    pub bytes_counter: &'a AtomicU64,
}

/// Run one transfer. On success returns the total bytes now on disk
/// (`resume_from` + everything appended this attempt).
pub(super) fn stream_to_part(p: StreamParams<'_>) -> Result<u64, FetchError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(p.part_path)
        .map_err(FetchError::Storage)?;

    let mut easy = curl::easy::Easy::new();
    easy.url(p.url)?;
    easy.useragent(crate::manifest::fetch::USER_AGENT)?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(Duration::from_secs(30))?;
    // Inactivity timeout: under 1 KiB/s for 60 s counts as a stall.
    easy.low_speed_limit(1024)?;
    easy.low_speed_time(Duration::from_secs(60))?;
    if p.resume_from > 0 {
        easy.range(&format!("{}-", p.resume_from))?;
    }
    if let Some(value) = p.auth {
        let mut list = curl::easy::List::new();
        list.append(&format!("Authorization: {}", value))?;
        easy.http_headers(list)?;
    }

    // Status of the response currently being delivered; redirect hops
    // overwrite it before any body bytes arrive.
    let status = Cell::new(0u32);
    let range_ignored = Cell::new(false);
    let write_error: RefCell<Option<std::io::Error>> = RefCell::new(None);
    let mut written = 0u64;

    {
        let mut last_checkpoint_bytes = 0u64;
        let mut last_checkpoint_at = Instant::now();
        let mut transfer = easy.transfer();
        transfer.header_function(|line| {
            if let Some(code) = parse_status_line(line) {
                status.set(code);
            }
            true
        })?;
        transfer.write_function(|data| {
            if p.cancel.is_cancelled() {
                return Ok(0); // abort transfer
            }
            let code = status.get();
            if code == 200 && p.resume_from > 0 {
                // Server ignored the range; the partial is useless.
                range_ignored.set(true);
                return Ok(0);
            }
            if code != 200 && code != 206 {
                // Error/redirect body: consume without touching the partial.
                return Ok(data.len());
            }
            if !p.governor.consume(data.len() as u64, p.cancel) {
                return Ok(0);
            }
            if let Err(e) = file.write_all(data) {
                *write_error.borrow_mut() = Some(e);
                return Ok(0);
            }
            p.hasher.update(data);
            written += data.len() as u64;
            p.bytes_counter.fetch_add(data.len() as u64, Ordering::Relaxed);

            let since_last = written - last_checkpoint_bytes;
            if since_last >= CHECKPOINT_BYTES
                || last_checkpoint_at.elapsed() >= CHECKPOINT_INTERVAL
            {
                let _ = p.checkpoint_tx.try_send(Checkpoint {
                    file_id: p.file_id,
                    bytes_done: (p.resume_from + written) as i64,
                });
                last_checkpoint_bytes = written;
                last_checkpoint_at = Instant::now();
            }
            Ok(data.len())
        })?;

        if let Err(e) = transfer.perform() {
            if p.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if let Some(io) = write_error.borrow_mut().take() {
                return Err(FetchError::Storage(io));
            }
            if range_ignored.get() {
                return Err(FetchError::RangeIgnored);
            }
            return Err(FetchError::Curl(e));
        }
    }

    let code = easy.response_code()?;
    if code != 200 && code != 206 {
        return Err(FetchError::Http(code));
    }

    file.sync_all().map_err(FetchError::Storage)?;
    let total = p.resume_from + written;
    if p.expected_size > 0 && total < p.expected_size {
        // Clean close before the advertised end: premature EOF. Keep the
        // partial; the next attempt resumes from here.
        return Err(FetchError::ShortBody {
            expected: p.expected_size,
            received: total,
        });
    }
    Ok(total)
}

/// Extract the status code from an `HTTP/x.y NNN ...` header line.
fn parse_status_line(line: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(line).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
