//! Fetch an item's metadata document over HTTP (blocking curl).

use anyhow::{Context, Result};
use std::time::Duration;

use crate::backoff::{BackoffGate, TripReason};
use crate::control::CancelToken;
use crate::retry::{classify, ErrorKind, FetchError, RetryDecision, RetryPolicy};

use super::parse::{parse_manifest, ManifestFile};

pub(crate) const USER_AGENT: &str = concat!("arcgrab/", env!("CARGO_PKG_VERSION"));

/// Fetch and parse the manifest for one identifier, retrying transient
/// failures per `policy` and honoring the shared backoff gate. Runs on a
/// blocking thread.
pub fn fetch_manifest(
    url: &str,
    identifier: &str,
    auth: Option<&str>,
    gate: &BackoffGate,
    cancel: &CancelToken,
    policy: &RetryPolicy,
) -> Result<Vec<ManifestFile>> {
    let mut attempt = 1u32;
    loop {
        if !gate.wait(cancel) {
            return Err(FetchError::Cancelled.into());
        }
        let err = match get_body(url, auth, cancel) {
            Ok((200, body)) => {
                return parse_manifest(&body)
                    .with_context(|| format!("parse manifest for {identifier}"));
            }
            Ok((status, _)) => FetchError::Http(status),
            Err(e) => e,
        };

        let kind = classify(&err);
        match kind {
            ErrorKind::Throttled => {
                gate.trip(TripReason::Throttled);
            }
            ErrorKind::Overloaded => {
                gate.trip(TripReason::Overloaded);
            }
            _ => {}
        }
        match policy.decide(attempt, kind) {
            RetryDecision::NoRetry => {
                return Err(anyhow::Error::new(err)
                    .context(format!("manifest fetch for {identifier}")));
            }
            RetryDecision::RetryAfter(delay) => {
                tracing::debug!(
                    identifier,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "manifest fetch retry"
                );
                if !crate::control::sleep_cancellable(delay, cancel) {
                    return Err(FetchError::Cancelled.into());
                }
                attempt += 1;
            }
        }
    }
}

/// One GET collecting the whole body into memory (manifests are small).
fn get_body(
    url: &str,
    auth: Option<&str>,
    cancel: &CancelToken,
) -> Result<(u32, Vec<u8>), FetchError> {
    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.useragent(USER_AGENT)?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(Duration::from_secs(30))?;
    easy.timeout(Duration::from_secs(120))?;

    if let Some(value) = auth {
        let mut list = curl::easy::List::new();
        list.append(&format!("Authorization: {}", value))?;
        easy.http_headers(list)?;
    }

    let mut body = Vec::new();
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            if cancel.is_cancelled() {
                return Ok(0); // abort transfer
            }
            body.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.perform().map_err(|e| {
            if cancel.is_cancelled() {
                FetchError::Cancelled
            } else {
                FetchError::Curl(e)
            }
        })?;
    }

    let code = easy.response_code()?;
    Ok((code, body))
}
