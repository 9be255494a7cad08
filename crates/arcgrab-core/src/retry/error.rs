//! Fetch error type for retry classification.

use std::fmt;

/// Error from one transfer attempt (curl failure, HTTP error, verification
/// failure, or storage failure). Classified before deciding on retries;
/// converted to anyhow only at the reporting boundary.
#[derive(Debug)]
pub enum FetchError {
    /// Curl reported an error (timeout, connection, etc.).
    Curl(curl::Error),
    /// HTTP response had an unexpected status.
    Http(u32),
    /// Server answered a ranged request with 200: the offset is useless and
    /// the partial must be discarded.
    RangeIgnored,
    /// Transfer ended cleanly but delivered fewer bytes than expected
    /// (premature EOF). Retryable; the partial keeps what arrived.
    ShortBody { expected: u64, received: u64 },
    /// Completed transfer does not match the manifest size.
    SizeMismatch { expected: u64, observed: u64 },
    /// Completed transfer does not match the published digest.
    DigestMismatch { expected: String, observed: String },
    /// Disk/storage failure (disk full, permission denied). Not retried.
    Storage(std::io::Error),
    /// The job's cancel signal fired mid-transfer.
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Curl(e) => write!(f, "{}", e),
            FetchError::Http(code) => write!(f, "HTTP {}", code),
            FetchError::RangeIgnored => write!(f, "server ignored range request"),
            FetchError::ShortBody { expected, received } => {
                write!(f, "short body: expected {} bytes, got {}", expected, received)
            }
            FetchError::SizeMismatch { expected, observed } => {
                write!(f, "size mismatch: manifest says {}, disk has {}", expected, observed)
            }
            FetchError::DigestMismatch { expected, observed } => {
                write!(f, "digest mismatch: expected {}, computed {}", expected, observed)
            }
            FetchError::Storage(e) => write!(f, "storage: {}", e),
            FetchError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Curl(e) => Some(e),
            FetchError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<curl::Error> for FetchError {
    fn from(e: curl::Error) -> Self {
        FetchError::Curl(e)
    }
}
