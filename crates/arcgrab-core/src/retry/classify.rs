//! Classify HTTP status and curl errors into retry policy error kinds.

use crate::retry::error::FetchError;
use crate::retry::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        401 | 403 => ErrorKind::Auth,
        404 => ErrorKind::Missing,
        416 => ErrorKind::Restart,
        429 => ErrorKind::Throttled,
        503 => ErrorKind::Overloaded,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Terminal,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Transient;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return ErrorKind::Transient;
    }
    ErrorKind::Terminal
}

/// Classify a fetch error into an ErrorKind.
pub fn classify(e: &FetchError) -> ErrorKind {
    match e {
        FetchError::Curl(ce) => classify_curl_error(ce),
        FetchError::Http(code) => classify_http_status(*code),
        FetchError::RangeIgnored => ErrorKind::Restart,
        FetchError::ShortBody { .. } => ErrorKind::Transient,
        FetchError::SizeMismatch { .. } | FetchError::DigestMismatch { .. } => {
            ErrorKind::Integrity
        }
        FetchError::Storage(_) => ErrorKind::Io,
        FetchError::Cancelled => ErrorKind::Cancelled,
    }
}
