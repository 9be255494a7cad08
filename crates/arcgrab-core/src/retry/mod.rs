//! Error classification and retry policy for file and manifest fetches.

pub mod classify;
pub mod error;
pub mod policy;

pub use classify::classify;
pub use error::FetchError;
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
