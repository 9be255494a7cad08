//! Durable job/item/file state (SQLite via sqlx).
//!
//! One state file per job, living at the output root. Stores the job config,
//! the item list with resolution status, and per-file progress so that any
//! interruption can be recovered without re-downloading completed bytes.
//! The store is the single source of truth; the work queue is derived from
//! it and never the other way around.

pub mod db;
pub mod files;
pub mod types;


pub use db::StateStore;
pub use types::*;
