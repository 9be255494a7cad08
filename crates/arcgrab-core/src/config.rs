//! Engine configuration: what one bulk-download job looks like.
//!
//! The config is validated on `start`, persisted as JSON inside the job's
//! state file, and reloaded (with optional overrides) on `resume`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

/// Default archive endpoint. Manifest documents live under
/// `<endpoint>/metadata/<identifier>`, file bodies under
/// `<endpoint>/download/<identifier>/<name>`.
pub const DEFAULT_ENDPOINT: &str = "https://archive.org";

/// Hard ceiling on the worker ceiling itself.
pub const MAX_WORKERS: usize = 64;

/// Configuration for one bulk-download job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the item list (plain or delimited; see [`crate::input`]).
    pub items_path: PathBuf,
    /// Directory that receives `<identifier>/<file>` trees and the state file.
    pub output_root: PathBuf,
    /// Archive base URL. Overridable so tests can point at a local server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Maximum concurrent file fetches, in `[1, 64]`.
    #[serde(default = "default_workers")]
    pub worker_ceiling: usize,
    /// Shared bandwidth cap in bytes/sec; 0 means unlimited.
    #[serde(default)]
    pub bandwidth_ceiling_bps: u64,
    /// Skip files that already exist on disk with matching size and digest.
    #[serde(default)]
    pub sync: bool,
    /// Start with one worker and scale with observed server behavior.
    #[serde(default)]
    pub dynamic: bool,
    /// Retain only manifest/metadata files.
    #[serde(default)]
    pub metadata_only: bool,
    /// Retain only files whose name matches this regex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_regex: Option<String>,
    /// Retain only files with one of these extensions (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension_whitelist: Vec<String>,
    /// Optional credentials file (see [`crate::auth`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_path: Option<PathBuf>,
    /// Per-file retry tuning.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_workers() -> usize {
    4
}

impl EngineConfig {
    /// Minimal config with defaults for everything optional.
    pub fn new(items_path: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            items_path: items_path.into(),
            output_root: output_root.into(),
            endpoint: default_endpoint(),
            worker_ceiling: default_workers(),
            bandwidth_ceiling_bps: 0,
            sync: false,
            dynamic: false,
            metadata_only: false,
            name_regex: None,
            extension_whitelist: Vec::new(),
            auth_path: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Validate the config before a job starts.
    ///
    /// Checks the items file is readable, the worker ceiling is in range,
    /// and the name regex compiles. Extension entries are normalized to
    /// lowercase without a leading dot.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.items_path.is_file() {
            return Err(ConfigError::ItemsUnreadable(self.items_path.clone()));
        }
        if self.worker_ceiling < 1 || self.worker_ceiling > MAX_WORKERS {
            return Err(ConfigError::WorkerCeiling(self.worker_ceiling));
        }
        if let Some(pattern) = &self.name_regex {
            regex::Regex::new(pattern)
                .map_err(|e| ConfigError::NameRegex(pattern.clone(), e.to_string()))?;
        }
        if let Some(auth) = &self.auth_path {
            if !auth.is_file() {
                return Err(ConfigError::AuthUnreadable(auth.clone()));
            }
        }
        for ext in &mut self.extension_whitelist {
            *ext = ext.trim_start_matches('.').to_ascii_lowercase();
        }
        Ok(())
    }
}

/// Operator overrides applied when resuming a persisted job.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub worker_ceiling: Option<usize>,
    pub bandwidth_ceiling_bps: Option<u64>,
    pub sync: Option<bool>,
    pub dynamic: Option<bool>,
}

impl Overrides {
    /// Fold the overrides into a persisted config. Filter settings are not
    /// overridable: they define which File rows exist.
    pub fn apply(&self, cfg: &mut EngineConfig) {
        if let Some(w) = self.worker_ceiling {
            cfg.worker_ceiling = w;
        }
        if let Some(b) = self.bandwidth_ceiling_bps {
            cfg.bandwidth_ceiling_bps = b;
        }
        if let Some(s) = self.sync {
            cfg.sync = s;
        }
        if let Some(d) = self.dynamic {
            cfg.dynamic = d;
        }
    }
}

/// Config validation failures; all are fatal before any network or disk work.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("items file is not readable: {0}")]
    ItemsUnreadable(PathBuf),
    #[error("worker ceiling {0} outside [1, 64]")]
    WorkerCeiling(usize),
    #[error("invalid name regex {0:?}: {1}")]
    NameRegex(String, String),
    #[error("credentials file is not readable: {0}")]
    AuthUnreadable(PathBuf),
}

/// Stable job id derived from the output root path: first 16 hex chars of
/// the MD5 of the canonicalized path. Restarts from the same directory map
/// to the same job row.
pub fn job_id_for_root(output_root: &Path) -> String {
    use md5::{Digest, Md5};
    let canonical = output_root
        .canonicalize()
        .unwrap_or_else(|_| output_root.to_path_buf());
    let digest = Md5::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}
