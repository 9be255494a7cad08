//! Filter chain applied to manifest entries before they become file rows.
//!
//! Order matters: (1) anti-clutter prefilter, (2) metadata-only whitelist,
//! (3) extension whitelist, (4) name regex. A file dropped here never
//! appears in the state file at all.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::EngineConfig;

/// Well-known incidental names the archive tends to carry.
const CLUTTER_NAMES: &[&str] = &["__ia_thumb.jpg", "Thumbs.db", ".DS_Store", "desktop.ini"];
const CLUTTER_SUFFIXES: &[&str] = &["_itemimage.jpg"];

/// Manifest/descriptive files retained by metadata-only mode.
const METADATA_SUFFIXES: &[&str] = &["_meta.xml", "_files.xml", "_meta.sqlite"];

/// Compiled filter configuration for one job.
pub struct FileFilter {
    metadata_only: bool,
    /// Lowercase, no leading dot. Empty = no extension filtering.
    extensions: Vec<String>,
    name_regex: Option<Regex>,
}

impl FileFilter {
    pub fn from_config(cfg: &EngineConfig) -> Result<Self> {
        let name_regex = cfg
            .name_regex
            .as_deref()
            .map(|p| Regex::new(p).with_context(|| format!("compile name regex {:?}", p)))
            .transpose()?;
        Ok(Self {
            metadata_only: cfg.metadata_only,
            extensions: cfg.extension_whitelist.clone(),
            name_regex,
        })
    }

    /// True if a file with this remote name should be downloaded.
    pub fn matches(&self, name: &str) -> bool {
        if is_clutter(name) {
            return false;
        }
        if self.metadata_only && !is_metadata(name) {
            return false;
        }
        if !self.extensions.is_empty() {
            let Some(ext) = extension(name) else {
                return false;
            };
            if !self.extensions.iter().any(|e| e == &ext) {
                return false;
            }
        }
        if let Some(re) = &self.name_regex {
            if !re.is_match(name) {
                return false;
            }
        }
        true
    }
}

fn is_clutter(name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    CLUTTER_NAMES.contains(&basename)
        || CLUTTER_SUFFIXES.iter().any(|s| basename.ends_with(s))
}

fn is_metadata(name: &str) -> bool {
    METADATA_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Lowercased extension after the final dot, if any.
fn extension(name: &str) -> Option<String> {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let (stem, ext) = basename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
