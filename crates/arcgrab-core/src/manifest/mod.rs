//! Manifest resolution: fetch an item's remote file manifest, filter it,
//! and hand the survivors to the store.
//!
//! The archive serves a JSON metadata document per item at
//! `<endpoint>/metadata/<identifier>`; file bodies live under
//! `<endpoint>/download/<identifier>/<name>`.

pub mod fetch;
pub mod filter;
pub mod parse;

pub use fetch::fetch_manifest;
pub use filter::FileFilter;
pub use parse::{Manifest, ManifestFile};

use anyhow::{Context, Result};
use url::Url;

/// URL of an item's metadata document.
pub fn metadata_url(endpoint: &str, identifier: &str) -> Result<String> {
    let mut url = Url::parse(endpoint).context("parse endpoint URL")?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("endpoint cannot be a base URL: {endpoint}"))?
        .pop_if_empty()
        .push("metadata")
        .push(identifier);
    Ok(url.into())
}

/// URL of one file body. Remote names may contain `/`; each segment is
/// pushed separately so the path keeps its shape while special characters
/// are percent-encoded.
pub fn file_url(endpoint: &str, identifier: &str, name: &str) -> Result<String> {
    let mut url = Url::parse(endpoint).context("parse endpoint URL")?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("endpoint cannot be a base URL: {endpoint}"))?;
        segments.pop_if_empty().push("download").push(identifier);
        segments.extend(name.split('/').filter(|s| !s.is_empty()));
    }
    Ok(url.into())
}

/// Local file name for a remote logical name. The on-disk layout is flat
/// per item, so path separators collapse to `_` (which also neutralizes
/// any `..` segment a hostile manifest could carry).
pub fn local_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}
