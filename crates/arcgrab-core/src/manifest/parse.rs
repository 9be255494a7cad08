//! Parse the archive's metadata document into a manifest.

use anyhow::{bail, Result};
use serde::de::{self, Deserializer};
use serde::Deserialize;

/// An item's remote file manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Absent for dark or nonexistent items; the archive still answers 200.
    pub files: Option<Vec<ManifestFile>>,
}

/// One manifest entry. The archive serializes sizes inconsistently
/// (number or decimal string), so deserialization accepts both.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    /// Remote size in bytes; 0 = unknown.
    #[serde(default, deserialize_with = "de_size")]
    pub size: u64,
    /// Published MD5 digest, lowercase hex.
    #[serde(default)]
    pub md5: Option<String>,
}

fn de_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeField {
        Num(u64),
        Text(String),
        Null,
    }
    Ok(match SizeField::deserialize(deserializer)? {
        SizeField::Num(n) => n,
        SizeField::Text(s) => s.trim().parse().map_err(de::Error::custom)?,
        SizeField::Null => 0,
    })
}

/// Parse a metadata document body. Fails if the document has no file list
/// (dark item, wrong identifier, or a non-manifest response body).
pub fn parse_manifest(body: &[u8]) -> Result<Vec<ManifestFile>> {
    let manifest: Manifest = serde_json::from_slice(body)?;
    let Some(files) = manifest.files else {
        bail!("metadata document has no file list");
    };
    Ok(files)
}
