//! Archive credentials: `key=value` file with an S3-style key pair.
//!
//! The archive authenticates requests with `Authorization: LOW <access>:<secret>`.
//! Lines starting with `#` and blank lines are ignored; unknown keys are too.

use anyhow::{Context, Result};
use std::path::Path;

/// S3-style key pair loaded from a credentials file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    /// Load credentials from a `key=value` file. Returns an error if either
    /// of `S3_ACCESS_KEY` / `S3_SECRET_KEY` is missing or empty.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read credentials file {}", path.display()))?;
        Self::parse(&data)
            .with_context(|| format!("parse credentials file {}", path.display()))
    }

    pub fn parse(data: &str) -> Result<Self> {
        let mut access = None;
        let mut secret = None;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "S3_ACCESS_KEY" => access = Some(value.to_string()),
                "S3_SECRET_KEY" => secret = Some(value.to_string()),
                _ => {}
            }
        }
        let access_key = access.filter(|s| !s.is_empty()).context("S3_ACCESS_KEY missing")?;
        let secret_key = secret.filter(|s| !s.is_empty()).context("S3_SECRET_KEY missing")?;
        Ok(Self {
            access_key,
            secret_key,
        })
    }

    /// The `Authorization` header value in the archive's documented format.
    pub fn authorization(&self) -> String {
        format!("LOW {}:{}", self.access_key, self.secret_key)
    }
}
