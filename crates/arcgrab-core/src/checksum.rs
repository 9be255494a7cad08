//! MD5 helpers for verify-on-finalize and resume seeding.
//!
//! The archive publishes an MD5 digest per file; transfers hash bytes as
//! they stream, and a resumed transfer re-seeds its hasher from the
//! existing partial once before any new bytes are read.

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Compute the MD5 of a file and return the digest as lowercase hex.
/// Reads in chunks to keep memory use bounded; suitable for large files.
pub fn md5_path(path: &Path) -> Result<String> {
    let (hasher, _) = md5_seed(path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file's current content and return the live hasher plus the byte
/// count, so a resumed transfer can continue the digest where the partial
/// left off.
pub fn md5_seed(path: &Path) -> Result<(Md5, u64)> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut total = 0u64;
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher, total))
}
