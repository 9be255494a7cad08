//! Item list parsing: one identifier per line, or delimited text with an
//! `identifier` header column.
//!
//! Plain format: blank lines and `#` comments are ignored. Delimited format
//! is detected by a header row containing a column named `identifier`
//! (comma, semicolon, or tab separated). Identifiers are case-sensitive and
//! deduplicated preserving first-seen order.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// Read and parse an item list file.
pub fn read_items(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read items file {}", path.display()))?;
    parse_items(&data).with_context(|| format!("parse items file {}", path.display()))
}

/// Parse item identifiers from file contents.
pub fn parse_items(data: &str) -> Result<Vec<String>> {
    let mut lines = data.lines();
    let Some(first) = lines.by_ref().find(|l| !skip_line(l)) else {
        bail!("items file contains no identifiers");
    };

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    if let Some((delim, column)) = header_column(first) {
        for line in lines {
            if skip_line(line) {
                continue;
            }
            let Some(field) = line.split(delim).nth(column) else {
                continue;
            };
            push_unique(&mut out, &mut seen, field.trim());
        }
    } else {
        push_unique(&mut out, &mut seen, first.trim());
        for line in lines {
            if skip_line(line) {
                continue;
            }
            push_unique(&mut out, &mut seen, line.trim());
        }
    }

    if out.is_empty() {
        bail!("items file contains no identifiers");
    }
    Ok(out)
}

fn skip_line(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with('#')
}

/// If `line` looks like a delimited header row, return the delimiter and
/// the index of the `identifier` column.
fn header_column(line: &str) -> Option<(char, usize)> {
    for delim in [',', ';', '\t'] {
        if !line.contains(delim) {
            continue;
        }
        let idx = line
            .split(delim)
            .position(|field| field.trim().eq_ignore_ascii_case("identifier"));
        if let Some(idx) = idx {
            return Some((delim, idx));
        }
    }
    None
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, id: &str) {
    if id.is_empty() {
        return;
    }
    if seen.insert(id.to_string()) {
        out.push(id.to_string());
    }
}
