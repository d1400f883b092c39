//! Column Name Normalizer - Maps raw header text to safe SQL identifiers

use crate::error::{IngestError, Result};
use std::collections::HashSet;

/// Longest identifier MySQL accepts; PostgreSQL and SQLite allow at least this.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Used when a header contains nothing but punctuation or whitespace.
pub const FALLBACK_NAME: &str = "column";

/// Normalize one header.
///
/// Trims surrounding whitespace, replaces every run of characters outside
/// `[A-Za-z0-9_]` with a single `_`, strips leading/trailing underscores and
/// truncates to [`MAX_IDENTIFIER_LEN`]. The result depends only on `header`.
pub fn normalize_column_name(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_sep = false;

    for c in header.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    // Everything left is ASCII, so byte truncation is a char boundary.
    let mut name = trimmed[..trimmed.len().min(MAX_IDENTIFIER_LEN)].to_string();
    while name.ends_with('_') {
        name.pop();
    }
    name
}

/// Normalize a full header row, refusing to merge columns.
///
/// Identifiers are compared case-insensitively because MySQL column names are.
/// `reserved` holds names already taken by the loader (the synthetic primary key).
pub fn normalize_headers(headers: &[String], reserved: &[&str]) -> Result<Vec<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(headers.len());

    for (idx, header) in headers.iter().enumerate() {
        let name = normalize_column_name(header);
        let key = name.to_ascii_lowercase();

        if let Some(taken) = reserved.iter().find(|r| r.eq_ignore_ascii_case(&name)) {
            return Err(IngestError::SchemaConflict {
                normalized: (*taken).to_string(),
                headers: vec![header.clone()],
            });
        }

        if seen.contains(&key) {
            let clashing = headers[..=idx]
                .iter()
                .filter(|h| normalize_column_name(h).eq_ignore_ascii_case(&name))
                .cloned()
                .collect();
            return Err(IngestError::SchemaConflict {
                normalized: name,
                headers: clashing,
            });
        }

        seen.insert(key);
        names.push(name);
    }

    Ok(names)
}
