// SPDX-License-Identifier: MIT OR Apache-2.0
//! YAML frontmatter splitting for persona/mission documents.

use crate::CatalogError;
use serde_yaml::Mapping;
use std::path::Path;

/// Split a document into its YAML frontmatter mapping and markdown body.
///
/// The document must open with a `---` fence on the first line and carry a
/// closing `---` fence; the body is everything after it, trimmed.
pub fn parse_frontmatter(text: &str, path: &Path) -> Result<(Mapping, String), CatalogError> {
    let mut lines = text.lines();
    match lines.next() {
        Some(first) if first.trim() == "---" => {}
        _ => {
            return Err(CatalogError::invalid(format!(
                "Missing YAML frontmatter in {} (expected leading '---').",
                path.display()
            )));
        }
    }

    let mut fm_lines: Vec<&str> = Vec::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut closed = false;
    for line in lines {
        if !closed && line.trim() == "---" {
            closed = true;
            continue;
        }
        if closed {
            body_lines.push(line);
        } else {
            fm_lines.push(line);
        }
    }
    if !closed {
        return Err(CatalogError::invalid(format!(
            "Unterminated YAML frontmatter in {} (missing closing '---').",
            path.display()
        )));
    }

    let fm_text = fm_lines.join("\n");
    let mapping = if fm_text.trim().is_empty() {
        Mapping::new()
    } else {
        let raw: serde_yaml::Value = serde_yaml::from_str(&fm_text).map_err(|e| {
            CatalogError::invalid(format!(
                "Failed to parse YAML frontmatter in {}: {e}",
                path.display()
            ))
        })?;
        match raw {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => Mapping::new(),
            _ => {
                return Err(CatalogError::invalid(format!(
                    "Expected YAML frontmatter mapping in {}.",
                    path.display()
                )));
            }
        }
    };

    Ok((mapping, body_lines.join("\n").trim().to_string()))
}

/// Fetch a required non-empty string field from frontmatter.
pub fn require_str(fm: &Mapping, field: &str, path: &Path) -> Result<String, CatalogError> {
    match fm.get(field).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(CatalogError::invalid(format!(
            "Missing or invalid {field} in {}.",
            path.display()
        ))),
    }
}

/// Fetch an optional string field; blank values read as absent.
pub fn optional_str(fm: &Mapping, field: &str) -> Option<String> {
    fm.get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Fetch an optional boolean field; a non-boolean value is an error.
pub fn optional_bool(fm: &Mapping, field: &str, path: &Path) -> Result<bool, CatalogError> {
    match fm.get(field) {
        None | Some(serde_yaml::Value::Null) => Ok(false),
        Some(serde_yaml::Value::Bool(b)) => Ok(*b),
        Some(other) => Err(CatalogError::invalid(format!(
            "Expected boolean {field} in {}, got {other:?}.",
            path.display()
        ))),
    }
}

/// Fetch an optional list-of-strings field; blank entries are errors.
pub fn optional_string_list(
    fm: &Mapping,
    field: &str,
    path: &Path,
) -> Result<Vec<String>, CatalogError> {
    match fm.get(field) {
        None | Some(serde_yaml::Value::Null) => Ok(Vec::new()),
        Some(serde_yaml::Value::Sequence(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                match item.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return Err(CatalogError::invalid(format!(
                            "{field}[{idx}] must be a non-empty string in {}.",
                            path.display()
                        )));
                    }
                }
            }
            Ok(out)
        }
        Some(_) => Err(CatalogError::invalid(format!(
            "{field} must be a list in {}.",
            path.display()
        ))),
    }
}
