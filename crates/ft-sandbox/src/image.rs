// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed image identity.
//!
//! The image tag is `<repo>:<first12(sha256(dockerfile_bytes ||
//! ordered_hash(context_tree)))>` so an unchanged context reuses the
//! locally cached image and any content change produces a new tag.

use crate::SandboxError;
use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

/// Hash the build context tree: sorted relative paths and file contents.
pub fn ordered_context_hash(context_dir: &Path) -> Result<String, SandboxError> {
    let mut entries: Vec<(String, std::path::PathBuf)> = Vec::new();
    for entry in WalkDir::new(context_dir).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Overlay(format!(
            "context walk failed under {}: {e}",
            context_dir.display()
        )))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(context_dir)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        entries.push((rel, entry.path().to_path_buf()));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (rel, path) in entries {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        let bytes = std::fs::read(&path).map_err(|e| SandboxError::io(&path, e))?;
        hasher.update(&bytes);
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the content-addressed tag for a dockerfile + context pair.
pub fn image_tag(
    repo: &str,
    dockerfile: &Path,
    context_dir: &Path,
) -> Result<String, SandboxError> {
    let dockerfile_bytes =
        std::fs::read(dockerfile).map_err(|e| SandboxError::io(dockerfile, e))?;
    let tree_hash = ordered_context_hash(context_dir)?;

    let mut hasher = Sha256::new();
    hasher.update(&dockerfile_bytes);
    hasher.update(tree_hash.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(format!("{repo}:{}", &digest[..12]))
}
