// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filesystem helpers shared across the workspace.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Write `value` as pretty-printed JSON, creating parent directories.
pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    body.push('\n');
    std::fs::write(path, body)
}

/// Read and parse a JSON file; `None` when the file is missing or unparseable.
///
/// Downstream readers treat malformed artifacts the same as absent ones so a
/// single corrupt run cannot wedge the pipeline.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Atomically replace `path` with `contents`: write a sibling temp file, then
/// rename over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("write_atomic: path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("write_atomic: path has no file name"))?
        .to_string_lossy()
        .into_owned();
    let tmp = parent.join(format!(".{file_name}.tmp"));
    std::fs::write(&tmp, contents)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
