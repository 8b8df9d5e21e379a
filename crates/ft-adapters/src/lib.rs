// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-adapters
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Translates agent-native event streams (Codex, Claude, Gemini) into the
//! canonical [`ft_core::Event`] model. Adapters are line-oriented: each raw
//! JSONL line maps to zero or more normalized events, in order. Non-JSON
//! lines are preserved as `error{category:"raw_non_json_line"}` events so
//! nothing the agent emitted is silently dropped.

/// Claude stream normalizer (`tool_use` / `tool_result` joining).
pub mod claude;
/// Codex stream normalizer (exec begin/end pairs and `item.completed`).
pub mod codex;
/// Shell-command tokenization, wrapper unwrapping, and reassembly.
pub mod command;
/// Output excerpting shared by all adapters.
pub mod excerpt;
/// Per-failing-command artifact capture.
pub mod failure;
/// Gemini stream normalizer (tool-name normalization).
pub mod gemini;
/// Sandbox-mount and Windows path mapping.
pub mod paths;

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by stream normalization.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Raw or normalized stream could not be read or written.
    #[error("adapter io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl AdapterError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Shared context for a normalization pass.
///
/// `workspace_mount` is the container-side mount point (e.g. `/workspace`);
/// when present together with `workspace_root`, sandbox paths in agent
/// events are rewritten back to host paths.
#[derive(Debug, Clone, Default)]
pub struct AdapterContext {
    /// Host workspace root the agent operated on.
    pub workspace_root: Option<PathBuf>,
    /// Container-side workspace mount point, when sandboxed.
    pub workspace_mount: Option<String>,
}

pub(crate) fn read_raw_lines(
    path: &std::path::Path,
) -> Result<Vec<(String, Option<serde_json::Value>)>, AdapterError> {
    let text = std::fs::read_to_string(path).map_err(|e| AdapterError::io(path, e))?;
    let mut out = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<serde_json::Value>(line).ok();
        out.push((line.to_string(), parsed));
    }
    Ok(out)
}
