// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command-failure artifact capture.
//!
//! Each failing `run_command` gets its own `command_failures/cmd_NN/`
//! directory holding full stdout/stderr plus a small metadata document, and
//! the normalized event references those files through `failure_artifacts`.

use crate::AdapterError;
use ft_core::artifact::COMMAND_FAILURES_DIR;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::Path;

/// Metadata written alongside the captured streams.
#[derive(Debug, Clone, Serialize)]
struct CommandFailureMeta<'a> {
    command: &'a str,
    argv: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<&'a Value>,
}

/// Inputs for one failure capture.
#[derive(Debug, Clone)]
pub struct CommandFailure<'a> {
    /// Display form of the command.
    pub command: &'a str,
    /// Tokenized argv.
    pub argv: &'a [String],
    /// Working directory, when known.
    pub cwd: Option<&'a str>,
    /// Exit code the agent observed.
    pub exit_code: i32,
    /// Full stdout (not excerpted).
    pub stdout_text: &'a str,
    /// Full stderr (not excerpted).
    pub stderr_text: &'a str,
    /// Agent-reported duration payload, passed through untouched.
    pub duration: Option<&'a Value>,
}

/// Write `command_failures/cmd_NN/{command.json,stdout.txt,stderr.txt}` and
/// return the `failure_artifacts` reference map for the event.
pub fn write_command_failure_artifacts(
    run_dir: &Path,
    failure_index: usize,
    failure: &CommandFailure<'_>,
) -> Result<Map<String, Value>, AdapterError> {
    let rel_dir = format!("{COMMAND_FAILURES_DIR}/cmd_{failure_index:02}");
    let dir = run_dir.join(&rel_dir);
    std::fs::create_dir_all(&dir).map_err(|e| AdapterError::io(&dir, e))?;

    let stdout_path = dir.join("stdout.txt");
    std::fs::write(&stdout_path, failure.stdout_text)
        .map_err(|e| AdapterError::io(&stdout_path, e))?;
    let stderr_path = dir.join("stderr.txt");
    std::fs::write(&stderr_path, failure.stderr_text)
        .map_err(|e| AdapterError::io(&stderr_path, e))?;

    let meta = CommandFailureMeta {
        command: failure.command,
        argv: failure.argv,
        cwd: failure.cwd,
        exit_code: failure.exit_code,
        duration: failure.duration,
    };
    let meta_path = dir.join("command.json");
    let body = serde_json::to_string_pretty(&meta)
        .map_err(|e| AdapterError::io(&meta_path, std::io::Error::other(e)))?;
    std::fs::write(&meta_path, body).map_err(|e| AdapterError::io(&meta_path, e))?;

    let mut refs = Map::new();
    refs.insert("dir".to_string(), json!(rel_dir));
    refs.insert("stdout".to_string(), json!(format!("{rel_dir}/stdout.txt")));
    refs.insert("stderr".to_string(), json!(format!("{rel_dir}/stderr.txt")));
    Ok(refs)
}
