// SPDX-License-Identifier: MIT OR Apache-2.0
//! Verification command gate.
//!
//! After a successful attempt, the run spec's verification commands run in
//! the workspace. A failing command schedules a follow-up (when slots
//! remain); the literal sentinel command `rejected` stops the run
//! immediately with no follow-up.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// The sentinel token: a verification command equal to this string forces
/// `VerificationRejectedSentinel`.
pub const REJECTED_SENTINEL: &str = "rejected";

/// Character budget for stored output tails.
pub const OUTPUT_TAIL_MAX_CHARS: usize = 2_000;

/// Default per-command timeout.
pub const COMMAND_TIMEOUT_SECONDS: f64 = 600.0;

/// One verification command's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCommandResult {
    /// The command as written in the run spec.
    pub command: String,
    /// Exit code (-1 when killed or timed out).
    pub exit_code: i32,
    /// Trailing stdout.
    pub stdout_tail: String,
    /// Trailing stderr.
    pub stderr_tail: String,
    /// Convenience flag (`exit_code == 0`).
    pub passed: bool,
}

/// Contents of `verification.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VerificationDoc {
    /// Per-command results, in plan order. Execution stops at the first
    /// failure.
    pub commands: Vec<VerificationCommandResult>,
    /// Whether every command passed.
    pub passed: bool,
    /// Whether the rejection sentinel was present in the plan.
    pub rejected_sentinel: bool,
}

/// Whether the plan contains the rejection sentinel.
pub fn has_rejected_sentinel(commands: &[String]) -> bool {
    commands.iter().any(|c| c.trim() == REJECTED_SENTINEL)
}

fn tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect()
}

/// Run the verification plan in `workspace`, through `exec_prefix` when
/// sandboxed. Stops at the first failing command; the sentinel check runs
/// before anything executes.
pub async fn run_verification(
    commands: &[String],
    workspace: &Path,
    exec_prefix: &[String],
    env: &BTreeMap<String, String>,
) -> VerificationDoc {
    let mut doc = VerificationDoc {
        rejected_sentinel: has_rejected_sentinel(commands),
        ..VerificationDoc::default()
    };
    if doc.rejected_sentinel {
        return doc;
    }

    for command in commands {
        let mut argv: Vec<String> = exec_prefix.to_vec();
        argv.push("sh".to_string());
        argv.push("-c".to_string());
        argv.push(command.clone());

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if exec_prefix.is_empty() {
            cmd.current_dir(workspace);
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        let result = match tokio::time::timeout(
            Duration::from_secs_f64(COMMAND_TIMEOUT_SECONDS),
            cmd.output(),
        )
        .await
        {
            Err(_) => VerificationCommandResult {
                command: command.clone(),
                exit_code: -1,
                stdout_tail: String::new(),
                stderr_tail: "verification command timed out".to_string(),
                passed: false,
            },
            Ok(Err(e)) => VerificationCommandResult {
                command: command.clone(),
                exit_code: -1,
                stdout_tail: String::new(),
                stderr_tail: format!("failed to spawn: {e}"),
                passed: false,
            },
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                VerificationCommandResult {
                    command: command.clone(),
                    exit_code,
                    stdout_tail: tail(
                        &String::from_utf8_lossy(&output.stdout),
                        OUTPUT_TAIL_MAX_CHARS,
                    ),
                    stderr_tail: tail(
                        &String::from_utf8_lossy(&output.stderr),
                        OUTPUT_TAIL_MAX_CHARS,
                    ),
                    passed: exit_code == 0,
                }
            }
        };

        let passed = result.passed;
        doc.commands.push(result);
        if !passed {
            doc.passed = false;
            return doc;
        }
    }

    doc.passed = true;
    doc
}
