// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-runner
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The per-run state machine: `Acquire → Preflight → Compose → AgentLoop →
//! Verify → Finalize`. Each run owns its artifact directory exclusively
//! until the first report write; every decision the loop makes is recorded
//! in `agent_attempts.json` so the history pipeline can reconstruct what
//! happened without re-running anything.

/// Target acquisition (clone, copy, pip spec).
pub mod acquire;
/// Attempt outcome classification.
pub mod attempt;
/// Run metrics computed from normalized events.
pub mod metrics;
/// The run orchestrator.
pub mod orchestrator;
/// Preflight probes and hard blockers.
pub mod preflight;
/// Prompt composition and follow-up addenda.
pub mod prompt;
/// Python runtime discovery.
pub mod python;
/// Report schema validation.
pub mod report;
/// Verification command gate.
pub mod verify;

use thiserror::Error;

/// Terminal runner failures, serialized into `error.json`.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A hard preflight blocker.
    #[error("preflight failed ({subtype}): {message}")]
    AgentPreflightFailed {
        /// `binary_missing`, `required_command_unavailable`,
        /// `invalid_agent_config`, `policy_block`, `python_unavailable`.
        subtype: String,
        /// Stable machine code, when one applies.
        code: Option<String>,
        /// Human-readable description.
        message: String,
        /// Remediation hint.
        hint: Option<String>,
    },

    /// The agent failed without a more specific classification.
    #[error("agent execution failed ({subtype}): {message}")]
    AgentExecFailed {
        /// `provider_auth`, `provider_capacity`, or `other`.
        subtype: String,
        /// Human-readable description.
        message: String,
        /// Exit code when one was observed.
        exit_code: Option<i32>,
    },

    /// A warning promoted to an error during execution.
    #[error("agent configuration invalid ({code}): {message}")]
    AgentConfigInvalid {
        /// Stable machine code (e.g. `codex_model_messages_missing`).
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// The verification plan carried the rejection sentinel.
    #[error("verification rejected by sentinel: {message}")]
    VerificationRejectedSentinel {
        /// Human-readable description.
        message: String,
    },

    /// Catalog failure surfaced before any agent invocation.
    #[error("catalog error: {0}")]
    Catalog(#[from] ft_catalog::CatalogError),

    /// Target acquisition failure.
    #[error("target acquisition failed: {0}")]
    Acquire(String),

    /// Sandbox failure.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] ft_sandbox::SandboxError),

    /// Filesystem failure while writing run artifacts.
    #[error("runner io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Serialize into the `error.json` document shape.
    pub fn to_error_doc(&self) -> ft_core::RunErrorDoc {
        match self {
            Self::AgentPreflightFailed {
                subtype,
                code,
                message,
                hint,
            } => ft_core::RunErrorDoc {
                error_type: "AgentPreflightFailed".into(),
                subtype: Some(subtype.clone()),
                code: code.clone(),
                hint: hint.clone(),
                message: message.clone(),
                exit_code: None,
            },
            Self::AgentExecFailed {
                subtype,
                message,
                exit_code,
            } => ft_core::RunErrorDoc {
                error_type: "AgentExecFailed".into(),
                subtype: Some(subtype.clone()),
                code: None,
                hint: None,
                message: message.clone(),
                exit_code: *exit_code,
            },
            Self::AgentConfigInvalid { code, message } => ft_core::RunErrorDoc {
                error_type: "AgentConfigInvalid".into(),
                subtype: Some("invalid_agent_config".into()),
                code: Some(code.clone()),
                hint: None,
                message: message.clone(),
                exit_code: None,
            },
            Self::VerificationRejectedSentinel { message } => ft_core::RunErrorDoc {
                error_type: "VerificationRejectedSentinel".into(),
                subtype: None,
                code: None,
                hint: None,
                message: message.clone(),
                exit_code: None,
            },
            Self::Catalog(e) => ft_core::RunErrorDoc {
                error_type: "CatalogError".into(),
                subtype: None,
                code: e.code.clone(),
                hint: None,
                message: e.to_string(),
                exit_code: None,
            },
            other => ft_core::RunErrorDoc {
                error_type: "RunnerError".into(),
                subtype: None,
                code: None,
                hint: None,
                message: other.to_string(),
                exit_code: None,
            },
        }
    }
}
