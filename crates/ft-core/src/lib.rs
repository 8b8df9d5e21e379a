// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ft-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Content-addressed text capture with head/tail excerpts.
pub mod capture;
/// The canonical event envelope and JSONL plumbing.
pub mod event;
/// Small filesystem helpers (atomic writes, optional JSON reads).
pub mod io;
/// Run, attempt, and error records written into the artifact bundle.
pub mod run;

pub use capture::{ArtifactRef, CaptureResult, TextCapturePolicy, TextExcerpt, capture_text_artifact};
pub use event::{Event, EventKind, iter_events_jsonl, make_event, write_events_jsonl};
pub use run::{
    AttemptRecord, AttemptsDoc, FailureSubtype, RunErrorDoc, RunMeta, RunStatus,
};

/// Schema version stamped into `run_meta.json` and compiled artifacts.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Artifact filenames
// ---------------------------------------------------------------------------

/// Per-run artifact filenames.
///
/// The runner owns a run directory from creation until the first report
/// write; everything downstream (history, atoms, backlog) reads these names
/// and never mutates them.
pub mod artifact {
    /// `{repo_input, agent, persona_id, mission_id, ref?, commit_sha?}`.
    pub const TARGET_REF: &str = "target_ref.json";
    /// Resolved policy plus per-run overrides.
    pub const EFFECTIVE_RUN_SPEC: &str = "effective_run_spec.json";
    /// Persona document as discovered.
    pub const PERSONA_SOURCE: &str = "persona.source.md";
    /// Persona document after `extends` resolution.
    pub const PERSONA_RESOLVED: &str = "persona.resolved.md";
    /// Mission document as discovered.
    pub const MISSION_SOURCE: &str = "mission.source.md";
    /// Mission document after `extends` resolution.
    pub const MISSION_RESOLVED: &str = "mission.resolved.md";
    /// Prompt template before substitution.
    pub const PROMPT_TEMPLATE: &str = "prompt.template.md";
    /// Final composed prompt.
    pub const PROMPT: &str = "prompt.txt";
    /// JSON schema the agent's report must satisfy.
    pub const REPORT_SCHEMA: &str = "report.schema.json";
    /// Agent-native event stream.
    pub const RAW_EVENTS: &str = "raw_events.jsonl";
    /// Canonical normalized event stream.
    pub const NORMALIZED_EVENTS: &str = "normalized_events.jsonl";
    /// Captured agent stderr (may carry a `[synthetic_stderr]` prefix).
    pub const AGENT_STDERR: &str = "agent_stderr.txt";
    /// The agent's final message text.
    pub const AGENT_LAST_MESSAGE: &str = "agent_last_message.txt";
    /// Validated structured report.
    pub const REPORT: &str = "report.json";
    /// Validation errors when the report failed schema validation.
    pub const REPORT_VALIDATION_ERRORS: &str = "report_validation_errors.json";
    /// Rendered markdown view of the report.
    pub const REPORT_MD: &str = "report.md";
    /// Best-effort run metrics.
    pub const METRICS: &str = "metrics.json";
    /// Preflight probe results.
    pub const PREFLIGHT: &str = "preflight.json";
    /// Verification command results (present iff verification ran).
    pub const VERIFICATION: &str = "verification.json";
    /// Attempt history for the agent loop.
    pub const AGENT_ATTEMPTS: &str = "agent_attempts.json";
    /// Wall-clock bounds for the run.
    pub const RUN_META: &str = "run_meta.json";
    /// Terminal error document (absent on success).
    pub const ERROR: &str = "error.json";
    /// Directory holding per-failing-command stdout/stderr captures.
    pub const COMMAND_FAILURES_DIR: &str = "command_failures";
}

/// Format a UTC instant the way artifact timestamps are stored
/// (`2026-01-01T00:00:00Z`).
pub fn utc_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Format a UTC instant as a run timestamp directory name
/// (`20260101T000000Z`).
pub fn timestamp_dirname(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}
