// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run-level records: attempts, failure classification, terminal errors.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FailureSubtype
// ---------------------------------------------------------------------------

/// Classification of a single agent attempt.
///
/// At most one attempt per run carries [`FailureSubtype::None`]; every retry
/// is preceded by a failing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureSubtype {
    /// The attempt succeeded.
    #[default]
    None,
    /// Rate limit / quota exhaustion reported by the provider.
    ProviderCapacity,
    /// Authentication failure (401/403 with no usable output).
    ProviderAuth,
    /// Agent configuration rejected (e.g. unknown reasoning effort).
    InvalidAgentConfig,
    /// Verification commands failed after the attempt.
    VerificationFailed,
    /// Verification plan contained the rejection sentinel.
    VerificationRejectedSentinel,
    /// The agent's report was not valid JSON or failed schema validation.
    JsonInvalid,
    /// Anything else.
    Other,
}

impl FailureSubtype {
    /// Stable wire string (`snake_case`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ProviderCapacity => "provider_capacity",
            Self::ProviderAuth => "provider_auth",
            Self::InvalidAgentConfig => "invalid_agent_config",
            Self::VerificationFailed => "verification_failed",
            Self::VerificationRejectedSentinel => "verification_rejected_sentinel",
            Self::JsonInvalid => "json_invalid",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureSubtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AttemptRecord
// ---------------------------------------------------------------------------

/// One invocation of the agent binary within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based position in the run's attempt sequence.
    pub attempt_number: u32,
    /// UTC start instant.
    pub attempt_started_utc: String,
    /// UTC finish instant.
    pub attempt_finished_utc: String,
    /// Wall clock for the whole attempt (spawn to classification).
    pub attempt_wall_seconds: f64,
    /// Wall clock spent inside the agent process.
    pub agent_exec_wall_seconds: f64,
    /// Agent process exit code (`None` when the process was cancelled).
    pub exit_code: Option<i32>,
    /// Outcome classification.
    pub failure_subtype: FailureSubtype,
    /// Schema validation errors from this attempt's report, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub report_validation_errors: Vec<String>,
    /// Why a follow-up was scheduled after this attempt, if one was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup_reason: Option<String>,
    /// Whether a follow-up attempt was scheduled.
    #[serde(default)]
    pub followup_scheduled: bool,
}

/// Contents of `agent_attempts.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttemptsDoc {
    /// Totally ordered attempt history.
    pub attempts: Vec<AttemptRecord>,
    /// Rate-limit retry slots consumed.
    pub rate_limit_retries_used: u32,
    /// Follow-up slots consumed.
    pub followup_attempts_used: u32,
}

// ---------------------------------------------------------------------------
// Run meta / status / error
// ---------------------------------------------------------------------------

/// Contents of `run_meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    /// Always [`crate::SCHEMA_VERSION`].
    pub schema_version: u32,
    /// UTC start of the run.
    pub run_started_utc: String,
    /// UTC end of the run.
    pub run_finished_utc: String,
    /// Total wall clock.
    pub run_wall_seconds: f64,
}

/// Derived status of a historical run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A report exists and validated.
    Ok,
    /// No `report.json` and no terminal error.
    MissingReport,
    /// `report_validation_errors.json` exists.
    ReportValidationError,
    /// `error.json` exists.
    Error,
}

impl RunStatus {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MissingReport => "missing_report",
            Self::ReportValidationError => "report_validation_error",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `error.json`: the terminal failure of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunErrorDoc {
    /// Error family (e.g. `AgentPreflightFailed`, `AgentExecFailed`).
    #[serde(rename = "type")]
    pub error_type: String,
    /// Finer classification inside the family.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Stable machine code (e.g. `codex_model_reasoning_effort_invalid`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Operator-facing remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// Agent exit code when one was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_subtype_wire_strings() {
        assert_eq!(
            serde_json::to_string(&FailureSubtype::ProviderCapacity).unwrap(),
            "\"provider_capacity\""
        );
        assert_eq!(
            serde_json::to_string(&FailureSubtype::VerificationRejectedSentinel).unwrap(),
            "\"verification_rejected_sentinel\""
        );
        let back: FailureSubtype = serde_json::from_str("\"json_invalid\"").unwrap();
        assert_eq!(back, FailureSubtype::JsonInvalid);
    }

    #[test]
    fn attempts_doc_serializes_compactly() {
        let doc = AttemptsDoc {
            attempts: vec![AttemptRecord {
                attempt_number: 1,
                attempt_started_utc: "2026-01-01T00:00:00Z".into(),
                attempt_finished_utc: "2026-01-01T00:00:09Z".into(),
                attempt_wall_seconds: 9.0,
                agent_exec_wall_seconds: 8.5,
                exit_code: Some(0),
                failure_subtype: FailureSubtype::None,
                report_validation_errors: Vec::new(),
                followup_reason: None,
                followup_scheduled: false,
            }],
            rate_limit_retries_used: 0,
            followup_attempts_used: 0,
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"failure_subtype\":\"none\""));
        assert!(!json.contains("followup_reason"));
        assert!(!json.contains("report_validation_errors"));
    }

    #[test]
    fn error_doc_omits_absent_fields() {
        let doc = RunErrorDoc {
            error_type: "AgentExecFailed".into(),
            subtype: Some("provider_capacity".into()),
            code: None,
            hint: None,
            message: "limit hit".into(),
            exit_code: Some(1),
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"AgentExecFailed\""));
        assert!(!json.contains("\"code\""));
        assert!(!json.contains("\"hint\""));
    }
}
