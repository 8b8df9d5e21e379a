// SPDX-License-Identifier: MIT OR Apache-2.0
//! Attempt outcome classification.
//!
//! The AgentLoop's decision logic depends on typed outcomes, not
//! exceptions: each attempt produces an [`AttemptOutcome`] variant and the
//! loop pattern-matches. Classification reads the agent's exit code, its
//! stderr (synthesized from the last message when stderr is empty), and
//! the last-message file.

use ft_core::FailureSubtype;
use regex::Regex;
use std::sync::LazyLock;

/// Prefix marking stderr synthesized from the last-message file.
pub const SYNTHETIC_STDERR_PREFIX: &str = "[synthetic_stderr]";

/// Stderr warning codes promoted to run-fatal `AgentConfigInvalid`.
pub const PROMOTED_WARNING_CODES: &[&str] = &["codex_model_messages_missing"];

static RETRYABLE_CAPACITY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // HTTP 429 with a retry hint.
        r"(?i)\b429\b.*(retry|try again)|(retry|try again).*\b429\b",
        r"(?i)exhausted your capacity quota",
        // Transient DNS trouble presents as capacity, not auth.
        r"NameResolutionError",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("retryable pattern"))
    .collect()
});

static NON_RETRYABLE_CAPACITY_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"(?i)hit your limit.*resets", r"(?i)\b429\b"]
        .iter()
        .map(|p| Regex::new(p).expect("capacity pattern"))
        .collect()
});

static AUTH_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\b401\b", r"\b403\b", r"(?i)unauthorized", r"(?i)invalid api key"]
        .iter()
        .map(|p| Regex::new(p).expect("auth pattern"))
        .collect()
});

/// Typed outcome of a single agent attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Valid report produced.
    Success,
    /// Provider capacity problem; `retryable` controls whether a retry
    /// slot may be spent on it.
    ProviderCapacity {
        /// Whether the stderr matched the retryable pattern set.
        retryable: bool,
        /// The matched signal, for diagnostics.
        signal: String,
    },
    /// Authentication failure. Never consumes a follow-up.
    ProviderAuth {
        /// The matched signal.
        signal: String,
    },
    /// Stderr carried a warning code that preflight only soft-reported.
    AgentConfigInvalid {
        /// The promoted warning code.
        code: String,
    },
    /// The agent produced output that is not a valid report.
    JsonInvalid {
        /// Schema or parse errors.
        errors: Vec<String>,
        /// Whether the agent produced any output at all (empty output
        /// cannot be repaired by a follow-up).
        agent_output_non_empty: bool,
    },
    /// Anything else.
    Other {
        /// Human-readable description.
        message: String,
    },
}

impl AttemptOutcome {
    /// The wire subtype recorded in `agent_attempts.json`.
    pub fn failure_subtype(&self) -> FailureSubtype {
        match self {
            Self::Success => FailureSubtype::None,
            Self::ProviderCapacity { .. } => FailureSubtype::ProviderCapacity,
            Self::ProviderAuth { .. } => FailureSubtype::ProviderAuth,
            Self::AgentConfigInvalid { .. } => FailureSubtype::InvalidAgentConfig,
            Self::JsonInvalid { .. } => FailureSubtype::JsonInvalid,
            Self::Other { .. } => FailureSubtype::Other,
        }
    }
}

/// Synthesize stderr from the last message when the agent left stderr
/// empty, so downstream analysis has a signal to classify.
pub fn effective_stderr(stderr: &str, last_message: &str) -> String {
    if !stderr.trim().is_empty() {
        return stderr.to_string();
    }
    if last_message.trim().is_empty() {
        return String::new();
    }
    format!("{SYNTHETIC_STDERR_PREFIX} {}", last_message.trim())
}

fn first_match(res: &[Regex], text: &str) -> Option<String> {
    res.iter()
        .find_map(|re| re.find(text).map(|m| m.as_str().to_string()))
}

/// Find a promoted warning code in stderr.
pub fn promoted_warning_code(stderr: &str) -> Option<String> {
    PROMOTED_WARNING_CODES
        .iter()
        .find(|code| stderr.contains(**code))
        .map(|code| (*code).to_string())
}

/// Classify a finished attempt.
///
/// `stderr` should already be the effective stderr (synthetic when the
/// process wrote none); `validation_errors` is the report validation result
/// for exit-0 attempts, empty on success.
pub fn classify_attempt(
    exit_code: Option<i32>,
    stderr: &str,
    last_message: &str,
    validation_errors: &[String],
) -> AttemptOutcome {
    if let Some(code) = promoted_warning_code(stderr) {
        return AttemptOutcome::AgentConfigInvalid { code };
    }

    if exit_code == Some(0) && validation_errors.is_empty() {
        return AttemptOutcome::Success;
    }

    if let Some(signal) = first_match(&RETRYABLE_CAPACITY_RES, stderr) {
        return AttemptOutcome::ProviderCapacity {
            retryable: true,
            signal,
        };
    }
    if let Some(signal) = first_match(&NON_RETRYABLE_CAPACITY_RES, stderr) {
        return AttemptOutcome::ProviderCapacity {
            retryable: false,
            signal,
        };
    }

    if last_message.trim().is_empty() {
        if let Some(signal) = first_match(&AUTH_RES, stderr) {
            return AttemptOutcome::ProviderAuth { signal };
        }
    }

    if exit_code == Some(0) {
        return AttemptOutcome::JsonInvalid {
            errors: validation_errors.to_vec(),
            agent_output_non_empty: !last_message.trim().is_empty(),
        };
    }

    AttemptOutcome::Other {
        message: format!(
            "agent exited {} without a recognizable failure signal",
            exit_code.map_or_else(|| "(killed)".to_string(), |c| c.to_string())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exhaustion_is_retryable_capacity() {
        let outcome = classify_attempt(
            Some(1),
            "HTTP 429: you have exhausted your capacity quota",
            "",
            &[],
        );
        assert_eq!(
            outcome,
            AttemptOutcome::ProviderCapacity {
                retryable: true,
                signal: "exhausted your capacity quota".into()
            }
        );
    }

    #[test]
    fn limit_reset_message_is_capacity_but_not_retryable() {
        let stderr = effective_stderr("", "You've hit your limit · resets 4am");
        assert!(stderr.starts_with(SYNTHETIC_STDERR_PREFIX));
        let outcome = classify_attempt(Some(1), &stderr, "You've hit your limit · resets 4am", &[]);
        match outcome {
            AttemptOutcome::ProviderCapacity { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn auth_requires_empty_last_message() {
        let auth = classify_attempt(Some(1), "server said 401 unauthorized", "", &[]);
        assert!(matches!(auth, AttemptOutcome::ProviderAuth { .. }));

        let not_auth = classify_attempt(
            Some(1),
            "server said 401 unauthorized",
            "partial output text",
            &[],
        );
        assert!(matches!(not_auth, AttemptOutcome::Other { .. }));
    }

    #[test]
    fn dns_failure_counts_as_retryable_capacity() {
        let outcome = classify_attempt(
            Some(1),
            "urllib3.exceptions.NameResolutionError: failed to resolve api.example.com",
            "",
            &[],
        );
        assert!(matches!(
            outcome,
            AttemptOutcome::ProviderCapacity { retryable: true, .. }
        ));
    }

    #[test]
    fn warning_code_promotion_beats_everything() {
        let outcome = classify_attempt(
            Some(0),
            "warning: codex_model_messages_missing",
            "{\"ok\": true}",
            &[],
        );
        assert_eq!(
            outcome,
            AttemptOutcome::AgentConfigInvalid {
                code: "codex_model_messages_missing".into()
            }
        );
    }

    #[test]
    fn exit_zero_with_validation_errors_is_json_invalid() {
        let outcome = classify_attempt(
            Some(0),
            "",
            "not valid json",
            &["expected value at line 1".to_string()],
        );
        match outcome {
            AttemptOutcome::JsonInvalid {
                errors,
                agent_output_non_empty,
            } => {
                assert_eq!(errors.len(), 1);
                assert!(agent_output_non_empty);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn empty_output_json_invalid_cannot_follow_up() {
        let outcome =
            classify_attempt(Some(0), "", "", &["empty report".to_string()]);
        match outcome {
            AttemptOutcome::JsonInvalid {
                agent_output_non_empty,
                ..
            } => assert!(!agent_output_non_empty),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn clean_exit_with_valid_report_is_success() {
        assert_eq!(
            classify_attempt(Some(0), "", "{\"ok\": true}", &[]),
            AttemptOutcome::Success
        );
    }

    #[test]
    fn synthetic_stderr_only_when_stderr_empty() {
        assert_eq!(effective_stderr("real stderr", "msg"), "real stderr");
        assert_eq!(effective_stderr("", ""), "");
        assert_eq!(
            effective_stderr("", "last words"),
            "[synthetic_stderr] last words"
        );
    }
}
