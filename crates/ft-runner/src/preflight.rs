// SPDX-License-Identifier: MIT OR Apache-2.0
//! Preflight probes.
//!
//! Everything that can fail fast before spending an agent invocation:
//! missing binaries, invalid agent config overrides, policy conflicts, and
//! verification plans that need a Python runtime nobody has.

use crate::RunnerError;
use crate::python::{PythonDiscovery, discover_python_runtime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Allowed values for the Codex `model_reasoning_effort` override.
pub const CODEX_REASONING_EFFORTS: &[&str] = &["minimal", "low", "medium", "high"];

/// Warning code emitted when a Codex `personality` override lacks
/// `model_messages`. Soft at preflight; the orchestrator promotes it to a
/// failure when the same code shows up on stderr during execution.
pub const CODEX_MODEL_MESSAGES_MISSING: &str = "codex_model_messages_missing";

/// Agent configuration overrides validated at preflight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfigOverrides {
    /// Codex reasoning effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_reasoning_effort: Option<String>,
    /// Codex personality preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    /// Codex model messages override accompanying a personality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_messages: Option<String>,
    /// Anything else, passed through untouched.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// What preflight must check for one run.
#[derive(Debug, Clone, Default)]
pub struct PreflightSpec {
    /// Agent name (`codex`, `claude`, `gemini`).
    pub agent: String,
    /// Agent binary that must resolve on PATH.
    pub agent_binary: String,
    /// User-supplied commands that must also resolve.
    pub required_commands: Vec<String>,
    /// Agent config overrides to validate.
    pub overrides: AgentConfigOverrides,
    /// Whether the mission needs shell access.
    pub requires_shell: bool,
    /// Whether policy permits shell access.
    pub shell_allowed: bool,
    /// Verification commands (scanned for `pytest` references).
    pub verification_commands: Vec<String>,
    /// Workspace directory (for `.venv` discovery).
    pub workspace_dir: PathBuf,
}

/// One preflight warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightWarning {
    /// Stable machine code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Contents of `preflight.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightDoc {
    /// Agent binary path as resolved on PATH.
    pub agent_binary: Option<String>,
    /// Resolution results for required commands.
    pub required_commands: BTreeMap<String, bool>,
    /// Soft warnings.
    pub warnings: Vec<PreflightWarning>,
    /// Python discovery report, when verification needed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PythonDiscovery>,
}

/// Resolve a binary name against PATH (absolute/relative paths that exist
/// pass through).
pub fn resolve_on_path(binary: &str) -> Option<PathBuf> {
    let direct = Path::new(binary);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{binary}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

/// Validate Codex config overrides. Hard failure on a bad reasoning
/// effort; soft warning on `personality` without `model_messages`.
pub fn validate_codex_overrides(
    overrides: &AgentConfigOverrides,
) -> Result<Vec<PreflightWarning>, RunnerError> {
    if let Some(effort) = &overrides.model_reasoning_effort {
        if !CODEX_REASONING_EFFORTS.contains(&effort.as_str()) {
            return Err(RunnerError::AgentPreflightFailed {
                subtype: "invalid_agent_config".into(),
                code: Some("codex_model_reasoning_effort_invalid".into()),
                message: format!(
                    "model_reasoning_effort must be one of {}; got {effort:?}",
                    CODEX_REASONING_EFFORTS.join(", ")
                ),
                hint: Some("fix the agent config override and re-run".into()),
            });
        }
    }

    let mut warnings = Vec::new();
    if overrides.personality.is_some() && overrides.model_messages.is_none() {
        warnings.push(PreflightWarning {
            code: CODEX_MODEL_MESSAGES_MISSING.into(),
            message: "personality override set without model_messages; codex may reject it"
                .into(),
        });
    }
    Ok(warnings)
}

fn verification_references_pytest(commands: &[String]) -> bool {
    commands.iter().any(|cmd| {
        cmd.contains("pytest") || cmd.contains("python") || cmd.contains("py -m")
    })
}

/// Run all preflight probes; the first hard blocker aborts.
pub async fn run_preflight(spec: &PreflightSpec) -> Result<PreflightDoc, RunnerError> {
    let mut doc = PreflightDoc::default();

    let Some(agent_binary) = resolve_on_path(&spec.agent_binary) else {
        return Err(RunnerError::AgentPreflightFailed {
            subtype: "binary_missing".into(),
            code: None,
            message: format!(
                "agent binary {:?} not found on PATH for agent {:?}",
                spec.agent_binary, spec.agent
            ),
            hint: Some(format!("install {} or adjust PATH", spec.agent_binary)),
        });
    };
    doc.agent_binary = Some(agent_binary.display().to_string());

    for command in &spec.required_commands {
        let found = resolve_on_path(command).is_some();
        doc.required_commands.insert(command.clone(), found);
        if !found {
            return Err(RunnerError::AgentPreflightFailed {
                subtype: "required_command_unavailable".into(),
                code: None,
                message: format!("required preflight command {command:?} not found on PATH"),
                hint: None,
            });
        }
    }

    if spec.agent == "codex" {
        doc.warnings.extend(validate_codex_overrides(&spec.overrides)?);
    }

    if spec.requires_shell && !spec.shell_allowed {
        return Err(RunnerError::AgentPreflightFailed {
            subtype: "policy_block".into(),
            code: None,
            message: "mission requires shell access but policy forbids it".into(),
            hint: Some("relax the policy or pick a shell-free mission".into()),
        });
    }

    if verification_references_pytest(&spec.verification_commands) {
        let discovery = discover_python_runtime(&spec.workspace_dir).await;
        let usable = discovery.selected.is_some();
        doc.python = Some(discovery);
        if !usable {
            return Err(RunnerError::AgentPreflightFailed {
                subtype: "python_unavailable".into(),
                code: None,
                message: "verification plan references pytest but no usable Python runtime \
                          was discovered"
                    .into(),
                hint: Some("set USERTEST_PYTHON to a working interpreter".into()),
            });
        }
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(effort: Option<&str>, personality: Option<&str>) -> AgentConfigOverrides {
        AgentConfigOverrides {
            model_reasoning_effort: effort.map(str::to_string),
            personality: personality.map(str::to_string),
            model_messages: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_efforts_pass_and_invalid_fail_with_code() {
        for effort in CODEX_REASONING_EFFORTS {
            assert!(validate_codex_overrides(&overrides(Some(effort), None)).is_ok());
        }
        let err = validate_codex_overrides(&overrides(Some("extreme"), None)).unwrap_err();
        match err {
            RunnerError::AgentPreflightFailed { subtype, code, .. } => {
                assert_eq!(subtype, "invalid_agent_config");
                assert_eq!(code.as_deref(), Some("codex_model_reasoning_effort_invalid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn personality_without_model_messages_is_a_soft_warning() {
        let warnings =
            validate_codex_overrides(&overrides(None, Some("terse"))).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, CODEX_MODEL_MESSAGES_MISSING);
    }

    #[tokio::test]
    async fn missing_agent_binary_is_a_hard_block() {
        let spec = PreflightSpec {
            agent: "codex".into(),
            agent_binary: "definitely-not-a-real-agent-binary".into(),
            ..PreflightSpec::default()
        };
        let err = run_preflight(&spec).await.unwrap_err();
        match err {
            RunnerError::AgentPreflightFailed { subtype, .. } => {
                assert_eq!(subtype, "binary_missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn shell_policy_conflict_blocks() {
        let spec = PreflightSpec {
            agent: "claude".into(),
            agent_binary: "sh".into(),
            requires_shell: true,
            shell_allowed: false,
            ..PreflightSpec::default()
        };
        let err = run_preflight(&spec).await.unwrap_err();
        match err {
            RunnerError::AgentPreflightFailed { subtype, .. } => {
                assert_eq!(subtype, "policy_block");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_required_command_blocks_with_resolution_map() {
        let spec = PreflightSpec {
            agent: "claude".into(),
            agent_binary: "sh".into(),
            required_commands: vec!["no-such-preflight-command".into()],
            shell_allowed: true,
            ..PreflightSpec::default()
        };
        let err = run_preflight(&spec).await.unwrap_err();
        match err {
            RunnerError::AgentPreflightFailed { subtype, message, .. } => {
                assert_eq!(subtype, "required_command_unavailable");
                assert!(message.contains("no-such-preflight-command"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pytest_detection_in_verification_commands() {
        assert!(verification_references_pytest(&["python -m pytest -q".into()]));
        assert!(!verification_references_pytest(&["cargo test".into()]));
    }
}
