// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end AgentLoop tests driven by dummy agent binaries.
//!
//! Each dummy agent is a small shell script that counts its invocations in
//! the workspace, so one script can fail on attempt 1 and succeed on
//! attempt 2. The scripts receive the prompt on stdin and the last-message
//! path as their final argument, like the real agent CLIs.
#![cfg(unix)]

use ft_core::{FailureSubtype, RunErrorDoc, artifact, io::read_json_opt};
use ft_runner::orchestrator::{AgentCommand, RunPolicy, RunSpec, run_once};
use ft_runner::preflight::PreflightDoc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("agent.sh");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn report_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary"],
        "properties": {
            "summary": {"type": "string"},
            "confusion_points": {"type": "array"}
        }
    })
}

fn spec_for(root: &Path, agent_script: &Path, policy: RunPolicy) -> RunSpec {
    let workspace = root.join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    RunSpec {
        run_dir: root.join("run"),
        workspace_dir: workspace,
        agent: "codex".into(),
        agent_command: AgentCommand {
            binary: agent_script.display().to_string(),
            args: Vec::new(),
            last_message_flag: "--output-last-message".into(),
        },
        exec_prefix: Vec::new(),
        workspace_mount: None,
        env: BTreeMap::new(),
        repo_input: "/src/demo".into(),
        commit_sha: Some("deadbeef".into()),
        persona_id: "base_dev".into(),
        persona_source_md: "persona source".into(),
        persona_resolved_md: "persona resolved".into(),
        mission_id: "explore".into(),
        mission_source_md: "mission source".into(),
        mission_resolved_md: "mission resolved".into(),
        prompt_template_md: "{{persona}} {{mission}}".into(),
        prompt: "do the mission".into(),
        report_schema: report_schema(),
        policy,
        preflight: PreflightDoc::default(),
    }
}

fn fast_policy() -> RunPolicy {
    RunPolicy {
        backoff_base_seconds: 0.01,
        backoff_multiplier: 1.0,
        timeout_seconds: 30.0,
        ..RunPolicy::default()
    }
}

/// Common dummy-agent preamble: bump the per-workspace attempt counter and
/// capture the prompt + the last-message output path.
const PREAMBLE: &str = r#"#!/bin/sh
for arg in "$@"; do out="$arg"; done
state=".attempt_count"
n=$(cat "$state" 2>/dev/null || echo 0)
n=$((n+1))
echo "$n" > "$state"
cat > ".prompt_$n"
"#;

#[tokio::test]
async fn capacity_retry_then_success() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
if [ "$n" = "1" ]; then
  echo "HTTP 429: you have exhausted your capacity quota" >&2
  exit 1
fi
printf '{{"summary": "all good", "confusion_points": []}}' > "$out"
echo '{{"msg": {{"type": "agent_message", "message": "done"}}}}'
exit 0
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.attempts.attempts.len(), 2);
    assert_eq!(
        outcome.attempts.attempts[0].failure_subtype,
        FailureSubtype::ProviderCapacity
    );
    assert_eq!(outcome.attempts.rate_limit_retries_used, 1);
    assert!(spec.run_dir.join(artifact::REPORT).exists());
    assert!(!spec.run_dir.join(artifact::ERROR).exists());
}

#[tokio::test]
async fn non_retryable_limit_fails_without_consuming_a_retry() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
printf "You've hit your limit · resets 4am" > "$out"
exit 1
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.attempts.attempts.len(), 1);
    assert_eq!(outcome.attempts.rate_limit_retries_used, 0);

    let error: RunErrorDoc = read_json_opt(&spec.run_dir.join(artifact::ERROR)).unwrap();
    assert_eq!(error.subtype.as_deref(), Some("provider_capacity"));

    let stderr =
        std::fs::read_to_string(spec.run_dir.join(artifact::AGENT_STDERR)).unwrap();
    assert!(stderr.starts_with("[synthetic_stderr]"));
}

#[tokio::test]
async fn invalid_json_recovers_through_followup() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
if [ "$n" = "1" ]; then
  printf 'not valid json\n' > "$out"
  exit 0
fi
printf '{{"summary": "fixed", "confusion_points": []}}' > "$out"
exit 0
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.attempts.attempts.len(), 2);
    assert_eq!(
        outcome.attempts.attempts[0].failure_subtype,
        FailureSubtype::JsonInvalid
    );
    assert_eq!(
        outcome.attempts.attempts[0].followup_reason.as_deref(),
        Some("json_invalid")
    );
    assert!(outcome.attempts.attempts[1].report_validation_errors.is_empty());
    assert_eq!(outcome.attempts.followup_attempts_used, 1);

    let second_prompt =
        std::fs::read_to_string(spec.workspace_dir.join(".prompt_2")).unwrap();
    assert!(second_prompt.contains("Follow-up required."));
    assert!(second_prompt.contains("not valid json"));
    assert!(!spec.run_dir.join(artifact::REPORT_VALIDATION_ERRORS).exists());
}

#[tokio::test]
async fn verification_gate_triggers_followup_until_checks_pass() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
if [ "$n" != "1" ]; then
  touch marker.txt
fi
printf '{{"summary": "attempt %s", "confusion_points": []}}' "$n" > "$out"
exit 0
"#
        ),
    );

    let mut policy = fast_policy();
    policy.verification_commands = vec!["test -f marker.txt".to_string()];
    let spec = spec_for(dir.path(), &script, policy);
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.attempts.attempts.len(), 2);
    assert_eq!(
        outcome.attempts.attempts[0].failure_subtype,
        FailureSubtype::VerificationFailed
    );
    assert_eq!(
        outcome.attempts.attempts[0].followup_reason.as_deref(),
        Some("verification_failed")
    );
    assert!(outcome.attempts.attempts[0].followup_scheduled);
    assert!(spec.run_dir.join(artifact::VERIFICATION).exists());
    assert!(spec.run_dir.join(artifact::REPORT).exists());
}

#[tokio::test]
async fn rejection_sentinel_fails_fast_without_followup() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
printf '{{"summary": "ok", "confusion_points": []}}' > "$out"
exit 0
"#
        ),
    );

    let mut policy = fast_policy();
    policy.verification_commands = vec!["rejected".to_string()];
    let spec = spec_for(dir.path(), &script, policy);
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.attempts.attempts.len(), 1);
    assert_eq!(outcome.attempts.followup_attempts_used, 0);
    assert_eq!(
        outcome.attempts.attempts[0].failure_subtype,
        FailureSubtype::VerificationRejectedSentinel
    );

    let error: RunErrorDoc = read_json_opt(&spec.run_dir.join(artifact::ERROR)).unwrap();
    assert_eq!(error.error_type, "VerificationRejectedSentinel");
}

#[tokio::test]
async fn empty_output_with_auth_stderr_is_provider_auth() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
echo "request failed: 401 unauthorized" >&2
exit 1
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.attempts.attempts.len(), 1);
    assert_eq!(outcome.attempts.followup_attempts_used, 0);
    assert_eq!(
        outcome.attempts.attempts[0].failure_subtype,
        FailureSubtype::ProviderAuth
    );

    let error: RunErrorDoc = read_json_opt(&spec.run_dir.join(artifact::ERROR)).unwrap();
    assert_eq!(error.subtype.as_deref(), Some("provider_auth"));
}

#[tokio::test]
async fn config_warning_on_stderr_is_promoted_to_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
echo "warning: codex_model_messages_missing" >&2
printf '{{"summary": "ok", "confusion_points": []}}' > "$out"
exit 0
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(
        outcome.attempts.attempts[0].failure_subtype,
        FailureSubtype::InvalidAgentConfig
    );
    let error: RunErrorDoc = read_json_opt(&spec.run_dir.join(artifact::ERROR)).unwrap();
    assert_eq!(error.error_type, "AgentConfigInvalid");
    assert_eq!(error.code.as_deref(), Some("codex_model_messages_missing"));
}

#[tokio::test]
async fn retries_only_follow_failures() {
    // Quantified invariant: sum(exit codes of attempts[:-1]) > 0 or there
    // was exactly one attempt.
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
if [ "$n" = "1" ]; then
  echo "429 please retry: exhausted your capacity quota" >&2
  exit 7
fi
printf '{{"summary": "ok", "confusion_points": []}}' > "$out"
exit 0
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();

    let attempts = &outcome.attempts.attempts;
    if attempts.len() > 1 {
        let prior_sum: i32 = attempts[..attempts.len() - 1]
            .iter()
            .map(|a| a.exit_code.unwrap_or(1))
            .sum();
        assert!(prior_sum > 0);
    }
    assert!(
        attempts
            .iter()
            .filter(|a| a.failure_subtype == FailureSubtype::None)
            .count()
            <= 1
    );
}

#[tokio::test]
async fn run_artifacts_are_complete_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        &format!(
            r#"{PREAMBLE}
echo '{{"msg": {{"type": "exec_command_begin", "call_id": "c1", "command": ["ls"], "cwd": "."}}}}'
echo '{{"msg": {{"type": "exec_command_end", "call_id": "c1", "exit_code": 0}}}}'
printf '{{"summary": "ok", "confusion_points": []}}' > "$out"
exit 0
"#
        ),
    );

    let spec = spec_for(dir.path(), &script, fast_policy());
    let outcome = run_once(&spec).await.unwrap();
    assert_eq!(outcome.exit_code, 0);

    for name in [
        artifact::TARGET_REF,
        artifact::EFFECTIVE_RUN_SPEC,
        artifact::PERSONA_SOURCE,
        artifact::PERSONA_RESOLVED,
        artifact::MISSION_SOURCE,
        artifact::MISSION_RESOLVED,
        artifact::PROMPT_TEMPLATE,
        artifact::PROMPT,
        artifact::REPORT_SCHEMA,
        artifact::RAW_EVENTS,
        artifact::NORMALIZED_EVENTS,
        artifact::AGENT_STDERR,
        artifact::AGENT_LAST_MESSAGE,
        artifact::REPORT,
        artifact::REPORT_MD,
        artifact::METRICS,
        artifact::PREFLIGHT,
        artifact::AGENT_ATTEMPTS,
        artifact::RUN_META,
    ] {
        assert!(spec.run_dir.join(name).exists(), "missing artifact {name}");
    }

    let events = ft_core::iter_events_jsonl(
        &spec.run_dir.join(artifact::NORMALIZED_EVENTS),
    )
    .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "run_command");

    let metrics: Value = read_json_opt(&spec.run_dir.join(artifact::METRICS)).unwrap();
    assert_eq!(metrics["commands_total"], 1);
}
