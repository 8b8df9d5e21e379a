// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-run state machine.
//!
//! `Acquire` and `Preflight` happen before this module is entered; here the
//! composed prompt meets the agent binary. The AgentLoop owns bounded
//! retries (provider capacity), bounded follow-ups (invalid reports,
//! failed verification), and the verification gate. Every attempt is
//! recorded; the run directory is complete and self-describing whether the
//! run succeeds or fails.

use crate::RunnerError;
use crate::attempt::{
    AttemptOutcome, classify_attempt, effective_stderr,
};
use crate::metrics::compute_metrics_value;
use crate::preflight::PreflightDoc;
use crate::prompt::{FollowupContext, compose_followup_prompt};
use crate::report::{render_report_markdown, validate_report};
use crate::verify::{REJECTED_SENTINEL, run_verification};
use chrono::Utc;
use ft_adapters::AdapterContext;
use ft_core::{
    AttemptRecord, AttemptsDoc, FailureSubtype, RunMeta, SCHEMA_VERSION, artifact,
    io::{read_json_opt, write_json_pretty},
    utc_timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Stdout sentinel: the agent is asking for an interactive patch approval
/// headless mode cannot answer.
pub const APPLY_PATCH_APPROVAL_SENTINEL: &str = "apply_patch_approval_request";

/// Stderr sentinel: the agent is spinning on a reused refresh token.
pub const REFRESH_TOKEN_REUSED_SENTINEL: &str = "refresh-token-reused";

/// Poll interval for sentinel and deadline checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the agent binary is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Executable name or path.
    pub binary: String,
    /// Fixed arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag used to pass the last-message output path.
    #[serde(default = "default_last_message_flag")]
    pub last_message_flag: String,
}

fn default_last_message_flag() -> String {
    "--output-last-message".to_string()
}

/// Retry, follow-up, and verification policy for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPolicy {
    /// Capacity-retry slots.
    pub rate_limit_retries: u32,
    /// Follow-up slots (invalid report, failed verification).
    pub followup_attempts: u32,
    /// Backoff base in seconds.
    pub backoff_base_seconds: f64,
    /// Backoff multiplier per consumed retry.
    pub backoff_multiplier: f64,
    /// Per-attempt agent timeout in seconds.
    pub timeout_seconds: f64,
    /// Verification plan; empty disables the gate.
    #[serde(default)]
    pub verification_commands: Vec<String>,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            rate_limit_retries: 2,
            followup_attempts: 2,
            backoff_base_seconds: 2.0,
            backoff_multiplier: 2.0,
            timeout_seconds: 3_600.0,
            verification_commands: Vec::new(),
        }
    }
}

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Run artifact directory (created if absent).
    pub run_dir: PathBuf,
    /// Acquired workspace the agent operates on.
    pub workspace_dir: PathBuf,
    /// Agent name (`codex`, `claude`, `gemini`).
    pub agent: String,
    /// How to invoke the agent.
    pub agent_command: AgentCommand,
    /// Argv prefix from the sandbox backend (empty for local).
    pub exec_prefix: Vec<String>,
    /// Container-side workspace mount, when sandboxed.
    pub workspace_mount: Option<String>,
    /// Env for the agent process (local backend only).
    pub env: BTreeMap<String, String>,
    /// Original repo input, recorded into `target_ref.json`.
    pub repo_input: String,
    /// Commit the workspace is at, when known.
    pub commit_sha: Option<String>,
    /// Persona id.
    pub persona_id: String,
    /// Persona document as discovered.
    pub persona_source_md: String,
    /// Persona document after extends resolution.
    pub persona_resolved_md: String,
    /// Mission id.
    pub mission_id: String,
    /// Mission document as discovered.
    pub mission_source_md: String,
    /// Mission document after extends resolution.
    pub mission_resolved_md: String,
    /// Prompt template before substitution.
    pub prompt_template_md: String,
    /// Composed prompt for attempt 1.
    pub prompt: String,
    /// Report schema the agent's output must satisfy.
    pub report_schema: Value,
    /// Retry/follow-up/verification policy.
    pub policy: RunPolicy,
    /// Preflight results to persist alongside the run.
    pub preflight: PreflightDoc,
}

/// Result of [`run_once`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Process-style exit code: 0 on success.
    pub exit_code: i32,
    /// Attempt history as persisted.
    pub attempts: AttemptsDoc,
    /// Whether a validated report was produced.
    pub report_ok: bool,
}

/// Per-attempt agent timeout, honoring the Codex env overrides.
pub fn agent_timeout_seconds(agent: &str, policy: &RunPolicy) -> f64 {
    if agent == "codex" {
        for name in [
            "AGENT_ADAPTERS_CODEX_TIMEOUT_SECONDS",
            "USERTEST_CODEX_TIMEOUT_SECONDS",
        ] {
            if let Ok(raw) = std::env::var(name) {
                if let Ok(value) = raw.trim().parse::<f64>() {
                    if value > 0.0 {
                        return value;
                    }
                }
            }
        }
    }
    policy.timeout_seconds
}

// ---------------------------------------------------------------------------
// Agent invocation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InvokeResult {
    exit_code: Option<i32>,
    agent_wall_seconds: f64,
    cancel_reason: Option<String>,
    stderr: String,
}

async fn kill_sequence(child: &mut tokio::process::Child) {
    // terminate → wait 2 s → kill → wait 5 s
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = tokio::process::Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
}

async fn invoke_agent(
    spec: &RunSpec,
    prompt: &str,
    raw_events_path: &Path,
    last_message_path: &Path,
) -> Result<InvokeResult, RunnerError> {
    let mut argv: Vec<String> = spec.exec_prefix.clone();
    argv.push(spec.agent_command.binary.clone());
    argv.extend(spec.agent_command.args.iter().cloned());
    argv.push(spec.agent_command.last_message_flag.clone());
    argv.push(last_message_path.display().to_string());

    let _ = std::fs::remove_file(last_message_path);

    tracing::info!(agent = %spec.agent, ?argv, "invoking agent");
    let started = Instant::now();

    let mut command = tokio::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if spec.exec_prefix.is_empty() {
        command.current_dir(&spec.workspace_dir);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
    }

    let mut child = command.spawn().map_err(|e| RunnerError::Io {
        path: argv[0].clone(),
        source: e,
    })?;

    // Blocking stdin write: the prompt goes in whole, then stdin closes.
    if let Some(mut stdin) = child.stdin.take() {
        let prompt_bytes = prompt.as_bytes().to_vec();
        tokio::spawn(async move {
            let _ = stdin.write_all(&prompt_bytes).await;
            let _ = stdin.shutdown().await;
        });
    }

    let approval_seen = Arc::new(AtomicBool::new(false));
    let token_reuse_seen = Arc::new(AtomicBool::new(false));

    // Reader task: drain stdout into raw_events.jsonl, watching for the
    // approval sentinel.
    let stdout_task = {
        let stdout = child.stdout.take();
        let raw_events_path = raw_events_path.to_path_buf();
        let approval_seen = Arc::clone(&approval_seen);
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let Ok(mut file) = tokio::fs::File::create(&raw_events_path).await else {
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains(APPLY_PATCH_APPROVAL_SENTINEL) {
                    approval_seen.store(true, Ordering::SeqCst);
                }
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            let _ = file.flush().await;
        })
    };

    let stderr_task = {
        let stderr = child.stderr.take();
        let token_reuse_seen = Arc::clone(&token_reuse_seen);
        tokio::spawn(async move {
            let mut collected = String::new();
            let Some(stderr) = stderr else { return collected };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains(REFRESH_TOKEN_REUSED_SENTINEL) {
                    token_reuse_seen.store(true, Ordering::SeqCst);
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        })
    };

    let timeout = Duration::from_secs_f64(agent_timeout_seconds(&spec.agent, &spec.policy));
    let deadline = started + timeout;

    let mut cancel_reason: Option<String> = None;
    // `Child::wait` is cancel-safe, so re-polling it each iteration while
    // the 50 ms tick checks sentinels and the deadline is sound.
    let exit_code: Option<i32> = loop {
        tokio::select! {
            status = child.wait() => {
                break status.ok().and_then(|s| s.code());
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if approval_seen.load(Ordering::SeqCst) {
                    cancel_reason = Some("apply_patch_approval_request".to_string());
                } else if token_reuse_seen.load(Ordering::SeqCst) {
                    cancel_reason = Some("refresh_token_reused".to_string());
                } else if Instant::now() >= deadline {
                    cancel_reason = Some("timeout".to_string());
                }
                if cancel_reason.is_some() {
                    break None;
                }
            }
        }
    };
    if cancel_reason.is_some() {
        kill_sequence(&mut child).await;
    }

    // The reader is joined with a bound; unread stdout is abandoned.
    let _ = tokio::time::timeout(Duration::from_secs(5), stdout_task).await;
    let stderr = tokio::time::timeout(Duration::from_secs(5), stderr_task)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

    Ok(InvokeResult {
        exit_code,
        agent_wall_seconds: started.elapsed().as_secs_f64(),
        cancel_reason,
        stderr,
    })
}

// ---------------------------------------------------------------------------
// Artifact plumbing
// ---------------------------------------------------------------------------

fn write_text(path: &Path, text: &str) -> Result<(), RunnerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
    }
    std::fs::write(path, text).map_err(|e| RunnerError::io(path, e))
}

fn write_compose_artifacts(spec: &RunSpec) -> Result<(), RunnerError> {
    let dir = &spec.run_dir;
    write_json_pretty(
        &dir.join(artifact::TARGET_REF),
        &serde_json::json!({
            "repo_input": spec.repo_input,
            "agent": spec.agent,
            "persona_id": spec.persona_id,
            "mission_id": spec.mission_id,
            "commit_sha": spec.commit_sha,
        }),
    )
    .map_err(|e| RunnerError::io(dir, e))?;

    write_json_pretty(
        &dir.join(artifact::EFFECTIVE_RUN_SPEC),
        &serde_json::json!({
            "agent": spec.agent,
            "agent_command": spec.agent_command,
            "policy": spec.policy,
            "workspace_mount": spec.workspace_mount,
        }),
    )
    .map_err(|e| RunnerError::io(dir, e))?;

    write_text(&dir.join(artifact::PERSONA_SOURCE), &spec.persona_source_md)?;
    write_text(&dir.join(artifact::PERSONA_RESOLVED), &spec.persona_resolved_md)?;
    write_text(&dir.join(artifact::MISSION_SOURCE), &spec.mission_source_md)?;
    write_text(&dir.join(artifact::MISSION_RESOLVED), &spec.mission_resolved_md)?;
    write_text(&dir.join(artifact::PROMPT_TEMPLATE), &spec.prompt_template_md)?;
    write_text(&dir.join(artifact::PROMPT), &spec.prompt)?;
    write_json_pretty(&dir.join(artifact::REPORT_SCHEMA), &spec.report_schema)
        .map_err(|e| RunnerError::io(dir, e))?;
    write_json_pretty(&dir.join(artifact::PREFLIGHT), &spec.preflight)
        .map_err(|e| RunnerError::io(dir, e))?;
    Ok(())
}

fn normalize_events(spec: &RunSpec) -> Result<(), RunnerError> {
    let raw = spec.run_dir.join(artifact::RAW_EVENTS);
    if !raw.exists() {
        return Ok(());
    }
    let normalized = spec.run_dir.join(artifact::NORMALIZED_EVENTS);
    let ctx = AdapterContext {
        workspace_root: Some(spec.workspace_dir.clone()),
        workspace_mount: spec.workspace_mount.clone(),
    };
    let result = match spec.agent.as_str() {
        "codex" => ft_adapters::codex::normalize_codex_events(&raw, &normalized, &ctx),
        "claude" => ft_adapters::claude::normalize_claude_events(&raw, &normalized, &ctx),
        "gemini" => ft_adapters::gemini::normalize_gemini_events(&raw, &normalized, &ctx),
        other => {
            tracing::warn!(agent = other, "no adapter for agent; skipping normalization");
            return Ok(());
        }
    };
    result.map_err(|e| RunnerError::Io {
        path: normalized.display().to_string(),
        source: std::io::Error::other(e),
    })
}

fn write_metrics(spec: &RunSpec) {
    let normalized = spec.run_dir.join(artifact::NORMALIZED_EVENTS);
    let value = if normalized.exists() {
        compute_metrics_value(
            ft_core::iter_events_jsonl(&normalized).map_err(|e| e.to_string()),
        )
    } else {
        compute_metrics_value(Ok::<_, String>(Vec::new()))
    };
    // Best-effort by contract: a metrics write failure never fails the run.
    if let Err(e) = write_json_pretty(&spec.run_dir.join(artifact::METRICS), &value) {
        tracing::warn!(error = %e, "failed to write metrics.json");
    }
}

// ---------------------------------------------------------------------------
// The AgentLoop
// ---------------------------------------------------------------------------

/// Execute one run end-to-end (post-acquire, post-preflight-spec).
///
/// Returns `Ok` with a non-zero `exit_code` for agent-level failures (those
/// are recorded in the artifact bundle, not raised); `Err` only for
/// infrastructure failures that prevent artifacts from being written.
pub async fn run_once(spec: &RunSpec) -> Result<RunOutcome, RunnerError> {
    let run_started = Utc::now();
    let run_clock = Instant::now();
    std::fs::create_dir_all(&spec.run_dir).map_err(|e| RunnerError::io(&spec.run_dir, e))?;
    write_compose_artifacts(spec)?;

    let raw_events_path = spec.run_dir.join(artifact::RAW_EVENTS);
    let last_message_path = spec.run_dir.join(artifact::AGENT_LAST_MESSAGE);

    let max_attempts = 1 + spec.policy.rate_limit_retries + spec.policy.followup_attempts;
    let mut attempts = AttemptsDoc::default();
    let mut current_prompt = spec.prompt.clone();
    let mut report: Option<Value> = None;
    let mut final_validation_errors: Vec<String> = Vec::new();
    let mut terminal: Option<RunnerError> = None;

    'agent_loop: while (attempts.attempts.len() as u32) < max_attempts {
        let attempt_number = attempts.attempts.len() as u32 + 1;
        let attempt_started = Utc::now();
        let attempt_clock = Instant::now();

        let invoke = invoke_agent(spec, &current_prompt, &raw_events_path, &last_message_path)
            .await?;

        let last_message = std::fs::read_to_string(&last_message_path).unwrap_or_default();
        let stderr = effective_stderr(&invoke.stderr, &last_message);
        write_text(&spec.run_dir.join(artifact::AGENT_STDERR), &stderr)?;
        write_text(&spec.run_dir.join(artifact::AGENT_LAST_MESSAGE), &last_message)?;

        let validation_errors = if invoke.exit_code == Some(0) {
            match validate_report(&last_message, &spec.report_schema) {
                Ok(valid) => {
                    report = Some(valid);
                    Vec::new()
                }
                Err(errors) => errors,
            }
        } else {
            Vec::new()
        };

        let outcome = if let Some(reason) = &invoke.cancel_reason {
            AttemptOutcome::Other {
                message: format!("agent cancelled: {reason}"),
            }
        } else {
            classify_attempt(invoke.exit_code, &stderr, &last_message, &validation_errors)
        };

        let mut record = AttemptRecord {
            attempt_number,
            attempt_started_utc: utc_timestamp(attempt_started),
            attempt_finished_utc: utc_timestamp(Utc::now()),
            attempt_wall_seconds: attempt_clock.elapsed().as_secs_f64(),
            agent_exec_wall_seconds: invoke.agent_wall_seconds,
            exit_code: invoke.exit_code,
            failure_subtype: outcome.failure_subtype(),
            report_validation_errors: validation_errors.clone(),
            followup_reason: None,
            followup_scheduled: false,
        };
        final_validation_errors = validation_errors;

        match outcome {
            AttemptOutcome::Success => {
                if spec.policy.verification_commands.is_empty() {
                    attempts.attempts.push(record);
                    break 'agent_loop;
                }

                let doc = run_verification(
                    &spec.policy.verification_commands,
                    &spec.workspace_dir,
                    &spec.exec_prefix,
                    &spec.env,
                )
                .await;
                write_json_pretty(&spec.run_dir.join(artifact::VERIFICATION), &doc)
                    .map_err(|e| RunnerError::io(&spec.run_dir, e))?;

                if doc.rejected_sentinel {
                    record.failure_subtype = FailureSubtype::VerificationRejectedSentinel;
                    attempts.attempts.push(record);
                    terminal = Some(RunnerError::VerificationRejectedSentinel {
                        message: format!(
                            "verification plan contains the {REJECTED_SENTINEL:?} sentinel"
                        ),
                    });
                    break 'agent_loop;
                }
                if doc.passed {
                    attempts.attempts.push(record);
                    break 'agent_loop;
                }

                if attempts.followup_attempts_used < spec.policy.followup_attempts {
                    attempts.followup_attempts_used += 1;
                    record.failure_subtype = FailureSubtype::VerificationFailed;
                    record.followup_reason = Some("verification_failed".to_string());
                    record.followup_scheduled = true;
                    attempts.attempts.push(record);
                    report = None;

                    let failing = doc
                        .commands
                        .iter()
                        .filter(|c| !c.passed)
                        .map(|c| {
                            (c.command.clone(), c.stdout_tail.clone(), c.stderr_tail.clone())
                        })
                        .collect();
                    current_prompt = compose_followup_prompt(
                        &spec.prompt,
                        &FollowupContext {
                            previous_last_message: last_message.clone(),
                            report_validation_errors: Vec::new(),
                            failing_commands: failing,
                        },
                    );
                    continue 'agent_loop;
                }

                record.failure_subtype = FailureSubtype::VerificationFailed;
                attempts.attempts.push(record);
                terminal = Some(RunnerError::AgentExecFailed {
                    subtype: "verification_failed".to_string(),
                    message: "verification commands still failing after follow-ups".to_string(),
                    exit_code: invoke.exit_code,
                });
                break 'agent_loop;
            }

            AttemptOutcome::ProviderCapacity { retryable, signal } => {
                let retries_left =
                    attempts.rate_limit_retries_used < spec.policy.rate_limit_retries;
                attempts.attempts.push(record);
                if retryable && retries_left {
                    attempts.rate_limit_retries_used += 1;
                    let k = attempts.rate_limit_retries_used - 1;
                    let delay = spec.policy.backoff_base_seconds
                        * spec.policy.backoff_multiplier.powi(k as i32);
                    tracing::warn!(signal, delay, "provider capacity; backing off");
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    // Same prompt, fresh attempt.
                    continue 'agent_loop;
                }
                terminal = Some(RunnerError::AgentExecFailed {
                    subtype: "provider_capacity".to_string(),
                    message: format!("provider capacity failure: {signal}"),
                    exit_code: invoke.exit_code,
                });
                break 'agent_loop;
            }

            AttemptOutcome::ProviderAuth { signal } => {
                attempts.attempts.push(record);
                terminal = Some(RunnerError::AgentExecFailed {
                    subtype: "provider_auth".to_string(),
                    message: format!("provider authentication failure: {signal}"),
                    exit_code: invoke.exit_code,
                });
                break 'agent_loop;
            }

            AttemptOutcome::AgentConfigInvalid { code } => {
                attempts.attempts.push(record);
                report = None;
                terminal = Some(RunnerError::AgentConfigInvalid {
                    message: format!("agent rejected configuration ({code})"),
                    code,
                });
                break 'agent_loop;
            }

            AttemptOutcome::JsonInvalid {
                errors,
                agent_output_non_empty,
            } => {
                let followups_left =
                    attempts.followup_attempts_used < spec.policy.followup_attempts;
                if agent_output_non_empty && followups_left {
                    attempts.followup_attempts_used += 1;
                    record.followup_reason = Some("json_invalid".to_string());
                    record.followup_scheduled = true;
                    attempts.attempts.push(record);
                    current_prompt = compose_followup_prompt(
                        &spec.prompt,
                        &FollowupContext {
                            previous_last_message: last_message.clone(),
                            report_validation_errors: errors,
                            failing_commands: Vec::new(),
                        },
                    );
                    continue 'agent_loop;
                }
                attempts.attempts.push(record);
                break 'agent_loop;
            }

            AttemptOutcome::Other { message } => {
                attempts.attempts.push(record);
                terminal = Some(RunnerError::AgentExecFailed {
                    subtype: "other".to_string(),
                    message,
                    exit_code: invoke.exit_code,
                });
                break 'agent_loop;
            }
        }
    }

    // Finalize: normalized events, metrics, report artifacts, attempt and
    // run metadata, and error.json when the run is terminal.
    normalize_events(spec)?;
    write_metrics(spec);

    let report_ok = report.is_some();
    if let Some(report) = &report {
        write_json_pretty(&spec.run_dir.join(artifact::REPORT), report)
            .map_err(|e| RunnerError::io(&spec.run_dir, e))?;
        write_text(
            &spec.run_dir.join(artifact::REPORT_MD),
            &render_report_markdown(report, &spec.agent, &spec.mission_id),
        )?;
    } else if terminal.is_none() && !final_validation_errors.is_empty() {
        write_json_pretty(
            &spec.run_dir.join(artifact::REPORT_VALIDATION_ERRORS),
            &final_validation_errors,
        )
        .map_err(|e| RunnerError::io(&spec.run_dir, e))?;
    }

    write_json_pretty(&spec.run_dir.join(artifact::AGENT_ATTEMPTS), &attempts)
        .map_err(|e| RunnerError::io(&spec.run_dir, e))?;

    let exit_code = if let Some(error) = &terminal {
        let mut doc = error.to_error_doc();
        if doc.exit_code.is_none() {
            doc.exit_code = attempts.attempts.last().and_then(|a| a.exit_code);
        }
        write_json_pretty(&spec.run_dir.join(artifact::ERROR), &doc)
            .map_err(|e| RunnerError::io(&spec.run_dir, e))?;
        1
    } else if report_ok {
        0
    } else {
        1
    };

    write_json_pretty(
        &spec.run_dir.join(artifact::RUN_META),
        &RunMeta {
            schema_version: SCHEMA_VERSION,
            run_started_utc: utc_timestamp(run_started),
            run_finished_utc: utc_timestamp(Utc::now()),
            run_wall_seconds: run_clock.elapsed().as_secs_f64(),
        },
    )
    .map_err(|e| RunnerError::io(&spec.run_dir, e))?;

    Ok(RunOutcome {
        exit_code,
        attempts,
        report_ok,
    })
}

/// Write `error.json` + `run_meta.json` for failures that happen before
/// the AgentLoop (acquire, preflight, catalog).
pub fn write_early_failure(
    run_dir: &Path,
    error: &RunnerError,
    run_started: chrono::DateTime<Utc>,
) -> Result<(), RunnerError> {
    std::fs::create_dir_all(run_dir).map_err(|e| RunnerError::io(run_dir, e))?;
    write_json_pretty(&run_dir.join(artifact::ERROR), &error.to_error_doc())
        .map_err(|e| RunnerError::io(run_dir, e))?;
    let finished = Utc::now();
    write_json_pretty(
        &run_dir.join(artifact::RUN_META),
        &RunMeta {
            schema_version: SCHEMA_VERSION,
            run_started_utc: utc_timestamp(run_started),
            run_finished_utc: utc_timestamp(finished),
            run_wall_seconds: (finished - run_started)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        },
    )
    .map_err(|e| RunnerError::io(run_dir, e))
}

/// Re-read the persisted attempts document (test and reporting helper).
pub fn read_attempts(run_dir: &Path) -> Option<AttemptsDoc> {
    read_json_opt(&run_dir.join(artifact::AGENT_ATTEMPTS))
}
