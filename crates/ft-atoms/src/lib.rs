// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-atoms
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Converts run records into typed evidence "atoms". Each atom is one
//! observation from one run (a confusion point, a failed command, a run
//! failure), identified as `<run_rel>:<source>:<index>` and carrying
//! enough text and attachments for the triage engine to cluster it.

use ft_core::RunStatus;
use ft_core::capture::{TextCapturePolicy, capture_text_artifact};
use ft_history::RunRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

/// Atom sources, in extraction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomSource {
    /// `report.confusion_points[].summary` (high severity).
    ConfusionPoint,
    /// `report.suggested_changes[].change` (severity by priority).
    SuggestedChange,
    /// `report.confidence_signals.missing[]` (low severity).
    ConfidenceMissing,
    /// Any run with error/validation status (high severity). Preferred
    /// over emitting raw `error_json` duplicates.
    RunFailureEvent,
    /// Per-command failures from metrics (medium severity).
    CommandFailure,
    /// Known-warning stderr lines (low severity).
    CapabilityWarningArtifact,
    /// Residual stderr on failed runs (medium severity).
    AgentStderrArtifact,
    /// Informational last-message capture (low severity).
    AgentLastMessageArtifact,
    /// Synthetic aggregate produced across many runs.
    Aggregate,
}

impl AtomSource {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfusionPoint => "confusion_point",
            Self::SuggestedChange => "suggested_change",
            Self::ConfidenceMissing => "confidence_missing",
            Self::RunFailureEvent => "run_failure_event",
            Self::CommandFailure => "command_failure",
            Self::CapabilityWarningArtifact => "capability_warning_artifact",
            Self::AgentStderrArtifact => "agent_stderr_artifact",
            Self::AgentLastMessageArtifact => "agent_last_message_artifact",
            Self::Aggregate => "aggregate",
        }
    }
}

/// Severity hint carried by every atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Recurrent or blocking.
    High,
}

impl Severity {
    /// Parse a report `priority` value; unknown values read as medium.
    pub fn from_priority(priority: Option<&str>) -> Self {
        match priority.map(str::to_lowercase).as_deref() {
            Some("low") => Self::Low,
            Some("high") | Some("critical") => Self::High,
            _ => Self::Medium,
        }
    }
}

/// Attachment: an artifact reference plus its inline excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomAttachment {
    /// Reference to the captured artifact.
    pub artifact_ref: ft_core::ArtifactRef,
    /// Head/tail excerpt, when the artifact was text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// One piece of typed evidence from one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// `<run_rel>:<source>:<index>`; globally unique within a compiled
    /// bundle.
    pub atom_id: String,
    /// Run directory relative to the runs root.
    pub run_rel: String,
    /// Agent that produced the run.
    pub agent: String,
    /// Mission id, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    /// Repo input, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_input: Option<String>,
    /// Atom source.
    pub source: AtomSource,
    /// Severity hint.
    pub severity_hint: Severity,
    /// Primary text used for clustering.
    pub text: String,
    /// Supporting evidence (e.g. command output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Path-like location the atom refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Captured artifact attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AtomAttachment>,
    /// Aggregate kind for synthetic atoms (`baseline`, `workflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_kind: Option<String>,
}

static CAPABILITY_WARNING_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "shell_snapshot_powershell_unsupported",
            r"(?i)shell snapshot.*powershell.*unsupported|shell_snapshot_powershell_unsupported",
        ),
        (
            "web_tool_disabled",
            r"(?i)web (?:search|tool) (?:is )?disabled",
        ),
        (
            "sandbox_network_disabled",
            r"(?i)network (?:access )?(?:is )?disabled in sandbox",
        ),
    ]
    .map(|(code, pattern)| (code, Regex::new(pattern).expect("warning regex")))
    .into_iter()
    .collect()
});

struct AtomBuilder<'a> {
    record: &'a RunRecord,
    counters: BTreeMap<&'static str, usize>,
    atoms: Vec<Atom>,
}

impl<'a> AtomBuilder<'a> {
    fn new(record: &'a RunRecord) -> Self {
        Self {
            record,
            counters: BTreeMap::new(),
            atoms: Vec::new(),
        }
    }

    fn push(
        &mut self,
        source: AtomSource,
        severity: Severity,
        text: String,
        evidence: Option<String>,
        attachments: Vec<AtomAttachment>,
    ) {
        let index = self.counters.entry(source.as_str()).or_insert(0);
        let atom_id = format!("{}:{}:{}", self.record.run_rel, source.as_str(), index);
        *index += 1;

        let target_ref = self.record.target_ref.as_ref();
        self.atoms.push(Atom {
            atom_id,
            run_rel: self.record.run_rel.clone(),
            agent: self.record.agent.clone(),
            mission_id: target_ref
                .and_then(|t| t.get("mission_id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            repo_input: target_ref
                .and_then(|t| t.get("repo_input"))
                .and_then(Value::as_str)
                .map(str::to_string),
            source,
            severity_hint: severity,
            text,
            evidence,
            location: None,
            attachments,
            aggregate_kind: None,
        });
    }
}

fn capture_attachment(run_dir: &Path, rel: &str) -> Option<AtomAttachment> {
    let result = capture_text_artifact(
        &run_dir.join(rel),
        &TextCapturePolicy::default(),
        run_dir,
    );
    if !result.artifact.exists {
        return None;
    }
    Some(AtomAttachment {
        excerpt: result.excerpt.as_ref().map(|e| e.composed()),
        artifact_ref: result.artifact,
    })
}

fn report_str_items<'a>(report: &'a Value, field: &str, key: &str) -> Vec<(&'a str, Option<&'a str>)> {
    report
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let text = item
                        .get(key)
                        .and_then(Value::as_str)
                        .or_else(|| item.as_str())?;
                    let priority = item.get("priority").and_then(Value::as_str);
                    Some((text, priority))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Extract all atoms from one run record.
pub fn extract_atoms(record: &RunRecord) -> Vec<Atom> {
    let mut builder = AtomBuilder::new(record);
    let run_dir = Path::new(&record.run_dir);

    if let Some(report) = &record.report {
        for (text, _) in report_str_items(report, "confusion_points", "summary") {
            builder.push(
                AtomSource::ConfusionPoint,
                Severity::High,
                text.to_string(),
                None,
                Vec::new(),
            );
        }
        for (text, priority) in report_str_items(report, "suggested_changes", "change") {
            builder.push(
                AtomSource::SuggestedChange,
                Severity::from_priority(priority),
                text.to_string(),
                None,
                Vec::new(),
            );
        }
        if let Some(missing) = report
            .get("confidence_signals")
            .and_then(|cs| cs.get("missing"))
            .and_then(Value::as_array)
        {
            for item in missing.iter().filter_map(Value::as_str) {
                builder.push(
                    AtomSource::ConfidenceMissing,
                    Severity::Low,
                    item.to_string(),
                    None,
                    Vec::new(),
                );
            }
        }
    }

    // A failed run is one atom, preferred over separate error_json /
    // report_validation_error duplicates.
    if matches!(
        record.status,
        RunStatus::Error | RunStatus::ReportValidationError
    ) {
        let text = match (&record.error, &record.report_validation_errors) {
            (Some(error), _) => {
                let error_type = error
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let subtype = error.get("subtype").and_then(Value::as_str);
                let message = error.get("message").and_then(Value::as_str).unwrap_or("");
                match subtype {
                    Some(subtype) => format!("run failed: {error_type}/{subtype}: {message}"),
                    None => format!("run failed: {error_type}: {message}"),
                }
            }
            (None, Some(errors)) => {
                format!(
                    "run failed report validation: {}",
                    serde_json::to_string(errors).unwrap_or_default()
                )
            }
            (None, None) => "run failed".to_string(),
        };
        let attachments = capture_attachment(run_dir, ft_core::artifact::AGENT_STDERR)
            .into_iter()
            .collect();
        builder.push(
            AtomSource::RunFailureEvent,
            Severity::High,
            text,
            None,
            attachments,
        );
    }

    if let Some(failed) = record
        .metrics
        .as_ref()
        .and_then(|m| m.get("failed_commands"))
        .and_then(Value::as_array)
    {
        for failure in failed {
            let command = failure
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or("");
            let exit_code = failure
                .get("exit_code")
                .and_then(Value::as_i64)
                .unwrap_or(-1);
            if command.is_empty() {
                continue;
            }
            let evidence = failure
                .get("output_excerpt")
                .and_then(Value::as_str)
                .map(str::to_string);
            builder.push(
                AtomSource::CommandFailure,
                Severity::Medium,
                format!("command failed (exit {exit_code}): {command}"),
                evidence,
                Vec::new(),
            );
        }
    }

    // Stderr triage: known warnings become low-severity atoms; whatever
    // stderr remains on a failed run becomes a medium one.
    let stderr_text = std::fs::read_to_string(run_dir.join(ft_core::artifact::AGENT_STDERR))
        .unwrap_or_default();
    let mut warning_matched = false;
    for (code, pattern) in CAPABILITY_WARNING_RES.iter() {
        if pattern.is_match(&stderr_text) {
            warning_matched = true;
            builder.push(
                AtomSource::CapabilityWarningArtifact,
                Severity::Low,
                format!("capability warning: {code}"),
                None,
                capture_attachment(run_dir, ft_core::artifact::AGENT_STDERR)
                    .into_iter()
                    .collect(),
            );
        }
    }
    if !warning_matched && !stderr_text.trim().is_empty() && record.status == RunStatus::Error {
        let first_line = stderr_text.lines().next().unwrap_or("").to_string();
        builder.push(
            AtomSource::AgentStderrArtifact,
            Severity::Medium,
            format!("agent stderr: {first_line}"),
            Some(stderr_text.clone()),
            capture_attachment(run_dir, ft_core::artifact::AGENT_STDERR)
                .into_iter()
                .collect(),
        );
    }

    // Last message is informational; on clean runs with empty stderr it
    // carries nothing the report does not.
    if !(record.status == RunStatus::Ok && stderr_text.trim().is_empty()) {
        if let Some(attachment) =
            capture_attachment(run_dir, ft_core::artifact::AGENT_LAST_MESSAGE)
        {
            if attachment
                .excerpt
                .as_ref()
                .is_some_and(|e| !e.trim().is_empty())
            {
                builder.push(
                    AtomSource::AgentLastMessageArtifact,
                    Severity::Low,
                    "agent final message".to_string(),
                    None,
                    vec![attachment],
                );
            }
        }
    }

    builder.atoms
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Synthetic aggregate atoms computed across a whole record set.
pub fn build_aggregate_atoms(records: &[RunRecord], atoms: &[Atom]) -> Vec<Atom> {
    if records.is_empty() {
        return Vec::new();
    }

    let total = records.len();
    let failed = records
        .iter()
        .filter(|r| {
            matches!(
                r.status,
                RunStatus::Error | RunStatus::ReportValidationError
            )
        })
        .count();
    let failure_rate = failed as f64 / total as f64;

    let mut command_counts: BTreeMap<String, usize> = BTreeMap::new();
    for atom in atoms {
        if atom.source == AtomSource::CommandFailure {
            let command = atom
                .text
                .split_once(": ")
                .map(|(_, cmd)| cmd.to_string())
                .unwrap_or_else(|| atom.text.clone());
            *command_counts.entry(command).or_insert(0) += 1;
        }
    }
    let mut top_commands: Vec<(String, usize)> = command_counts.into_iter().collect();
    top_commands.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top_commands.truncate(5);

    let target_slug = records[0].target_slug.clone();
    let baseline_text = format!(
        "baseline: {failed}/{total} runs failed ({:.0}% failure rate) for target {target_slug}",
        failure_rate * 100.0
    );
    let workflow_text = if top_commands.is_empty() {
        format!("workflow: no recurrent command failures across {total} runs")
    } else {
        let rendered: Vec<String> = top_commands
            .iter()
            .map(|(cmd, count)| format!("{cmd} ({count}x)"))
            .collect();
        format!("workflow: top failed commands: {}", rendered.join(", "))
    };

    let severity = if failure_rate >= 0.5 {
        Severity::High
    } else if failure_rate > 0.0 {
        Severity::Medium
    } else {
        Severity::Low
    };

    vec![
        Atom {
            atom_id: format!("{target_slug}/_aggregate:aggregate:0"),
            run_rel: format!("{target_slug}/_aggregate"),
            agent: "all".to_string(),
            mission_id: None,
            repo_input: None,
            source: AtomSource::Aggregate,
            severity_hint: severity,
            text: baseline_text,
            evidence: None,
            location: None,
            attachments: Vec::new(),
            aggregate_kind: Some("baseline".to_string()),
        },
        Atom {
            atom_id: format!("{target_slug}/_aggregate:aggregate:1"),
            run_rel: format!("{target_slug}/_aggregate"),
            agent: "all".to_string(),
            mission_id: None,
            repo_input: None,
            source: AtomSource::Aggregate,
            severity_hint: Severity::Low,
            text: workflow_text,
            evidence: None,
            location: None,
            attachments: Vec::new(),
            aggregate_kind: Some("workflow".to_string()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(status: RunStatus, report: Option<Value>) -> RunRecord {
        RunRecord {
            run_dir: "/nonexistent".to_string(),
            run_rel: "demo/20260101T000000Z/codex/0".to_string(),
            target_slug: "demo".to_string(),
            timestamp_dir: "20260101T000000Z".to_string(),
            timestamp_utc: Some("2026-01-01T00:00:00Z".to_string()),
            agent: "codex".to_string(),
            seed: "0".to_string(),
            status,
            agent_exit_code: None,
            target_ref: Some(json!({
                "repo_input": "/src/demo",
                "mission_id": "explore"
            })),
            effective_run_spec: None,
            report,
            metrics: None,
            preflight: None,
            error: None,
            report_validation_errors: None,
            embedded: serde_json::Map::new(),
            embedded_capture_manifest: serde_json::Map::new(),
        }
    }

    #[test]
    fn confusion_points_become_high_severity_atoms() {
        let atoms = extract_atoms(&record(
            RunStatus::Ok,
            Some(json!({
                "confusion_points": [
                    {"summary": "what does seed mean?"},
                    {"summary": "which config wins?"}
                ]
            })),
        ));
        let confusion: Vec<&Atom> = atoms
            .iter()
            .filter(|a| a.source == AtomSource::ConfusionPoint)
            .collect();
        assert_eq!(confusion.len(), 2);
        assert_eq!(confusion[0].severity_hint, Severity::High);
        assert_eq!(
            confusion[0].atom_id,
            "demo/20260101T000000Z/codex/0:confusion_point:0"
        );
        assert_eq!(
            confusion[1].atom_id,
            "demo/20260101T000000Z/codex/0:confusion_point:1"
        );
        assert_eq!(confusion[0].mission_id.as_deref(), Some("explore"));
    }

    #[test]
    fn suggested_change_severity_follows_priority() {
        let atoms = extract_atoms(&record(
            RunStatus::Ok,
            Some(json!({
                "suggested_changes": [
                    {"change": "fix readme", "priority": "low"},
                    {"change": "fix api", "priority": "high"},
                    {"change": "fix docs"}
                ]
            })),
        ));
        let severities: Vec<Severity> = atoms
            .iter()
            .filter(|a| a.source == AtomSource::SuggestedChange)
            .map(|a| a.severity_hint)
            .collect();
        assert_eq!(severities, vec![Severity::Low, Severity::High, Severity::Medium]);
    }

    #[test]
    fn failed_run_emits_one_run_failure_event() {
        let mut rec = record(RunStatus::Error, None);
        rec.error = Some(json!({
            "type": "AgentExecFailed",
            "subtype": "provider_capacity",
            "message": "quota exhausted"
        }));
        let atoms = extract_atoms(&rec);
        let failures: Vec<&Atom> = atoms
            .iter()
            .filter(|a| a.source == AtomSource::RunFailureEvent)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].severity_hint, Severity::High);
        assert!(failures[0].text.contains("provider_capacity"));
    }

    #[test]
    fn command_failures_come_from_metrics() {
        let mut rec = record(RunStatus::Ok, Some(json!({})));
        rec.metrics = Some(json!({
            "failed_commands": [
                {"command": "pytest -q", "exit_code": 2, "output_excerpt": "2 failed"}
            ]
        }));
        let atoms = extract_atoms(&rec);
        let failures: Vec<&Atom> = atoms
            .iter()
            .filter(|a| a.source == AtomSource::CommandFailure)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].severity_hint, Severity::Medium);
        assert!(failures[0].text.contains("pytest -q"));
        assert_eq!(failures[0].evidence.as_deref(), Some("2 failed"));
    }

    #[test]
    fn stderr_warning_and_residual_stderr_atoms() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("agent_stderr.txt"),
            "shell_snapshot_powershell_unsupported on this host\n",
        )
        .unwrap();
        let mut rec = record(RunStatus::Error, None);
        rec.run_dir = dir.path().display().to_string();
        rec.error = Some(json!({"type": "AgentExecFailed", "message": "boom"}));

        let atoms = extract_atoms(&rec);
        assert!(
            atoms
                .iter()
                .any(|a| a.source == AtomSource::CapabilityWarningArtifact)
        );
        // A matched warning suppresses the residual stderr atom.
        assert!(
            !atoms
                .iter()
                .any(|a| a.source == AtomSource::AgentStderrArtifact)
        );
    }

    #[test]
    fn residual_stderr_only_on_error_runs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent_stderr.txt"), "stack trace here\n").unwrap();

        let mut ok_rec = record(RunStatus::Ok, Some(json!({})));
        ok_rec.run_dir = dir.path().display().to_string();
        assert!(
            !extract_atoms(&ok_rec)
                .iter()
                .any(|a| a.source == AtomSource::AgentStderrArtifact)
        );

        let mut err_rec = record(RunStatus::Error, None);
        err_rec.run_dir = dir.path().display().to_string();
        err_rec.error = Some(json!({"type": "AgentExecFailed", "message": "x"}));
        let atoms = extract_atoms(&err_rec);
        let stderr_atoms: Vec<&Atom> = atoms
            .iter()
            .filter(|a| a.source == AtomSource::AgentStderrArtifact)
            .collect();
        assert_eq!(stderr_atoms.len(), 1);
        assert!(!stderr_atoms[0].attachments.is_empty());
    }

    #[test]
    fn aggregates_summarize_failure_rate_and_commands() {
        let records = vec![
            record(RunStatus::Ok, Some(json!({}))),
            record(RunStatus::Error, None),
        ];
        let atoms = vec![Atom {
            atom_id: "demo/r:command_failure:0".into(),
            run_rel: "demo/r".into(),
            agent: "codex".into(),
            mission_id: None,
            repo_input: None,
            source: AtomSource::CommandFailure,
            severity_hint: Severity::Medium,
            text: "command failed (exit 2): pytest -q".into(),
            evidence: None,
            location: None,
            attachments: Vec::new(),
            aggregate_kind: None,
        }];

        let aggregates = build_aggregate_atoms(&records, &atoms);
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].aggregate_kind.as_deref(), Some("baseline"));
        assert!(aggregates[0].text.contains("1/2 runs failed"));
        assert_eq!(aggregates[0].severity_hint, Severity::High);
        assert_eq!(aggregates[1].aggregate_kind.as_deref(), Some("workflow"));
        assert!(aggregates[1].text.contains("pytest -q (1x)"));
    }

    #[test]
    fn atom_ids_are_unique_within_a_record() {
        let atoms = extract_atoms(&record(
            RunStatus::Ok,
            Some(json!({
                "confusion_points": [{"summary": "a"}, {"summary": "b"}],
                "suggested_changes": [{"change": "c"}],
                "confidence_signals": {"missing": ["d", "e"]}
            })),
        ));
        let mut ids: Vec<&String> = atoms.iter().map(|a| &a.atom_id).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }
}
