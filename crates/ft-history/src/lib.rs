// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-history
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Walks `<runs_dir>/<target_slug>/<timestamp>/<agent>/<seed>/` trees (or a
//! pre-compiled `report_history.jsonl`) and yields uniform run records for
//! the backlog pipeline. Iteration is lazy: directory listings are sorted
//! at yield time and artifacts are parsed one run at a time, so arbitrarily
//! large run trees stay memory-bounded.

use chrono::{TimeZone, Utc};
use ft_core::capture::{TextCapturePolicy, capture_text_artifact};
use ft_core::{RunStatus, io::read_json_opt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static TIMESTAMP_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{8}T[0-9]{6}Z$").expect("timestamp regex"));

/// Embedded-artifact keys available at each embed level.
const EMBED_DEFINITION_KEYS: &[&str] = &[
    "persona_source_md",
    "persona_resolved_md",
    "mission_source_md",
    "mission_resolved_md",
    "prompt_template_md",
];

/// How much surrounding text a history record embeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedLevel {
    /// No embedded text.
    None,
    /// Persona/mission/prompt-template/report-schema documents.
    Definitions,
    /// Definitions plus `prompt.txt`.
    Prompt,
    /// Everything, including `users.md`.
    All,
}

impl EmbedLevel {
    fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Definitions => 1,
            Self::Prompt => 2,
            Self::All => 3,
        }
    }
}

/// One historical run, parsed into a uniform record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Absolute run directory.
    pub run_dir: String,
    /// Run directory relative to the runs root, posix separators.
    pub run_rel: String,
    /// Target slug path component.
    pub target_slug: String,
    /// Timestamp directory name.
    pub timestamp_dir: String,
    /// Parsed ISO-8601 timestamp, when the directory name parses.
    pub timestamp_utc: Option<String>,
    /// Agent path component.
    pub agent: String,
    /// Seed path component.
    pub seed: String,
    /// Derived status.
    pub status: RunStatus,
    /// Agent exit code from `error.json`, when recorded.
    pub agent_exit_code: Option<i32>,
    /// Parsed `target_ref.json`.
    pub target_ref: Option<Value>,
    /// Parsed `effective_run_spec.json`.
    pub effective_run_spec: Option<Value>,
    /// Parsed `report.json`.
    pub report: Option<Value>,
    /// Parsed `metrics.json`.
    pub metrics: Option<Value>,
    /// Parsed `preflight.json`.
    pub preflight: Option<Value>,
    /// Parsed `error.json`.
    pub error: Option<Value>,
    /// Parsed `report_validation_errors.json`.
    pub report_validation_errors: Option<Value>,
    /// Embedded text artifacts keyed by name.
    pub embedded: Map<String, Value>,
    /// Capture manifests parallel to `embedded`.
    pub embedded_capture_manifest: Map<String, Value>,
}

/// Parse a `20260101T000000Z` directory name into ISO-8601.
pub fn parse_timestamp_dirname(name: &str) -> Option<String> {
    if !TIMESTAMP_DIR_RE.is_match(name) {
        return None;
    }
    let year: i32 = name[0..4].parse().ok()?;
    let month: u32 = name[4..6].parse().ok()?;
    let day: u32 = name[6..8].parse().ok()?;
    let hour: u32 = name[9..11].parse().ok()?;
    let minute: u32 = name[11..13].parse().ok()?;
    let second: u32 = name[13..15].parse().ok()?;
    let at = Utc
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()?;
    Some(ft_core::utc_timestamp(at))
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && !p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('_'))
        })
        .collect();
    out.sort();
    out
}

/// Yield run directories under `runs_dir`, sorted per directory level. A
/// run directory is a `<target>/<ts>/<agent>/<seed>` leaf containing
/// `target_ref.json`.
pub fn iter_run_dirs<'a>(
    runs_dir: &'a Path,
    target_slug: Option<&'a str>,
) -> impl Iterator<Item = PathBuf> + 'a {
    let target_dirs: Vec<PathBuf> = match target_slug {
        Some(slug) => vec![runs_dir.join(slug)],
        None => sorted_subdirs(runs_dir),
    };

    target_dirs.into_iter().flat_map(|target_dir| {
        sorted_subdirs(&target_dir).into_iter().flat_map(|ts_dir| {
            sorted_subdirs(&ts_dir).into_iter().flat_map(|agent_dir| {
                sorted_subdirs(&agent_dir)
                    .into_iter()
                    .filter(|seed_dir| seed_dir.join(ft_core::artifact::TARGET_REF).exists())
            })
        })
    })
}

fn capture_embedded(
    run_dir: &Path,
    rel: &str,
    policy: &TextCapturePolicy,
    embedded: &mut Map<String, Value>,
    manifests: &mut Map<String, Value>,
    key: &str,
) {
    let result = capture_text_artifact(&run_dir.join(rel), policy, run_dir);
    let manifest = serde_json::json!({
        "path": result.artifact.path,
        "exists": result.artifact.exists,
        "size_bytes": result.artifact.size_bytes,
        "sha256": result.artifact.sha256,
        "truncated": result.excerpt.as_ref().is_some_and(|e| e.truncated),
        "error": result.error,
    });
    manifests.insert(key.to_string(), manifest);

    if !result.artifact.exists {
        embedded.insert(key.to_string(), Value::Null);
        return;
    }
    let value = match (&result.excerpt, &result.error) {
        (Some(excerpt), _) => Value::String(excerpt.composed()),
        (None, Some(error)) => Value::String(format!("[capture_error] {error}")),
        (None, None) => Value::String("[capture_error] capture_unavailable".to_string()),
    };
    embedded.insert(key.to_string(), value);
}

fn read_run_record(
    runs_dir: &Path,
    run_dir: &Path,
    embed: EmbedLevel,
    policy: &TextCapturePolicy,
) -> Option<RunRecord> {
    let rel = run_dir.strip_prefix(runs_dir).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.len() < 4 {
        return None;
    }
    let run_rel = parts.join("/");

    let error: Option<Value> = read_json_opt(&run_dir.join(ft_core::artifact::ERROR));
    let report_validation_errors: Option<Value> =
        read_json_opt(&run_dir.join(ft_core::artifact::REPORT_VALIDATION_ERRORS));
    let report: Option<Value> = read_json_opt(&run_dir.join(ft_core::artifact::REPORT));

    let status = if error.is_some() {
        RunStatus::Error
    } else if report_validation_errors.is_some() {
        RunStatus::ReportValidationError
    } else if report.is_none() {
        RunStatus::MissingReport
    } else {
        RunStatus::Ok
    };

    let agent_exit_code = error
        .as_ref()
        .and_then(|e| e.get("exit_code"))
        .and_then(Value::as_i64)
        .map(|c| c as i32);

    let mut embedded = Map::new();
    let mut manifests = Map::new();
    if embed.rank() >= 1 {
        for key in EMBED_DEFINITION_KEYS {
            let rel_file = match *key {
                "persona_source_md" => ft_core::artifact::PERSONA_SOURCE,
                "persona_resolved_md" => ft_core::artifact::PERSONA_RESOLVED,
                "mission_source_md" => ft_core::artifact::MISSION_SOURCE,
                "mission_resolved_md" => ft_core::artifact::MISSION_RESOLVED,
                _ => ft_core::artifact::PROMPT_TEMPLATE,
            };
            capture_embedded(run_dir, rel_file, policy, &mut embedded, &mut manifests, key);
        }
        embedded.insert(
            "report_schema_json".to_string(),
            read_json_opt::<Value>(&run_dir.join(ft_core::artifact::REPORT_SCHEMA))
                .unwrap_or(Value::Null),
        );
    }
    if embed.rank() >= 2 {
        capture_embedded(
            run_dir,
            ft_core::artifact::PROMPT,
            policy,
            &mut embedded,
            &mut manifests,
            "prompt_txt",
        );
    }
    if embed.rank() >= 3 {
        capture_embedded(run_dir, "users.md", policy, &mut embedded, &mut manifests, "users_md");
    }

    Some(RunRecord {
        run_dir: run_dir.display().to_string(),
        run_rel,
        target_slug: parts[0].clone(),
        timestamp_dir: parts[1].clone(),
        timestamp_utc: parse_timestamp_dirname(&parts[1]),
        agent: parts[2].clone(),
        seed: parts[3].clone(),
        status,
        agent_exit_code,
        target_ref: read_json_opt(&run_dir.join(ft_core::artifact::TARGET_REF)),
        effective_run_spec: read_json_opt(&run_dir.join(ft_core::artifact::EFFECTIVE_RUN_SPEC)),
        report,
        metrics: read_json_opt(&run_dir.join(ft_core::artifact::METRICS)),
        preflight: read_json_opt(&run_dir.join(ft_core::artifact::PREFLIGHT)),
        error,
        report_validation_errors,
        embedded,
        embedded_capture_manifest: manifests,
    })
}

/// Iterate run records from either a runs directory or a pre-compiled
/// `report_history.jsonl` file.
pub fn iter_report_history<'a>(
    source: &'a Path,
    target_slug: Option<&'a str>,
    embed: EmbedLevel,
    max_embed_bytes: usize,
) -> Box<dyn Iterator<Item = RunRecord> + 'a> {
    if source.is_file() {
        let text = std::fs::read_to_string(source).unwrap_or_default();
        let target_slug = target_slug.map(str::to_string);
        let records: Vec<RunRecord> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<RunRecord>(line).ok())
            .filter(move |record| {
                target_slug
                    .as_deref()
                    .is_none_or(|slug| record.target_slug == slug)
            })
            .collect();
        return Box::new(records.into_iter());
    }

    let policy = TextCapturePolicy::sized(max_embed_bytes.max(1));
    Box::new(
        iter_run_dirs(source, target_slug)
            .filter_map(move |run_dir| read_run_record(source, &run_dir, embed, &policy)),
    )
}

/// Status counts returned by [`write_report_history_jsonl`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCounts {
    /// Valid-report runs.
    pub ok: u64,
    /// Runs without a report.
    pub missing_report: u64,
    /// Runs whose report failed validation.
    pub report_validation_error: u64,
    /// Runs with a terminal error.
    pub error: u64,
    /// All runs.
    pub total: u64,
}

/// Compile the run tree into a `report_history.jsonl` file.
pub fn write_report_history_jsonl(
    runs_dir: &Path,
    out_path: &Path,
    target_slug: Option<&str>,
    embed: EmbedLevel,
    max_embed_bytes: usize,
) -> std::io::Result<HistoryCounts> {
    use std::io::Write;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::io::BufWriter::new(std::fs::File::create(out_path)?);

    let mut counts = HistoryCounts::default();
    for record in iter_report_history(runs_dir, target_slug, embed, max_embed_bytes) {
        counts.total += 1;
        match record.status {
            RunStatus::Ok => counts.ok += 1,
            RunStatus::MissingReport => counts.missing_report += 1,
            RunStatus::ReportValidationError => counts.report_validation_error += 1,
            RunStatus::Error => counts.error += 1,
        }
        let line = serde_json::to_string(&record).map_err(std::io::Error::other)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed_run(
        runs_dir: &Path,
        rel: &str,
        report: Option<Value>,
        error: Option<Value>,
        validation_errors: Option<Value>,
    ) -> PathBuf {
        let run_dir = runs_dir.join(rel);
        std::fs::create_dir_all(&run_dir).unwrap();
        ft_core::io::write_json_pretty(
            &run_dir.join("target_ref.json"),
            &json!({"repo_input": "/src/demo", "agent": "codex"}),
        )
        .unwrap();
        if let Some(report) = report {
            ft_core::io::write_json_pretty(&run_dir.join("report.json"), &report).unwrap();
        }
        if let Some(error) = error {
            ft_core::io::write_json_pretty(&run_dir.join("error.json"), &error).unwrap();
        }
        if let Some(errors) = validation_errors {
            ft_core::io::write_json_pretty(
                &run_dir.join("report_validation_errors.json"),
                &errors,
            )
            .unwrap();
        }
        run_dir
    }

    #[test]
    fn timestamp_parsing_accepts_only_the_run_format() {
        assert_eq!(
            parse_timestamp_dirname("20260214T093005Z"),
            Some("2026-02-14T09:30:05Z".to_string())
        );
        assert_eq!(parse_timestamp_dirname("2026-02-14"), None);
        assert_eq!(parse_timestamp_dirname("20261314T000000Z"), None);
    }

    #[test]
    fn walk_yields_sorted_leaf_dirs_and_skips_underscored() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(dir.path(), "tgt_b/20260101T000000Z/codex/0", None, None, None);
        seed_run(dir.path(), "tgt_a/20260101T000000Z/claude/1", None, None, None);
        seed_run(dir.path(), "tgt_a/20260101T000000Z/claude/0", None, None, None);
        std::fs::create_dir_all(dir.path().join("_compiled/x")).unwrap();

        let rels: Vec<String> = iter_run_dirs(dir.path(), None)
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(
            rels,
            vec![
                "tgt_a/20260101T000000Z/claude/0",
                "tgt_a/20260101T000000Z/claude/1",
                "tgt_b/20260101T000000Z/codex/0",
            ]
        );
    }

    #[test]
    fn status_derivation_prefers_error_then_validation_then_missing() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(
            dir.path(),
            "t/20260101T000000Z/codex/0",
            Some(json!({"summary": "ok"})),
            None,
            None,
        );
        seed_run(
            dir.path(),
            "t/20260101T000000Z/codex/1",
            None,
            Some(json!({"type": "AgentExecFailed", "exit_code": 1})),
            None,
        );
        seed_run(
            dir.path(),
            "t/20260101T000000Z/codex/2",
            None,
            None,
            Some(json!(["bad schema"])),
        );
        seed_run(dir.path(), "t/20260101T000000Z/codex/3", None, None, None);

        let statuses: Vec<RunStatus> =
            iter_report_history(dir.path(), None, EmbedLevel::None, 1_000)
                .map(|r| r.status)
                .collect();
        assert_eq!(
            statuses,
            vec![
                RunStatus::Ok,
                RunStatus::Error,
                RunStatus::ReportValidationError,
                RunStatus::MissingReport,
            ]
        );
    }

    #[test]
    fn records_carry_identifiers_and_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(
            dir.path(),
            "demo/20260101T120000Z/claude/7",
            None,
            Some(json!({"type": "AgentExecFailed", "exit_code": 3})),
            None,
        );
        let record = iter_report_history(dir.path(), None, EmbedLevel::None, 1_000)
            .next()
            .unwrap();
        assert_eq!(record.target_slug, "demo");
        assert_eq!(record.agent, "claude");
        assert_eq!(record.seed, "7");
        assert_eq!(record.run_rel, "demo/20260101T120000Z/claude/7");
        assert_eq!(record.timestamp_utc.as_deref(), Some("2026-01-01T12:00:00Z"));
        assert_eq!(record.agent_exit_code, Some(3));
    }

    #[test]
    fn embed_definitions_captures_documents_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = seed_run(
            dir.path(),
            "t/20260101T000000Z/codex/0",
            Some(json!({"summary": "ok"})),
            None,
            None,
        );
        std::fs::write(run_dir.join("persona.source.md"), "persona body").unwrap();

        let record = iter_report_history(dir.path(), None, EmbedLevel::Definitions, 1_000)
            .next()
            .unwrap();
        assert_eq!(record.embedded["persona_source_md"], json!("persona body"));
        assert_eq!(
            record.embedded_capture_manifest["persona_source_md"]["exists"],
            json!(true)
        );
        assert_eq!(record.embedded["mission_source_md"], Value::Null);
        assert!(!record.embedded.contains_key("prompt_txt"));
    }

    #[test]
    fn compiled_jsonl_round_trips_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(
            dir.path(),
            "t/20260101T000000Z/codex/0",
            Some(json!({"summary": "ok"})),
            None,
            None,
        );
        seed_run(
            dir.path(),
            "t/20260101T000000Z/codex/1",
            None,
            Some(json!({"type": "AgentExecFailed"})),
            None,
        );

        let out = dir.path().join("_compiled/report_history.jsonl");
        let counts =
            write_report_history_jsonl(dir.path(), &out, None, EmbedLevel::None, 1_000)
                .unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.ok, 1);
        assert_eq!(counts.error, 1);

        let back: Vec<RunRecord> =
            iter_report_history(&out, None, EmbedLevel::None, 1_000).collect();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].status, RunStatus::Ok);
    }

    #[test]
    fn target_filter_restricts_both_sources() {
        let dir = tempfile::tempdir().unwrap();
        seed_run(dir.path(), "alpha/20260101T000000Z/codex/0", None, None, None);
        seed_run(dir.path(), "beta/20260101T000000Z/codex/0", None, None, None);

        let from_tree: Vec<RunRecord> =
            iter_report_history(dir.path(), Some("alpha"), EmbedLevel::None, 1_000).collect();
        assert_eq!(from_tree.len(), 1);
        assert_eq!(from_tree[0].target_slug, "alpha");
    }
}
