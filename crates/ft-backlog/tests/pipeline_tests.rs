// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end backlog pipeline tests over an on-disk run tree.

use chrono::TimeZone;
use ft_backlog::{
    AtomStatus, GatePolicy, PipelineOptions, run_backlog_pipeline, run_export_pipeline,
};
use ft_triage::HashingEmbedder;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

const ATOM_B: &str = "target_a/20260101T000000Z/codex/0:confusion_point:1";

fn seed_run(runs_dir: &Path, rel: &str, report: Value) {
    let run_dir = runs_dir.join(rel);
    std::fs::create_dir_all(&run_dir).unwrap();
    ft_core::io::write_json_pretty(
        &run_dir.join("target_ref.json"),
        &json!({
            "repo_input": "/src/target_a",
            "agent": rel.split('/').nth(2).unwrap(),
            "mission_id": "explore",
        }),
    )
    .unwrap();
    ft_core::io::write_json_pretty(&run_dir.join("report.json"), &report).unwrap();
}

fn seed_tree(runs_dir: &Path) {
    seed_run(
        runs_dir,
        "target_a/20260101T000000Z/codex/0",
        json!({
            "confusion_points": [
                {"summary": "the readme quickstart example does not compile"},
                {"summary": "unclear which config file wins"}
            ]
        }),
    );
    seed_run(
        runs_dir,
        "target_a/20260102T000000Z/claude/0",
        json!({
            "confusion_points": [
                {"summary": "readme quickstart sample fails to compile"}
            ]
        }),
    );
}

fn options(runs_dir: &Path, owner_roots: Vec<PathBuf>, hour: u32) -> PipelineOptions {
    PipelineOptions {
        runs_dir: runs_dir.to_path_buf(),
        target_slug: "target_a".to_string(),
        owner_roots,
        policy: GatePolicy::default(),
        now: chrono::Utc
            .with_ymd_and_hms(2026, 2, 14, hour, 0, 0)
            .unwrap(),
    }
}

#[test]
fn backlog_is_idempotent_modulo_generated_at() {
    let dir = tempfile::tempdir().unwrap();
    let runs_dir = dir.path().join("runs");
    seed_tree(&runs_dir);

    let embedder = HashingEmbedder::default();
    let first =
        run_backlog_pipeline(&options(&runs_dir, vec![], 0), &embedder).unwrap();
    let second =
        run_backlog_pipeline(&options(&runs_dir, vec![], 1), &embedder).unwrap();

    let mut normalized = second.doc.clone();
    normalized.generated_at_utc = first.doc.generated_at_utc.clone();
    assert_eq!(first.doc, normalized);

    let json_path = first
        .compiled_dir
        .join("target_a.backlog.json");
    assert!(json_path.exists());
    assert!(first.compiled_dir.join("target_a.backlog.md").exists());
    assert!(
        first
            .compiled_dir
            .join("target_a.backlog.atoms.jsonl")
            .exists()
    );
}

#[test]
fn completed_plan_actions_its_atoms_and_excludes_them() {
    let dir = tempfile::tempdir().unwrap();
    let runs_dir = dir.path().join("runs");
    seed_tree(&runs_dir);

    let owner = dir.path().join("owner_repo");
    let complete_dir = owner.join(".agents/plans/5 - complete");
    std::fs::create_dir_all(&complete_dir).unwrap();
    std::fs::write(
        complete_dir.join("20260214_BLG-123_deadbeefdeadbeef_x.md"),
        format!("Shipped. Evidence: `{ATOM_B}`.\n"),
    )
    .unwrap();

    let embedder = HashingEmbedder::default();
    let output = run_backlog_pipeline(
        &options(&runs_dir, vec![owner.clone()], 0),
        &embedder,
    )
    .unwrap();

    assert_eq!(output.atom_actions[ATOM_B].status, AtomStatus::Actioned);
    assert_eq!(
        output.atom_actions[ATOM_B].last_plan_bucket.as_deref(),
        Some("5 - complete")
    );

    let atoms_jsonl = std::fs::read_to_string(
        output.compiled_dir.join("target_a.backlog.atoms.jsonl"),
    )
    .unwrap();
    assert!(!atoms_jsonl.contains(ATOM_B), "actioned atom must be excluded");
    assert!(atoms_jsonl.contains("confusion_point:0"));

    for cluster in &output.doc.clusters {
        assert!(!cluster.atom_ids.iter().any(|id| id == ATOM_B));
    }
}

#[test]
fn dequeued_plan_demotes_back_to_new() {
    let dir = tempfile::tempdir().unwrap();
    let runs_dir = dir.path().join("runs");
    seed_tree(&runs_dir);

    let owner = dir.path().join("owner_repo");
    let dequeued_dir = owner.join(".agents/plans/_dequeued");
    std::fs::create_dir_all(&dequeued_dir).unwrap();
    std::fs::write(
        dequeued_dir.join("20260210_deadbeefdeadbeef_x.md"),
        format!("Dropped. Evidence: `{ATOM_B}`.\n"),
    )
    .unwrap();

    // First pass queues the atom via export-free ledger seeding.
    let embedder = HashingEmbedder::default();
    let compiled = ft_backlog::compiled_dir(&runs_dir, "target_a");
    std::fs::create_dir_all(&compiled).unwrap();
    let mut seeded = ft_backlog::AtomActions::new();
    seeded.insert(
        ATOM_B.to_string(),
        ft_backlog::ledger::AtomActionEntry {
            status: AtomStatus::Queued,
            ..Default::default()
        },
    );
    ft_backlog::ledger::store_atom_actions(&compiled.join("atom_actions.yaml"), &seeded)
        .unwrap();

    let output = run_backlog_pipeline(
        &options(&runs_dir, vec![owner], 0),
        &embedder,
    )
    .unwrap();
    assert_eq!(output.atom_actions[ATOM_B].status, AtomStatus::New);

    // Dequeued atoms re-enter the mining pool.
    let atoms_jsonl = std::fs::read_to_string(
        output.compiled_dir.join("target_a.backlog.atoms.jsonl"),
    )
    .unwrap();
    assert!(atoms_jsonl.contains(ATOM_B));
}

#[test]
fn export_writes_ideas_then_skips_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let runs_dir = dir.path().join("runs");
    seed_tree(&runs_dir);
    let owner = dir.path().join("owner_repo");

    let embedder = HashingEmbedder::default();
    let opts = options(&runs_dir, vec![], 0);
    let output = run_backlog_pipeline(&opts, &embedder).unwrap();
    assert!(!output.doc.tickets.is_empty());

    let first = run_export_pipeline(&opts, &output.doc, &owner).unwrap();
    assert!(first.exports_total > 0);

    let second = run_export_pipeline(&opts, &output.doc, &owner).unwrap();
    assert_eq!(second.exports_total, 0);
    assert_eq!(
        second.skipped_existing_plan,
        first.exports_total + first.skipped_existing_plan
    );

    // Exported atoms are queued in the persisted ledger.
    let ledger = ft_backlog::ledger::load_atom_actions(
        &output.compiled_dir.join("atom_actions.yaml"),
    )
    .unwrap();
    assert!(
        ledger
            .values()
            .any(|entry| entry.status == AtomStatus::Queued)
    );
}
