// SPDX-License-Identifier: MIT OR Apache-2.0
//! Idea-file export.
//!
//! Tickets that cleared the gates become markdown idea files in the owner
//! repo's plan folder. Export is idempotent: a fingerprint already present
//! in any bucket is skipped, and the post-export sweeps clean up stale
//! duplicates left behind by earlier runs.

use crate::BacklogError;
use crate::builder::{Stage, Ticket};
use crate::ledger::{
    AtomActions, AtomStatus, TicketActionEntry, TicketActions, promote_atom_status, push_unique,
};
use crate::plan_index::{
    PLANS_DIR_REL, dedupe_actioned_plan_files, dedupe_queued_when_actioned_exists,
    scan_plan_ticket_index,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bucket receiving triage-stage exports.
pub const TRIAGE_BUCKET: &str = "0.5 - to_triage";
/// Bucket receiving research/implementation exports.
pub const IDEAS_BUCKET: &str = "1 - ideas";
/// Bucket receiving deferred plans.
pub const DEFERRED_BUCKET: &str = "0.1 - deferred";

/// Counters reported by one export pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReport {
    /// Idea files written.
    pub exports_total: u64,
    /// Tickets skipped because their fingerprint already has a plan file.
    pub skipped_existing_plan: u64,
    /// Tickets skipped because their stage is not exportable.
    pub skipped_stage: u64,
    /// Stale queued duplicates removed by the sweeps.
    pub stale_removed: u64,
    /// Plans moved to the deferred bucket by UX review.
    pub deferred_total: u64,
}

/// Slugify a title for the plan filename.
pub fn slugify(title: &str) -> String {
    let mut slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while slug.contains("__") {
        slug = slug.replace("__", "_");
    }
    let slug = slug.trim_matches('_');
    let truncated: String = slug.chars().take(48).collect();
    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

fn render_idea_markdown(ticket: &Ticket, research: bool) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("# {}", ticket.title));
    lines.push(String::new());
    if research {
        lines.push("Status: research required before implementation.".to_string());
        lines.push(String::new());
    }
    lines.push("## Problem".to_string());
    lines.push(String::new());
    lines.push(ticket.problem.clone());
    lines.push(String::new());
    lines.push("## Details".to_string());
    lines.push(String::new());
    lines.push(format!("- Ticket: {}", ticket.ticket_id));
    lines.push(format!("- Severity: {:?}", ticket.severity).to_lowercase());
    lines.push(format!("- Confidence: {:.2}", ticket.confidence));
    lines.push(format!(
        "- Breadth: {} runs, {} missions, {} agents",
        ticket.breadth.runs, ticket.breadth.missions, ticket.breadth.agents
    ));
    lines.push(format!(
        "- Surface: {}",
        ticket.change_surface.kinds.join(", ")
    ));
    if !ticket.risks.is_empty() {
        lines.push(format!("- Risks: {}", ticket.risks.join(", ")));
    }
    lines.push(String::new());
    lines.push("## Evidence".to_string());
    lines.push(String::new());
    for atom_id in &ticket.evidence_atom_ids {
        lines.push(format!("- `{atom_id}`"));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Export eligible tickets into the owner repo's plan folder.
///
/// `date_yyyymmdd` stamps the filenames; `generated_at` stamps the
/// ledgers. Ledger mutations happen in memory; the caller persists them
/// (export must be all-or-nothing).
pub fn export_tickets(
    tickets: &[Ticket],
    owner_root: &Path,
    atom_actions: &mut AtomActions,
    ticket_actions: &mut TicketActions,
    date_yyyymmdd: &str,
    generated_at: &str,
) -> Result<ExportReport, BacklogError> {
    let mut report = ExportReport::default();
    let existing = scan_plan_ticket_index(owner_root);

    for ticket in tickets {
        let bucket = match ticket.stage {
            Stage::ReadyForTicket | Stage::ResearchRequired => IDEAS_BUCKET,
            Stage::Triage => TRIAGE_BUCKET,
            Stage::Blocked => {
                report.skipped_stage += 1;
                continue;
            }
        };

        if let Some(meta) = existing.get(&ticket.fingerprint) {
            report.skipped_existing_plan += 1;
            ticket_actions.insert(
                ticket.fingerprint.clone(),
                TicketActionEntry {
                    ticket_id: Some(ticket.ticket_id.clone()),
                    resolution: "skipped_existing_plan".to_string(),
                    plan_path: meta.paths.first().cloned(),
                    resolved_at: Some(generated_at.to_string()),
                },
            );
            continue;
        }

        let filename = format!(
            "{date_yyyymmdd}_{}_{}_{}.md",
            ticket.ticket_id,
            ticket.fingerprint,
            slugify(&ticket.title)
        );
        let bucket_dir = owner_root.join(PLANS_DIR_REL).join(bucket);
        std::fs::create_dir_all(&bucket_dir).map_err(|e| BacklogError::io(&bucket_dir, e))?;
        let plan_path = bucket_dir.join(&filename);
        let body = render_idea_markdown(ticket, ticket.stage == Stage::ResearchRequired);
        std::fs::write(&plan_path, body).map_err(|e| BacklogError::io(&plan_path, e))?;
        report.exports_total += 1;
        tracing::info!(path = %plan_path.display(), "exported idea file");

        ticket_actions.insert(
            ticket.fingerprint.clone(),
            TicketActionEntry {
                ticket_id: Some(ticket.ticket_id.clone()),
                resolution: "exported".to_string(),
                plan_path: Some(plan_path.display().to_string()),
                resolved_at: Some(generated_at.to_string()),
            },
        );

        // Cited atoms move new → queued.
        for atom_id in &ticket.evidence_atom_ids {
            let entry = atom_actions.entry(atom_id.clone()).or_default();
            entry.status = promote_atom_status(entry.status, AtomStatus::Queued);
            entry.last_seen_at = Some(generated_at.to_string());
            entry.last_plan_bucket = Some(bucket.to_string());
            push_unique(&mut entry.queue_paths, plan_path.display().to_string());
            push_unique(&mut entry.ticket_ids, ticket.ticket_id.clone());
            push_unique(&mut entry.fingerprints, ticket.fingerprint.clone());
        }
    }

    report.stale_removed += dedupe_queued_when_actioned_exists(owner_root)?;
    report.stale_removed += dedupe_actioned_plan_files(owner_root)?;
    Ok(report)
}

/// One UX-review verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UxRecommendation {
    /// Keep the plan where it is.
    Keep,
    /// Move it to `0.1 - deferred` and mark the ticket deferred.
    Defer,
}

/// Apply UX-review recommendations: `defer` moves the plan file into the
/// deferred bucket and records the deferral in the ticket-action ledger.
pub fn apply_ux_review(
    owner_root: &Path,
    recommendations: &BTreeMap<String, UxRecommendation>,
    ticket_actions: &mut TicketActions,
    generated_at: &str,
) -> Result<u64, BacklogError> {
    let index = scan_plan_ticket_index(owner_root);
    let mut deferred = 0;

    for (fingerprint, recommendation) in recommendations {
        if *recommendation != UxRecommendation::Defer {
            continue;
        }
        let Some(meta) = index.get(fingerprint) else { continue };

        let deferred_dir = owner_root.join(PLANS_DIR_REL).join(DEFERRED_BUCKET);
        std::fs::create_dir_all(&deferred_dir)
            .map_err(|e| BacklogError::io(&deferred_dir, e))?;

        for path in &meta.paths {
            let path = PathBuf::from(path);
            let Some(name) = path.file_name() else { continue };
            let dest = deferred_dir.join(name);
            if path.parent() == dest.parent() {
                continue;
            }
            std::fs::rename(&path, &dest).map_err(|e| BacklogError::io(&path, e))?;
            deferred += 1;
        }

        let entry = ticket_actions.entry(fingerprint.clone()).or_default();
        entry.resolution = "deferred".to_string();
        entry.resolved_at = Some(generated_at.to_string());
    }
    Ok(deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{Breadth, ChangeSurface};
    use ft_atoms::Severity;

    fn ticket(fingerprint: &str, stage: Stage) -> Ticket {
        Ticket {
            ticket_id: "BLG-001".into(),
            title: "README quickstart example does not compile".into(),
            problem: "three agents tripped over the same stale snippet".into(),
            severity: Severity::High,
            confidence: 0.8,
            evidence_atom_ids: vec![
                "demo/20260101T000000Z/codex/0:confusion_point:0".into(),
            ],
            change_surface: ChangeSurface {
                kinds: vec!["docs".into()],
            },
            breadth: Breadth {
                runs: 3,
                missions: 1,
                targets: 1,
                repo_inputs: 1,
                agents: 2,
            },
            model_breadth: 2,
            stage,
            risks: vec![],
            themes: vec![],
            fingerprint: fingerprint.into(),
        }
    }

    #[test]
    fn slugify_flattens_punctuation() {
        assert_eq!(
            slugify("README quickstart: example does not compile!"),
            "readme_quickstart_example_does_not_compile"
        );
        assert_eq!(slugify("///"), "untitled");
    }

    #[test]
    fn export_writes_idea_file_and_queues_atoms() {
        let dir = tempfile::tempdir().unwrap();
        let mut atom_actions = AtomActions::new();
        let mut ticket_actions = TicketActions::new();

        let report = export_tickets(
            &[ticket("aaaaaaaaaaaaaaaa", Stage::ReadyForTicket)],
            dir.path(),
            &mut atom_actions,
            &mut ticket_actions,
            "20260214",
            "2026-02-14T00:00:00Z",
        )
        .unwrap();

        assert_eq!(report.exports_total, 1);
        let ideas = dir.path().join(PLANS_DIR_REL).join(IDEAS_BUCKET);
        let files: Vec<_> = std::fs::read_dir(&ideas).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().to_string_lossy().into_owned();
        assert!(name.starts_with("20260214_BLG-001_aaaaaaaaaaaaaaaa_"));

        let body = std::fs::read_to_string(files[0].path()).unwrap();
        assert!(body.contains("`demo/20260101T000000Z/codex/0:confusion_point:0`"));

        let entry = &atom_actions["demo/20260101T000000Z/codex/0:confusion_point:0"];
        assert_eq!(entry.status, AtomStatus::Queued);
        assert!(!entry.queue_paths.is_empty());
        assert_eq!(
            ticket_actions["aaaaaaaaaaaaaaaa"].resolution,
            "exported"
        );
    }

    #[test]
    fn second_export_skips_every_existing_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut atom_actions = AtomActions::new();
        let mut ticket_actions = TicketActions::new();
        let tickets = vec![ticket("aaaaaaaaaaaaaaaa", Stage::ReadyForTicket)];

        let first = export_tickets(
            &tickets,
            dir.path(),
            &mut atom_actions,
            &mut ticket_actions,
            "20260214",
            "2026-02-14T00:00:00Z",
        )
        .unwrap();
        assert_eq!(first.exports_total, 1);

        let second = export_tickets(
            &tickets,
            dir.path(),
            &mut atom_actions,
            &mut ticket_actions,
            "20260215",
            "2026-02-15T00:00:00Z",
        )
        .unwrap();
        assert_eq!(second.exports_total, 0);
        assert_eq!(second.skipped_existing_plan, 1);
        assert_eq!(
            ticket_actions["aaaaaaaaaaaaaaaa"].resolution,
            "skipped_existing_plan"
        );
    }

    #[test]
    fn actioned_fingerprint_skips_export_and_sweeps_stale_ideas_copy() {
        let dir = tempfile::tempdir().unwrap();
        // Completed plan plus a stale ideas-bucket copy of the same
        // fingerprint.
        for bucket in ["5 - complete", IDEAS_BUCKET] {
            let bucket_dir = dir.path().join(PLANS_DIR_REL).join(bucket);
            std::fs::create_dir_all(&bucket_dir).unwrap();
            std::fs::write(
                bucket_dir.join("20260101_BLG-009_ffffffffffffffff_old.md"),
                "plan body",
            )
            .unwrap();
        }

        let mut atom_actions = AtomActions::new();
        let mut ticket_actions = TicketActions::new();
        let report = export_tickets(
            &[ticket("ffffffffffffffff", Stage::ReadyForTicket)],
            dir.path(),
            &mut atom_actions,
            &mut ticket_actions,
            "20260214",
            "2026-02-14T00:00:00Z",
        )
        .unwrap();

        assert_eq!(report.exports_total, 0);
        assert_eq!(report.skipped_existing_plan, 1);
        assert_eq!(report.stale_removed, 1);
        assert!(
            !dir.path()
                .join(PLANS_DIR_REL)
                .join(IDEAS_BUCKET)
                .join("20260101_BLG-009_ffffffffffffffff_old.md")
                .exists()
        );
        assert!(
            dir.path()
                .join(PLANS_DIR_REL)
                .join("5 - complete")
                .join("20260101_BLG-009_ffffffffffffffff_old.md")
                .exists()
        );
    }

    #[test]
    fn blocked_tickets_are_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let mut atom_actions = AtomActions::new();
        let mut ticket_actions = TicketActions::new();
        let report = export_tickets(
            &[ticket("dddddddddddddddd", Stage::Blocked)],
            dir.path(),
            &mut atom_actions,
            &mut ticket_actions,
            "20260214",
            "2026-02-14T00:00:00Z",
        )
        .unwrap();
        assert_eq!(report.exports_total, 0);
        assert_eq!(report.skipped_stage, 1);
        assert!(atom_actions.is_empty());
    }

    #[test]
    fn triage_stage_routes_to_triage_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let mut atom_actions = AtomActions::new();
        let mut ticket_actions = TicketActions::new();
        export_tickets(
            &[ticket("eeeeeeeeeeeeeeee", Stage::Triage)],
            dir.path(),
            &mut atom_actions,
            &mut ticket_actions,
            "20260214",
            "2026-02-14T00:00:00Z",
        )
        .unwrap();
        let triage_dir = dir.path().join(PLANS_DIR_REL).join(TRIAGE_BUCKET);
        assert_eq!(std::fs::read_dir(&triage_dir).unwrap().count(), 1);
    }

    #[test]
    fn ux_defer_moves_plan_and_marks_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let ideas_dir = dir.path().join(PLANS_DIR_REL).join(IDEAS_BUCKET);
        std::fs::create_dir_all(&ideas_dir).unwrap();
        std::fs::write(
            ideas_dir.join("20260214_BLG-004_1111111111111111_x.md"),
            "body",
        )
        .unwrap();

        let mut ticket_actions = TicketActions::new();
        let mut recommendations = BTreeMap::new();
        recommendations.insert("1111111111111111".to_string(), UxRecommendation::Defer);

        let moved = apply_ux_review(
            dir.path(),
            &recommendations,
            &mut ticket_actions,
            "2026-02-14T00:00:00Z",
        )
        .unwrap();
        assert_eq!(moved, 1);
        assert!(
            dir.path()
                .join(PLANS_DIR_REL)
                .join(DEFERRED_BUCKET)
                .join("20260214_BLG-004_1111111111111111_x.md")
                .exists()
        );
        assert_eq!(ticket_actions["1111111111111111"].resolution, "deferred");
    }
}
