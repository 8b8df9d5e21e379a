// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plan-folder index and synchronization.
//!
//! The plan folder (`<owner_repo>/.agents/plans/<bucket>/`) is a
//! filesystem-as-database: bucket membership encodes ticket lifecycle, and
//! filenames carry the date, optional ticket id, fingerprint, and slug.
//! This module scans it (never interleaving writes with scans), maps
//! fingerprints to statuses via bucket rank, and reconciles the atom-action
//! ledger against what the folders say.

use crate::BacklogError;
use crate::ledger::{AtomActionEntry, AtomActions, AtomStatus, promote_atom_status, push_unique};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Plan buckets in rank order, with their mapped atom status.
pub const PLAN_BUCKETS: &[(&str, f64, AtomStatus)] = &[
    ("0.1 - deferred", 0.1, AtomStatus::Actioned),
    ("0.3 - todos", 0.3, AtomStatus::Queued),
    ("0.5 - to_triage", 0.5, AtomStatus::Queued),
    ("1 - ideas", 1.0, AtomStatus::Queued),
    ("1.5 - to_plan", 1.5, AtomStatus::Queued),
    ("2 - ready", 2.0, AtomStatus::Queued),
    ("3 - in_progress", 3.0, AtomStatus::Actioned),
    ("4 - for_review", 4.0, AtomStatus::Actioned),
    ("5 - complete", 5.0, AtomStatus::Actioned),
    ("6 - archived", 6.0, AtomStatus::Actioned),
];

/// Plan subtrees whose contents signal explicit removal from the queue.
pub const DEQUEUED_PLAN_DIRNAMES: &[&str] = &["_dequeued", "_archive"];

/// `<YYYYMMDD>_[<ticket_id>_]<fingerprint16>_<slug>.md`
pub static PLAN_TICKET_FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<date>[0-9]{8})_(?:(?P<ticket_id>BLG-[0-9]{3})_)?(?P<fingerprint>[0-9a-f]{16})_(?P<slug>.+)\.md$")
        .expect("plan filename regex")
});

/// Atom id shape: `<target>/<ts>/<agent>/<seed>:<source>:<index>`.
pub static ATOM_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9_.-]+/[0-9]{8}T[0-9]{6}Z/[A-Za-z0-9_.-]+/[0-9]+:[A-Za-z0-9_.-]+:[0-9]+$",
    )
    .expect("atom id regex")
});

/// Relative path of the plans dir inside an owner repo.
pub const PLANS_DIR_REL: &str = ".agents/plans";

/// Bucket rank; `None` for unknown bucket names.
pub fn bucket_rank(bucket: &str) -> Option<f64> {
    PLAN_BUCKETS
        .iter()
        .find(|(name, _, _)| *name == bucket)
        .map(|(_, rank, _)| *rank)
}

/// Atom status a bucket maps to; `None` for unknown buckets.
pub fn bucket_atom_status(bucket: &str) -> Option<AtomStatus> {
    PLAN_BUCKETS
        .iter()
        .find(|(name, _, _)| *name == bucket)
        .map(|(_, _, status)| *status)
}

/// Buckets mapping to `queued`.
pub fn queued_buckets() -> Vec<&'static str> {
    PLAN_BUCKETS
        .iter()
        .filter(|(_, _, status)| *status == AtomStatus::Queued)
        .map(|(name, _, _)| *name)
        .collect()
}

/// Buckets mapping to `actioned`, highest rank first.
pub fn actioned_buckets_by_priority() -> Vec<&'static str> {
    let mut buckets: Vec<(&str, f64)> = PLAN_BUCKETS
        .iter()
        .filter(|(_, _, status)| *status == AtomStatus::Actioned)
        .map(|(name, rank, _)| (*name, *rank))
        .collect();
    buckets.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    buckets.into_iter().map(|(name, _)| name).collect()
}

/// Extract atom ids from backtick-wrapped tokens in plan markdown.
pub fn extract_atom_ids_from_markdown(markdown: &str) -> Vec<String> {
    static BACKTICK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("backtick regex"));
    let mut ids: Vec<String> = BACKTICK_RE
        .captures_iter(markdown)
        .map(|c| c[1].trim().to_string())
        .filter(|candidate| ATOM_ID_RE.is_match(candidate))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// One fingerprint's merged plan-folder state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTicketMeta {
    /// Merged status (highest-ranked bucket wins).
    pub status: AtomStatus,
    /// Plan files carrying this fingerprint.
    pub paths: Vec<String>,
    /// Buckets carrying this fingerprint.
    pub buckets: Vec<String>,
    /// Ticket ids seen in those filenames.
    pub ticket_ids: Vec<String>,
}

fn sorted_md_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "md"))
        .collect();
    out.sort();
    out
}

fn sorted_md_files_recursive(dir: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else if path.extension().is_some_and(|e| e == "md") {
                out.push(path);
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, &mut out);
    out.sort();
    out
}

/// Build the fingerprint → plan-state index for one owner repo.
pub fn scan_plan_ticket_index(owner_root: &Path) -> BTreeMap<String, PlanTicketMeta> {
    let plans_dir = owner_root.join(PLANS_DIR_REL);
    let mut index: BTreeMap<String, PlanTicketMeta> = BTreeMap::new();
    if !plans_dir.is_dir() {
        return index;
    }

    for (bucket, _, status) in PLAN_BUCKETS {
        let bucket_dir = plans_dir.join(bucket);
        for md_path in sorted_md_files(&bucket_dir) {
            let Some(name) = md_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = PLAN_TICKET_FILENAME_RE.captures(name) else {
                continue;
            };
            let fingerprint = caps["fingerprint"].to_string();
            let ticket_id = caps.name("ticket_id").map(|m| m.as_str().to_string());

            let meta = index.entry(fingerprint).or_insert_with(|| PlanTicketMeta {
                status: *status,
                paths: Vec::new(),
                buckets: Vec::new(),
                ticket_ids: Vec::new(),
            });
            meta.status = promote_atom_status(meta.status, *status);
            push_unique(&mut meta.paths, md_path.display().to_string());
            push_unique(&mut meta.buckets, *bucket);
            if let Some(ticket_id) = ticket_id {
                push_unique(&mut meta.ticket_ids, ticket_id);
            }
        }
    }
    index
}

/// Summary counters from a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSyncSummary {
    /// Owner roots that had a plans dir.
    pub roots_scanned: u64,
    /// Bucket or dequeue dirs visited.
    pub dirs_scanned: u64,
    /// Plan files whose names matched the ticket pattern.
    pub ticket_files_scanned: u64,
    /// Plan files carrying no recognizable atom ids.
    pub tickets_without_evidence: u64,
    /// Atom id references seen.
    pub atom_ids_seen: u64,
    /// Ledger entries created.
    pub atoms_created: u64,
    /// Ledger entries promoted.
    pub atoms_promoted: u64,
    /// Ledger entries demoted back to `new`.
    pub atoms_demoted: u64,
    /// Demotions refused because the entry was `actioned`.
    pub atoms_skipped_actioned: u64,
}

/// Demote queued/ticketed ledger entries referenced by `_dequeued` /
/// `_archive` plan files back to `new`. Runs before
/// [`sync_atom_actions_from_plan_folders`] so anything still referenced by
/// an active bucket is promoted right back.
pub fn sync_atom_actions_from_dequeued_plan_folders(
    atom_actions: &mut AtomActions,
    owner_roots: &[PathBuf],
    generated_at: &str,
) -> PlanSyncSummary {
    let mut summary = PlanSyncSummary::default();

    for owner_root in owner_roots {
        let plans_dir = owner_root.join(PLANS_DIR_REL);
        if !plans_dir.is_dir() {
            continue;
        }
        summary.roots_scanned += 1;

        for dirname in DEQUEUED_PLAN_DIRNAMES {
            let dequeued_dir = plans_dir.join(dirname);
            if !dequeued_dir.is_dir() {
                continue;
            }
            summary.dirs_scanned += 1;

            for md_path in sorted_md_files_recursive(&dequeued_dir) {
                summary.ticket_files_scanned += 1;
                let Ok(markdown) = std::fs::read_to_string(&md_path) else {
                    continue;
                };
                let atom_ids = extract_atom_ids_from_markdown(&markdown);
                if atom_ids.is_empty() {
                    summary.tickets_without_evidence += 1;
                    continue;
                }
                summary.atom_ids_seen += atom_ids.len() as u64;

                for atom_id in atom_ids {
                    let Some(entry) = atom_actions.get_mut(&atom_id) else {
                        continue;
                    };
                    if entry.status == AtomStatus::Actioned {
                        summary.atoms_skipped_actioned += 1;
                        continue;
                    }
                    if entry.status != AtomStatus::New {
                        summary.atoms_demoted += 1;
                    }
                    entry.status = AtomStatus::New;
                    entry.last_seen_at = Some(generated_at.to_string());
                    push_unique(&mut entry.dequeued_paths, md_path.display().to_string());
                }
            }
        }
    }
    summary
}

/// Promote atom-action entries from active plan buckets (monotonic).
pub fn sync_atom_actions_from_plan_folders(
    atom_actions: &mut AtomActions,
    owner_roots: &[PathBuf],
    generated_at: &str,
) -> PlanSyncSummary {
    let mut summary = PlanSyncSummary::default();

    for owner_root in owner_roots {
        let plans_dir = owner_root.join(PLANS_DIR_REL);
        if !plans_dir.is_dir() {
            continue;
        }
        summary.roots_scanned += 1;

        for (bucket, _, status) in PLAN_BUCKETS {
            let bucket_dir = plans_dir.join(bucket);
            if !bucket_dir.is_dir() {
                continue;
            }
            summary.dirs_scanned += 1;

            for md_path in sorted_md_files(&bucket_dir) {
                let Some(name) = md_path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(caps) = PLAN_TICKET_FILENAME_RE.captures(name) else {
                    continue;
                };
                summary.ticket_files_scanned += 1;
                let fingerprint = caps["fingerprint"].to_string();
                let ticket_id = caps.name("ticket_id").map(|m| m.as_str().to_string());

                let Ok(markdown) = std::fs::read_to_string(&md_path) else {
                    continue;
                };
                let atom_ids = extract_atom_ids_from_markdown(&markdown);
                if atom_ids.is_empty() {
                    summary.tickets_without_evidence += 1;
                    continue;
                }
                summary.atom_ids_seen += atom_ids.len() as u64;

                for atom_id in atom_ids {
                    let entry = atom_actions.entry(atom_id).or_insert_with(|| {
                        summary.atoms_created += 1;
                        AtomActionEntry {
                            first_seen_at: Some(generated_at.to_string()),
                            ..AtomActionEntry::default()
                        }
                    });
                    let promoted = promote_atom_status(entry.status, *status);
                    if promoted != entry.status {
                        summary.atoms_promoted += 1;
                    }
                    entry.status = promoted;
                    entry.last_seen_at = Some(generated_at.to_string());
                    entry.last_plan_bucket = Some((*bucket).to_string());
                    push_unique(&mut entry.queue_paths, md_path.display().to_string());
                    push_unique(
                        &mut entry.queue_owner_roots,
                        owner_root.display().to_string(),
                    );
                    push_unique(&mut entry.fingerprints, fingerprint.clone());
                    if let Some(ticket_id) = &ticket_id {
                        push_unique(&mut entry.ticket_ids, ticket_id.clone());
                    }
                }
            }
        }
    }
    summary
}

/// Remove queued-bucket plan files whose fingerprint is already actioned.
pub fn dedupe_queued_when_actioned_exists(owner_root: &Path) -> Result<u64, BacklogError> {
    let index = scan_plan_ticket_index(owner_root);
    let queued: Vec<&str> = queued_buckets();

    let mut removed = 0;
    for meta in index.values() {
        if meta.status != AtomStatus::Actioned {
            continue;
        }
        for path in &meta.paths {
            let path = PathBuf::from(path);
            let bucket = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if queued.contains(&bucket) {
                std::fs::remove_file(&path).map_err(|e| BacklogError::io(&path, e))?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Among multiple actioned buckets holding the same fingerprint, keep only
/// the highest-ranked one's files.
pub fn dedupe_actioned_plan_files(owner_root: &Path) -> Result<u64, BacklogError> {
    let index = scan_plan_ticket_index(owner_root);
    let priority = actioned_buckets_by_priority();

    let mut removed = 0;
    for meta in index.values() {
        if meta.status != AtomStatus::Actioned {
            continue;
        }
        let actioned_present: Vec<&str> = priority
            .iter()
            .copied()
            .filter(|bucket| meta.buckets.iter().any(|b| b == bucket))
            .collect();
        if actioned_present.len() <= 1 {
            continue;
        }
        let keep = actioned_present[0];
        for path in &meta.paths {
            let path = PathBuf::from(path);
            let bucket = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("");
            if bucket != keep && actioned_present.contains(&bucket) {
                std::fs::remove_file(&path).map_err(|e| BacklogError::io(&path, e))?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
