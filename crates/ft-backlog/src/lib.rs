// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-backlog
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The offline reducer: walk run history, extract atoms, cluster them,
//! gate candidate tickets, reconcile with the plan-folder ledger, and
//! export idea files. Everything under `<runs_dir>/<target>/_compiled/` is
//! owned by this crate; per-run artifacts are never mutated.

/// Clustering, stage gates, fingerprints, miner cache.
pub mod builder;
/// Idea-file export and UX-review integration.
pub mod export;
/// Atom-action and ticket-action ledgers.
pub mod ledger;
/// Plan-folder scanning and synchronization.
pub mod plan_index;

pub use builder::{
    BacklogDoc, Breadth, ChangeSurface, ClusterSummary, GatePolicy, Stage, Ticket,
    build_backlog, ticket_fingerprint,
};
pub use export::{ExportReport, UxRecommendation, apply_ux_review, export_tickets};
pub use ledger::{AtomActions, AtomStatus, TicketActions};

use chrono::{DateTime, Utc};
use ft_atoms::{Atom, build_aggregate_atoms, extract_atoms};
use ft_history::{EmbedLevel, iter_report_history};
use ft_triage::Embedder;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Backlog pipeline failures. Export and ledger errors surface to the
/// caller; a partial export is not acceptable.
#[derive(Debug, Error)]
pub enum BacklogError {
    /// Filesystem failure.
    #[error("backlog io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Ledger parse/serialize failure.
    #[error("{0}")]
    Ledger(String),

    /// Embedding failure.
    #[error("embedding failure: {0}")]
    Embed(#[from] ft_triage::EmbedderError),
}

impl BacklogError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Compiled-artifact directory for a target.
pub fn compiled_dir(runs_dir: &Path, target_slug: &str) -> PathBuf {
    runs_dir.join(target_slug).join("_compiled")
}

/// Inputs for one backlog pipeline pass.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Root of the run tree.
    pub runs_dir: PathBuf,
    /// Target to compile.
    pub target_slug: String,
    /// Owner repo roots whose plan folders are reconciled.
    pub owner_roots: Vec<PathBuf>,
    /// Gate policy.
    pub policy: GatePolicy,
    /// Pipeline clock (injected for deterministic tests).
    pub now: DateTime<Utc>,
}

fn write_atoms_jsonl(path: &Path, atoms: &[&Atom]) -> Result<(), BacklogError> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BacklogError::io(parent, e))?;
    }
    let file = std::fs::File::create(path).map_err(|e| BacklogError::io(path, e))?;
    let mut out = std::io::BufWriter::new(file);
    for atom in atoms {
        let line = serde_json::to_string(atom)
            .map_err(|e| BacklogError::Ledger(format!("atom serialization failed: {e}")))?;
        out.write_all(line.as_bytes())
            .and_then(|()| out.write_all(b"\n"))
            .map_err(|e| BacklogError::io(path, e))?;
    }
    out.flush().map_err(|e| BacklogError::io(path, e))
}

/// Render the backlog as reviewable markdown.
pub fn render_backlog_markdown(doc: &BacklogDoc) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("# Backlog — {}", doc.target_slug));
    lines.push(String::new());
    lines.push(format!("- Generated (UTC): `{}`", doc.generated_at_utc));
    lines.push(format!("- Atoms: **{}**", doc.totals.atoms_total));
    lines.push(format!(
        "- Excluded (actioned): **{}**",
        doc.totals.atoms_excluded_actioned
    ));
    lines.push(format!("- Clusters: **{}**", doc.totals.clusters_total));
    lines.push(format!("- Tickets: **{}**", doc.totals.tickets_total));
    lines.push(String::new());

    for ticket in &doc.tickets {
        lines.push(format!("## {} — {}", ticket.ticket_id, ticket.title));
        lines.push(String::new());
        lines.push(format!(
            "- Stage: **{}**, severity: **{:?}**, confidence: **{:.2}**",
            ticket.stage.as_str(),
            ticket.severity,
        ticket.confidence
        ));
        lines.push(format!(
            "- Breadth: {} runs / {} missions / {} agents",
            ticket.breadth.runs, ticket.breadth.missions, ticket.breadth.agents
        ));
        if !ticket.risks.is_empty() {
            lines.push(format!("- Risks: {}", ticket.risks.join(", ")));
        }
        lines.push(format!("- Fingerprint: `{}`", ticket.fingerprint));
        for atom_id in &ticket.evidence_atom_ids {
            lines.push(format!("- `{atom_id}`"));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Result of [`run_backlog_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// The compiled backlog.
    pub doc: BacklogDoc,
    /// Atom-action ledger after reconciliation (already persisted).
    pub atom_actions: AtomActions,
    /// Where the compiled artifacts were written.
    pub compiled_dir: PathBuf,
}

/// Compile a target's backlog.
///
/// Order matters: plan folders are reconciled into the ledger *before*
/// clustering so that freshly actioned atoms are excluded from this pass's
/// atoms JSONL and clustering input.
pub fn run_backlog_pipeline<E: Embedder + ?Sized>(
    opts: &PipelineOptions,
    embedder: &E,
) -> Result<PipelineOutput, BacklogError> {
    let generated_at = ft_core::utc_timestamp(opts.now);
    let compiled = compiled_dir(&opts.runs_dir, &opts.target_slug);

    // 1. History → atoms.
    let records: Vec<ft_history::RunRecord> = iter_report_history(
        &opts.runs_dir,
        Some(&opts.target_slug),
        EmbedLevel::None,
        200_000,
    )
    .collect();
    let mut atoms: Vec<Atom> = Vec::new();
    for record in &records {
        atoms.extend(extract_atoms(record));
    }
    let aggregates = build_aggregate_atoms(&records, &atoms);
    atoms.extend(aggregates);

    // 2. Ledger reconciliation: dequeues first, then active buckets.
    let ledger_path = compiled.join("atom_actions.yaml");
    let mut atom_actions = ledger::load_atom_actions(&ledger_path)?;
    plan_index::sync_atom_actions_from_dequeued_plan_folders(
        &mut atom_actions,
        &opts.owner_roots,
        &generated_at,
    );
    plan_index::sync_atom_actions_from_plan_folders(
        &mut atom_actions,
        &opts.owner_roots,
        &generated_at,
    );

    // 3. Cluster and gate.
    let doc = build_backlog(
        &opts.target_slug,
        &atoms,
        &atom_actions,
        embedder,
        &opts.policy,
        &generated_at,
    )?;

    // 4. Persist compiled artifacts. The atoms JSONL carries only atoms
    //    that entered clustering (actioned ones are gone).
    let eligible: Vec<&Atom> = atoms
        .iter()
        .filter(|atom| {
            atom_actions
                .get(&atom.atom_id)
                .is_none_or(|entry| entry.status != AtomStatus::Actioned)
        })
        .collect();
    write_atoms_jsonl(
        &compiled.join(format!("{}.backlog.atoms.jsonl", opts.target_slug)),
        &eligible,
    )?;
    let backlog_json = compiled.join(format!("{}.backlog.json", opts.target_slug));
    ft_core::io::write_json_pretty(&backlog_json, &doc)
        .map_err(|e| BacklogError::io(&backlog_json, e))?;
    let backlog_md = compiled.join(format!("{}.backlog.md", opts.target_slug));
    std::fs::write(&backlog_md, render_backlog_markdown(&doc))
        .map_err(|e| BacklogError::io(&backlog_md, e))?;

    ledger::store_atom_actions(&ledger_path, &atom_actions)?;

    Ok(PipelineOutput {
        doc,
        atom_actions,
        compiled_dir: compiled,
    })
}

/// Export a compiled backlog's tickets into an owner repo's plan folder,
/// persisting both ledgers and the export report.
pub fn run_export_pipeline(
    opts: &PipelineOptions,
    doc: &BacklogDoc,
    owner_root: &Path,
) -> Result<ExportReport, BacklogError> {
    let generated_at = ft_core::utc_timestamp(opts.now);
    let date = opts.now.format("%Y%m%d").to_string();
    let compiled = compiled_dir(&opts.runs_dir, &opts.target_slug);

    let atom_ledger_path = compiled.join("atom_actions.yaml");
    let ticket_ledger_path = compiled.join("ticket_actions.yaml");
    let mut atom_actions = ledger::load_atom_actions(&atom_ledger_path)?;
    let mut ticket_actions = ledger::load_ticket_actions(&ticket_ledger_path)?;

    let report = export_tickets(
        &doc.tickets,
        owner_root,
        &mut atom_actions,
        &mut ticket_actions,
        &date,
        &generated_at,
    )?;

    ledger::store_atom_actions(&atom_ledger_path, &atom_actions)?;
    ledger::store_ticket_actions(&ticket_ledger_path, &ticket_actions)?;

    let export_json = compiled.join(format!("{}.tickets_export.json", opts.target_slug));
    ft_core::io::write_json_pretty(&export_json, &report)
        .map_err(|e| BacklogError::io(&export_json, e))?;
    Ok(report)
}
