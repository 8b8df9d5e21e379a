// SPDX-License-Identifier: MIT OR Apache-2.0
//! Backlog building: cluster atoms, mint candidate tickets, and gate them.
//!
//! Stage gates encode who is allowed to become a ticket: high-surface
//! changes need breadth, sub-high severities need at least two runs, and
//! low severities additionally need two distinct models agreeing. The gate
//! order is fixed so the same inputs always land in the same stage.

use crate::BacklogError;
use crate::ledger::{AtomActions, AtomStatus};
use ft_atoms::{Atom, Severity};
use ft_triage::{
    ClusterOptions, Embedder, ItemSource, Theme, build_item_vectors, classify_themes,
    cluster_items_knn,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Ticket lifecycle stage inside the backlog (pre-export).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Parked for a human decision.
    Triage,
    /// Gated out by breadth or model diversity.
    Blocked,
    /// High-surface change that needs investigation first.
    ResearchRequired,
    /// Ready to be exported as an idea file.
    ReadyForTicket,
}

impl Stage {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Blocked => "blocked",
            Self::ResearchRequired => "research_required",
            Self::ReadyForTicket => "ready_for_ticket",
        }
    }
}

/// Evidence breadth of a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadth {
    /// Distinct runs cited.
    pub runs: usize,
    /// Distinct missions cited.
    pub missions: usize,
    /// Distinct targets cited.
    pub targets: usize,
    /// Distinct repo inputs cited.
    pub repo_inputs: usize,
    /// Distinct agents cited.
    pub agents: usize,
}

/// Change-surface classification of a ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSurface {
    /// Kind tags inferred from the evidence text.
    pub kinds: Vec<String>,
}

/// A candidate backlog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// `BLG-NNN`, assigned in output order.
    pub ticket_id: String,
    /// Representative atom text.
    pub title: String,
    /// Aggregated problem statement.
    pub problem: String,
    /// Max severity across the evidence.
    pub severity: Severity,
    /// Heuristic confidence in `[0, 1]`.
    pub confidence: f64,
    /// Atom ids backing the ticket.
    pub evidence_atom_ids: Vec<String>,
    /// Change-surface kinds.
    pub change_surface: ChangeSurface,
    /// Evidence breadth.
    pub breadth: Breadth,
    /// Distinct agents in the evidence.
    pub model_breadth: usize,
    /// Stage after gating.
    pub stage: Stage,
    /// Gate annotations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    /// Themes of the representative signal.
    pub themes: Vec<Theme>,
    /// Deterministic 16-hex fingerprint.
    pub fingerprint: String,
}

/// One cluster in the backlog output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// 1-based cluster id after sorting.
    pub id: usize,
    /// Member count.
    pub size: usize,
    /// Representative atom id (always a member).
    pub representative_atom_id: String,
    /// Representative text.
    pub representative_text: String,
    /// Member atom ids.
    pub atom_ids: Vec<String>,
    /// Tickets minted from this cluster.
    pub tickets_total: usize,
}

/// Stage-gate policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Kinds that count as high surface area.
    pub surface_area_high: Vec<String>,
    /// Minimum distinct runs for a high-surface ticket to skip research.
    pub min_breadth_for_high_surface: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            surface_area_high: vec![
                "core_behavior".to_string(),
                "public_api".to_string(),
                "data_format".to_string(),
            ],
            min_breadth_for_high_surface: 3,
        }
    }
}

/// The compiled backlog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogDoc {
    /// Always [`ft_core::SCHEMA_VERSION`].
    pub schema_version: u32,
    /// Generation timestamp (the only field allowed to differ between
    /// byte-identical reruns).
    pub generated_at_utc: String,
    /// Target slug the backlog was compiled for.
    pub target_slug: String,
    /// Totals block.
    pub totals: BacklogTotals,
    /// Clusters sorted by `(-tickets_total, -size,
    /// representative_atom_id)`.
    pub clusters: Vec<ClusterSummary>,
    /// Tickets in cluster order.
    pub tickets: Vec<Ticket>,
}

/// Totals block of a backlog document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogTotals {
    /// Atoms that entered clustering.
    pub atoms_total: usize,
    /// Atoms excluded because their ledger status is `actioned`.
    pub atoms_excluded_actioned: usize,
    /// Clusters produced.
    pub clusters_total: usize,
    /// Tickets minted.
    pub tickets_total: usize,
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Deterministic ticket fingerprint: SHA-256 of the canonical JSON of
/// `{title_tokens[:24], anchors[:24], kinds[:24], owner}`, first 16 hex.
pub fn ticket_fingerprint(
    title: &str,
    anchors: &[String],
    kinds: &[String],
    owner: &str,
) -> String {
    let mut title_tokens = ft_triage::text::tokenize(title);
    title_tokens.truncate(24);
    let mut anchors: Vec<String> = anchors.to_vec();
    anchors.sort();
    anchors.truncate(24);
    let mut kinds: Vec<String> = kinds.to_vec();
    kinds.sort();
    kinds.truncate(24);

    let canonical = serde_json::json!({
        "title_tokens": title_tokens,
        "anchors": anchors,
        "kinds": kinds,
        "owner": owner,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

// ---------------------------------------------------------------------------
// Kind inference
// ---------------------------------------------------------------------------

fn infer_kinds(texts: &[&str]) -> Vec<String> {
    let rules: &[(&str, &[&str])] = &[
        ("docs", &["readme", "docs", "documentation", "quickstart", "tutorial"]),
        ("cli_help", &["--help", "usage:", "subcommand", "cli"]),
        ("error_message", &["error message", "diagnostic", "traceback", "panic message"]),
        ("output_contract", &["schema", "report", "json output"]),
        ("public_api", &["api", "endpoint", "public interface"]),
        ("data_format", &["format", "serialization", "wire"]),
        ("core_behavior", &["behavior", "behaviour", "logic", "incorrect result", "wrong answer"]),
        ("environment", &["install", "dependency", "binary", "python", "docker"]),
    ];

    let mut kinds = Vec::new();
    for (kind, needles) in rules {
        let hit = texts.iter().any(|text| {
            let lower = text.to_lowercase();
            needles.iter().any(|needle| lower.contains(needle))
        });
        if hit && !kinds.contains(&(*kind).to_string()) {
            kinds.push((*kind).to_string());
        }
    }
    if kinds.is_empty() {
        kinds.push("unknown".to_string());
    }
    kinds
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Apply the stage-gate DAG in order. `labeled_ready` reflects the
/// per-ticket labeler quorum (when a labeler ran).
pub fn apply_stage_gates(ticket: &mut Ticket, policy: &GatePolicy, labeled_ready: bool) {
    let high_surface = ticket
        .change_surface
        .kinds
        .iter()
        .any(|kind| policy.surface_area_high.contains(kind));
    if high_surface && ticket.breadth.runs < policy.min_breadth_for_high_surface {
        ticket.stage = Stage::ResearchRequired;
        return;
    }

    if ticket.severity < Severity::High && ticket.breadth.runs < 2 {
        ticket.stage = Stage::Blocked;
        ticket
            .risks
            .push("insufficient_run_breadth_for_non_high_severity".to_string());
        return;
    }

    if ticket.severity == Severity::Low && ticket.model_breadth < 2 {
        ticket.stage = Stage::Blocked;
        ticket
            .risks
            .push("insufficient_model_breadth_for_low_severity".to_string());
        return;
    }

    ticket.stage = if labeled_ready {
        Stage::ReadyForTicket
    } else {
        Stage::Triage
    };
}

fn compute_breadth(atoms: &[&Atom]) -> Breadth {
    let mut runs = BTreeSet::new();
    let mut missions = BTreeSet::new();
    let mut targets = BTreeSet::new();
    let mut repo_inputs = BTreeSet::new();
    let mut agents = BTreeSet::new();
    for atom in atoms {
        runs.insert(atom.run_rel.clone());
        if let Some(mission) = &atom.mission_id {
            missions.insert(mission.clone());
        }
        if let Some(target) = atom.run_rel.split('/').next() {
            targets.insert(target.to_string());
        }
        if let Some(repo) = &atom.repo_input {
            repo_inputs.insert(repo.clone());
        }
        agents.insert(atom.agent.clone());
    }
    Breadth {
        runs: runs.len(),
        missions: missions.len(),
        targets: targets.len(),
        repo_inputs: repo_inputs.len(),
        agents: agents.len(),
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Build the backlog for one target from its atoms.
///
/// Atoms whose ledger status is `actioned` are excluded before clustering.
/// Clusters are sorted by `(-tickets_total, -size,
/// representative_atom_id)` and ticket ids are assigned in that order, so
/// reruns over unchanged inputs are byte-identical modulo
/// `generated_at_utc`.
pub fn build_backlog<E: Embedder + ?Sized>(
    target_slug: &str,
    atoms: &[Atom],
    atom_actions: &AtomActions,
    embedder: &E,
    policy: &GatePolicy,
    generated_at_utc: &str,
) -> Result<BacklogDoc, BacklogError> {
    let eligible: Vec<&Atom> = atoms
        .iter()
        .filter(|atom| {
            atom_actions
                .get(&atom.atom_id)
                .is_none_or(|entry| entry.status != AtomStatus::Actioned)
        })
        .collect();
    let excluded = atoms.len() - eligible.len();

    let sources: Vec<ItemSource> = eligible
        .iter()
        .map(|atom| ItemSource {
            title: atom.text.clone(),
            chunks: atom
                .evidence
                .iter()
                .chain(atom.location.iter())
                .cloned()
                .collect(),
            evidence_ids: vec![atom.atom_id.clone()],
        })
        .collect();

    let vectors = build_item_vectors(&sources, embedder, 12_000)?;
    let clusters = cluster_items_knn(&vectors, &ClusterOptions::default());

    struct BuiltCluster {
        representative_atom_id: String,
        representative_text: String,
        atom_ids: Vec<String>,
        size: usize,
        ticket: Option<Ticket>,
    }

    let mut built: Vec<BuiltCluster> = Vec::new();
    for members in &clusters {
        let member_atoms: Vec<&Atom> = members.iter().map(|&i| eligible[i]).collect();
        let representative = member_atoms[0];

        let severity = member_atoms
            .iter()
            .map(|a| a.severity_hint)
            .max()
            .unwrap_or(Severity::Low);
        let breadth = compute_breadth(&member_atoms);
        let model_breadth = breadth.agents;

        let texts: Vec<&str> = member_atoms.iter().map(|a| a.text.as_str()).collect();
        let kinds = infer_kinds(&texts);

        let multi = representative.source == ft_atoms::AtomSource::RunFailureEvent;
        let themes = classify_themes(&representative.text, multi);

        let anchors: Vec<String> =
            ft_triage::text::extract_path_anchors_from_chunks(texts.iter().copied());
        let fingerprint = ticket_fingerprint(&representative.text, &anchors, &kinds, "");

        // Confidence grows with corroboration and caps below certainty.
        let confidence =
            (0.35 + 0.15 * (member_atoms.len() as f64 - 1.0) + 0.1 * (breadth.runs as f64 - 1.0))
                .clamp(0.0, 0.95);

        let mut ticket = Ticket {
            ticket_id: String::new(),
            title: representative.text.clone(),
            problem: texts.join("\n"),
            severity,
            confidence,
            evidence_atom_ids: member_atoms.iter().map(|a| a.atom_id.clone()).collect(),
            change_surface: ChangeSurface { kinds },
            breadth,
            model_breadth,
            stage: Stage::Triage,
            risks: Vec::new(),
            themes,
            fingerprint,
        };
        apply_stage_gates(&mut ticket, policy, true);

        built.push(BuiltCluster {
            representative_atom_id: representative.atom_id.clone(),
            representative_text: representative.text.clone(),
            atom_ids: ticket.evidence_atom_ids.clone(),
            size: members.len(),
            ticket: Some(ticket),
        });
    }

    built.sort_by(|a, b| {
        let tickets_a = usize::from(a.ticket.is_some());
        let tickets_b = usize::from(b.ticket.is_some());
        tickets_b
            .cmp(&tickets_a)
            .then(b.size.cmp(&a.size))
            .then(a.representative_atom_id.cmp(&b.representative_atom_id))
    });

    let mut cluster_summaries = Vec::with_capacity(built.len());
    let mut tickets = Vec::new();
    for (idx, cluster) in built.into_iter().enumerate() {
        let tickets_total = usize::from(cluster.ticket.is_some());
        if let Some(mut ticket) = cluster.ticket {
            ticket.ticket_id = format!("BLG-{:03}", tickets.len() + 1);
            tickets.push(ticket);
        }
        cluster_summaries.push(ClusterSummary {
            id: idx + 1,
            size: cluster.size,
            representative_atom_id: cluster.representative_atom_id,
            representative_text: cluster.representative_text,
            atom_ids: cluster.atom_ids,
            tickets_total,
        });
    }

    Ok(BacklogDoc {
        schema_version: ft_core::SCHEMA_VERSION,
        generated_at_utc: generated_at_utc.to_string(),
        target_slug: target_slug.to_string(),
        totals: BacklogTotals {
            atoms_total: eligible.len(),
            atoms_excluded_actioned: excluded,
            clusters_total: cluster_summaries.len(),
            tickets_total: tickets.len(),
        },
        clusters: cluster_summaries,
        tickets,
    })
}

// ---------------------------------------------------------------------------
// Miner cache
// ---------------------------------------------------------------------------

/// One cached miner output under `backlog_artifacts/miner_NNN/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerCacheEntry {
    /// Fingerprint of the input manifest the miner ran against.
    pub input_fingerprint: String,
    /// Evidence atom ids the cached output cites.
    pub evidence_atom_ids: Vec<String>,
    /// Cached output payload.
    pub output: serde_json::Value,
    /// `fresh` when written; flipped to `dry_run` when unusable.
    #[serde(default)]
    pub status: String,
}

/// Fingerprint an input manifest (the eligible atom-id set).
pub fn input_manifest_fingerprint(atom_ids: &[String]) -> String {
    let mut sorted: Vec<&String> = atom_ids.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Decide whether a cached miner output may be reused: its evidence must be
/// a subset of the currently eligible atom ids and its input fingerprint
/// must match. Otherwise the entry is marked `dry_run` and ignored.
pub fn evaluate_miner_cache(
    entry: &mut MinerCacheEntry,
    eligible_atom_ids: &BTreeSet<String>,
    current_input_fingerprint: &str,
) -> bool {
    let evidence_subset = entry
        .evidence_atom_ids
        .iter()
        .all(|id| eligible_atom_ids.contains(id));
    if evidence_subset && entry.input_fingerprint == current_input_fingerprint {
        entry.status = "fresh".to_string();
        true
    } else {
        entry.status = "dry_run".to_string();
        false
    }
}
