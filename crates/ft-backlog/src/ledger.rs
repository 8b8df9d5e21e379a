// SPDX-License-Identifier: MIT OR Apache-2.0
//! Atom-action and ticket-action ledgers.
//!
//! YAML files that persist per-atom and per-ticket state across pipeline
//! runs. Writes are atomic (temp file + rename). Atom status moves
//! monotonically up the `new < queued < ticketed < actioned` lattice; the
//! single allowed demotion is `queued/ticketed → new` via an explicit
//! dequeue, and never from `actioned`.

use crate::BacklogError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Atom lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AtomStatus {
    /// Never cited by an exported ticket.
    #[default]
    New,
    /// Cited by a queued plan file.
    Queued,
    /// Cited by a ticket that has been cut.
    Ticketed,
    /// Cited by a plan in an actioned bucket.
    Actioned,
}

impl AtomStatus {
    /// Lattice rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Queued => 1,
            Self::Ticketed => 2,
            Self::Actioned => 3,
        }
    }

    /// Parse a wire string; unknown values read as `new`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "queued" => Self::Queued,
            "ticketed" => Self::Ticketed,
            "actioned" => Self::Actioned,
            _ => Self::New,
        }
    }
}

/// Monotonic promotion: the higher-ranked status wins.
pub fn promote_atom_status(current: AtomStatus, desired: AtomStatus) -> AtomStatus {
    if desired.rank() > current.rank() {
        desired
    } else {
        current
    }
}

/// One atom's ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AtomActionEntry {
    /// Current lifecycle status.
    #[serde(default)]
    pub status: AtomStatus,
    /// Tickets citing this atom.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ticket_ids: Vec<String>,
    /// Plan files citing this atom.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queue_paths: Vec<String>,
    /// Owner repo roots whose plans cite this atom.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queue_owner_roots: Vec<String>,
    /// Most recent plan bucket observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_plan_bucket: Option<String>,
    /// Ticket fingerprints citing this atom.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingerprints: Vec<String>,
    /// Dequeued plan files referencing this atom.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dequeued_paths: Vec<String>,
    /// Alternate IDs this entry was canonicalized from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_from_atom_ids: Vec<String>,
    /// First time the pipeline saw this atom.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_at: Option<String>,
    /// Last time the pipeline touched this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<String>,
}

/// One ticket's ledger entry, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TicketActionEntry {
    /// Ticket id at export time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    /// `exported`, `skipped_existing_plan`, `deferred`.
    #[serde(default)]
    pub resolution: String,
    /// Plan file written or matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<String>,
    /// When the resolution was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

/// Atom-action ledger: `atom_id → entry`.
pub type AtomActions = BTreeMap<String, AtomActionEntry>;
/// Ticket-action ledger: `fingerprint → entry`.
pub type TicketActions = BTreeMap<String, TicketActionEntry>;

/// Insert into a sorted-unique string list.
pub fn push_unique(list: &mut Vec<String>, value: impl Into<String>) {
    let value = value.into();
    if !list.contains(&value) {
        list.push(value);
        list.sort();
    }
}

fn load_yaml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T, BacklogError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path).map_err(|e| BacklogError::io(path, e))?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(&text).map_err(|e| {
        BacklogError::Ledger(format!("failed to parse {}: {e}", path.display()))
    })
}

fn store_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), BacklogError> {
    let body = serde_yaml::to_string(value)
        .map_err(|e| BacklogError::Ledger(format!("failed to serialize ledger: {e}")))?;
    ft_core::io::write_atomic(path, body.as_bytes()).map_err(|e| BacklogError::io(path, e))
}

/// Load the atom-action ledger (absent file reads as empty).
pub fn load_atom_actions(path: &Path) -> Result<AtomActions, BacklogError> {
    load_yaml(path)
}

/// Atomically persist the atom-action ledger.
pub fn store_atom_actions(path: &Path, actions: &AtomActions) -> Result<(), BacklogError> {
    store_yaml(path, actions)
}

/// Load the ticket-action ledger (absent file reads as empty).
pub fn load_ticket_actions(path: &Path) -> Result<TicketActions, BacklogError> {
    load_yaml(path)
}

/// Atomically persist the ticket-action ledger.
pub fn store_ticket_actions(path: &Path, actions: &TicketActions) -> Result<(), BacklogError> {
    store_yaml(path, actions)
}
