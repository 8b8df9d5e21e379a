// SPDX-License-Identifier: MIT OR Apache-2.0
//! The canonical `{ts, type, data}` event envelope.
//!
//! Adapters translate agent-native streams into this shape; everything
//! downstream consumes it. The set of recognized kinds is closed, but the
//! envelope itself round-trips unknown `type` strings and arbitrary `data`
//! payloads so newer artifacts stay readable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// One normalized agent event.
///
/// `ts` is an ISO-8601 instant when the adapter could recover one, otherwise
/// `null`. Line order in `normalized_events.jsonl` preserves agent temporal
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// ISO-8601 timestamp or null.
    pub ts: Option<String>,
    /// Event kind; see [`EventKind`] for the recognized set.
    #[serde(rename = "type")]
    pub kind: String,
    /// Open payload. Shape depends on the kind.
    pub data: Map<String, Value>,
}

/// The closed set of event kinds consumers are expected to handle.
///
/// Unknown kinds may appear in artifacts written by newer adapters;
/// consumers ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Agent prose (`kind: "message" | "observation"`).
    AgentMessage,
    /// A shell command the agent executed.
    RunCommand,
    /// A file the agent read.
    ReadFile,
    /// Any other tool invocation (edit, write, grep, glob, ...).
    ToolCall,
    /// A web search query.
    WebSearch,
    /// Adapter-level failure (non-JSON line, orphan tool result, ...).
    Error,
}

impl EventKind {
    /// Stable wire string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentMessage => "agent_message",
            Self::RunCommand => "run_command",
            Self::ReadFile => "read_file",
            Self::ToolCall => "tool_call",
            Self::WebSearch => "web_search",
            Self::Error => "error",
        }
    }

    /// Parse a wire string; `None` for unrecognized kinds.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent_message" => Some(Self::AgentMessage),
            "run_command" => Some(Self::RunCommand),
            "read_file" => Some(Self::ReadFile),
            "tool_call" => Some(Self::ToolCall),
            "web_search" => Some(Self::WebSearch),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from event JSONL reading and writing.
#[derive(Debug, Error)]
pub enum EventError {
    /// Underlying filesystem failure.
    #[error("event io failure at {path}: {source}")]
    Io {
        /// File being read or written.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A line that is present but not valid JSON.
    #[error("invalid event json at {path}:{line}: {message}")]
    InvalidJson {
        /// File being read.
        path: String,
        /// 1-based line number.
        line: usize,
        /// Parser message.
        message: String,
    },
}

/// Construct an event envelope.
pub fn make_event(kind: EventKind, data: Map<String, Value>, ts: Option<String>) -> Event {
    Event {
        ts,
        kind: kind.as_str().to_string(),
        data,
    }
}

/// Write events as UTF-8 JSONL: one compact object per line, LF endings.
pub fn write_events_jsonl(path: &Path, events: &[Event]) -> Result<(), EventError> {
    let io_err = |source| EventError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = File::create(path).map_err(io_err)?;
    let mut out = BufWriter::new(file);
    for event in events {
        let line = serde_json::to_string(event).map_err(|e| EventError::Io {
            path: path.display().to_string(),
            source: std::io::Error::other(e),
        })?;
        out.write_all(line.as_bytes()).map_err(io_err)?;
        out.write_all(b"\n").map_err(io_err)?;
    }
    out.flush().map_err(io_err)
}

/// Read events back from JSONL. Blank lines are ignored.
pub fn iter_events_jsonl(path: &Path) -> Result<Vec<Event>, EventError> {
    let file = File::open(path).map_err(|source| EventError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| EventError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event =
            serde_json::from_str(&line).map_err(|e| EventError::InvalidJson {
                path: path.display().to_string(),
                line: idx + 1,
                message: e.to_string(),
            })?;
        events.push(event);
    }
    Ok(events)
}
