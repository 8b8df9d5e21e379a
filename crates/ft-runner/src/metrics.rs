// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run metrics computed from the normalized event stream.
//!
//! Metric computation is best-effort: a failure writes `metrics.json` with
//! `{"metrics_error": "..."}` instead of failing the run.

use ft_core::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One failing command as recorded in metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCommand {
    /// Tokenized argv.
    pub argv: Vec<String>,
    /// Display form.
    pub command: String,
    /// Exit code.
    pub exit_code: i64,
    /// Inline output excerpt, when the adapter captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_excerpt: Option<String>,
}

/// Contents of `metrics.json` on the happy path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Event counts by type.
    pub events_by_type: BTreeMap<String, u64>,
    /// Total `run_command` events.
    pub commands_total: u64,
    /// Failing commands (ripgrep "no matches" excluded).
    pub failed_commands: Vec<FailedCommand>,
    /// Total `read_file` events.
    pub read_files_total: u64,
    /// Total `web_search` events.
    pub web_searches_total: u64,
    /// Total `agent_message` events.
    pub agent_messages_total: u64,
    /// Total adapter `error` events.
    pub adapter_errors_total: u64,
}

fn argv_of(event: &Event) -> Vec<String> {
    event
        .data
        .get("argv")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a failing command is ripgrep's "no matches" exit, which is a
/// search result, not a failure.
pub fn is_ripgrep_no_matches(argv: &[String], exit_code: i64, output_excerpt: Option<&str>) -> bool {
    if exit_code != 1 {
        return false;
    }
    let head = argv
        .first()
        .map(|a| {
            a.replace('\\', "/")
                .rsplit('/')
                .next()
                .unwrap_or("")
                .to_lowercase()
        })
        .unwrap_or_default();
    let is_rg = head == "rg" || head == "rg.exe" || head == "grep";
    is_rg && output_excerpt.is_none_or(|o| o.trim().is_empty())
}

/// Compute metrics from normalized events.
pub fn compute_metrics(events: &[Event]) -> RunMetrics {
    let mut metrics = RunMetrics::default();

    for event in events {
        *metrics
            .events_by_type
            .entry(event.kind.clone())
            .or_insert(0) += 1;

        match event.kind.as_str() {
            "run_command" => {
                metrics.commands_total += 1;
                let exit_code = event
                    .data
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if exit_code != 0 {
                    let argv = argv_of(event);
                    let output_excerpt = event
                        .data
                        .get("output_excerpt")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    if is_ripgrep_no_matches(&argv, exit_code, output_excerpt.as_deref()) {
                        continue;
                    }
                    let command = event
                        .data
                        .get("command")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| argv.join(" "));
                    metrics.failed_commands.push(FailedCommand {
                        argv,
                        command,
                        exit_code,
                        output_excerpt,
                    });
                }
            }
            "read_file" => metrics.read_files_total += 1,
            "web_search" => metrics.web_searches_total += 1,
            "agent_message" => metrics.agent_messages_total += 1,
            "error" => metrics.adapter_errors_total += 1,
            _ => {}
        }
    }

    metrics
}

/// Compute metrics, degrading to a `metrics_error` document on panic-free
/// failure paths (the compute itself is total; this wrapper exists for
/// callers that feed it freshly parsed artifacts).
pub fn compute_metrics_value(events: Result<Vec<Event>, impl std::fmt::Display>) -> Value {
    match events {
        Ok(events) => match serde_json::to_value(compute_metrics(&events)) {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "metrics_error": e.to_string() }),
        },
        Err(e) => serde_json::json!({ "metrics_error": e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ft_core::{EventKind, make_event};
    use serde_json::json;

    fn command_event(argv: &[&str], exit_code: i64, excerpt: Option<&str>) -> Event {
        let mut data = serde_json::Map::new();
        data.insert("argv".to_string(), json!(argv));
        data.insert("command".to_string(), json!(argv.join(" ")));
        data.insert("exit_code".to_string(), json!(exit_code));
        if let Some(excerpt) = excerpt {
            data.insert("output_excerpt".to_string(), json!(excerpt));
        }
        make_event(EventKind::RunCommand, data, None)
    }

    #[test]
    fn counts_by_type_and_failures() {
        let events = vec![
            command_event(&["cargo", "build"], 0, None),
            command_event(&["cargo", "test"], 101, Some("2 failed")),
            make_event(
                EventKind::ReadFile,
                [("path".to_string(), json!("README.md")), ("bytes".to_string(), json!(10))]
                    .into_iter()
                    .collect(),
                None,
            ),
        ];
        let metrics = compute_metrics(&events);
        assert_eq!(metrics.commands_total, 2);
        assert_eq!(metrics.failed_commands.len(), 1);
        assert_eq!(metrics.failed_commands[0].exit_code, 101);
        assert_eq!(metrics.read_files_total, 1);
        assert_eq!(metrics.events_by_type["run_command"], 2);
    }

    #[test]
    fn ripgrep_exit_one_without_output_is_not_a_failure() {
        let events = vec![command_event(&["rg", "TODO"], 1, None)];
        let metrics = compute_metrics(&events);
        assert!(metrics.failed_commands.is_empty());
    }

    #[test]
    fn ripgrep_exit_one_with_output_is_a_failure() {
        let events = vec![command_event(&["rg", "TODO"], 1, Some("error: bad pattern"))];
        let metrics = compute_metrics(&events);
        assert_eq!(metrics.failed_commands.len(), 1);
    }

    #[test]
    fn ripgrep_exit_two_is_a_failure() {
        let events = vec![command_event(&["rg", "--bogus"], 2, None)];
        let metrics = compute_metrics(&events);
        assert_eq!(metrics.failed_commands.len(), 1);
    }

    #[test]
    fn error_value_degrades_to_metrics_error() {
        let value =
            compute_metrics_value(Err::<Vec<Event>, _>("events file unreadable"));
        assert_eq!(value["metrics_error"], "events file unreadable");
    }
}
