// SPDX-License-Identifier: MIT OR Apache-2.0
//! Gemini stream normalizer.
//!
//! Gemini emits flat JSONL events: `content` / `thought` text, and
//! `tool_call` / `tool_result` pairs joined by `id`. Tool names differ from
//! the other agents (`run_shell_command`, `read_file`, `google_web_search`,
//! `replace`, `write_file`) and are normalized before translation.

use crate::command::{format_argv, split_command};
use crate::excerpt::excerpt_text;
use crate::paths::{map_sandbox_path_str, safe_relpath};
use crate::{AdapterContext, AdapterError, read_raw_lines};
use ft_core::{Event, EventKind, make_event, write_events_jsonl};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

/// Canonical family a Gemini tool maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolFamily {
    Shell,
    Read,
    WebSearch,
    Mutation,
    Unknown,
}

fn classify_tool(name: &str) -> ToolFamily {
    match name.trim().to_lowercase().as_str() {
        "run_shell_command" | "shell" | "bash" => ToolFamily::Shell,
        "read_file" | "read_many_files" | "read" => ToolFamily::Read,
        "google_web_search" | "web_search" | "websearch" => ToolFamily::WebSearch,
        "replace" | "write_file" | "edit" | "glob" | "grep" | "search_file_content" => {
            ToolFamily::Mutation
        }
        _ => ToolFamily::Unknown,
    }
}

struct PendingCall {
    name: String,
    args: Map<String, Value>,
}

fn args_str<'a>(args: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| args.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn push_error(events: &mut Vec<Event>, category: &str, message: String) {
    let mut data = Map::new();
    data.insert("category".to_string(), json!(category));
    data.insert("message".to_string(), json!(message));
    events.push(make_event(EventKind::Error, data, None));
}

fn push_text(events: &mut Vec<Event>, kind: &str, text: &str, ts: Option<String>) {
    if text.is_empty() {
        return;
    }
    let mut data = Map::new();
    data.insert("kind".to_string(), json!(kind));
    data.insert("text".to_string(), json!(text));
    events.push(make_event(EventKind::AgentMessage, data, ts));
}

fn emit_joined(
    events: &mut Vec<Event>,
    call: PendingCall,
    result: &Map<String, Value>,
    ctx: &AdapterContext,
    ts: Option<String>,
) {
    let is_error = result
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("error"))
        || result.get("error").is_some();

    match classify_tool(&call.name) {
        ToolFamily::Shell => {
            let Some(cmd) = args_str(&call.args, &["command", "cmd"]) else {
                return;
            };
            let argv = split_command(cmd);
            let mut data = Map::new();
            data.insert("argv".to_string(), json!(argv));
            data.insert("command".to_string(), json!(format_argv(&argv)));
            let exit_code = result
                .get("exit_code")
                .and_then(Value::as_i64)
                .unwrap_or(if is_error { 1 } else { 0 });
            data.insert("exit_code".to_string(), json!(exit_code));
            if exit_code != 0 {
                if let Some(output) = result.get("output").and_then(Value::as_str) {
                    let trimmed = output.trim();
                    if !trimmed.is_empty() {
                        let (excerpt, truncated) = excerpt_text(trimmed);
                        data.insert("output_excerpt".to_string(), json!(excerpt));
                        if truncated {
                            data.insert("output_excerpt_truncated".to_string(), json!(true));
                        }
                    }
                }
            }
            events.push(make_event(EventKind::RunCommand, data, ts));
        }
        ToolFamily::Read => {
            let Some(path_raw) = args_str(&call.args, &["path", "file_path", "absolute_path"])
            else {
                return;
            };
            let path_str = path_raw.trim();
            let mut bytes: i64 = -1;
            let mut out_path = path_str.to_string();
            if let Some(root) = &ctx.workspace_root {
                let candidate =
                    map_sandbox_path_str(path_str, root, ctx.workspace_mount.as_deref());
                let candidate = if candidate.is_absolute() {
                    candidate
                } else {
                    root.join(candidate)
                };
                if candidate.is_file() {
                    bytes = std::fs::metadata(&candidate)
                        .map(|m| m.len() as i64)
                        .unwrap_or(-1);
                    out_path = safe_relpath(&candidate, root);
                }
            }
            let mut data = Map::new();
            data.insert("path".to_string(), json!(out_path));
            data.insert("bytes".to_string(), json!(bytes));
            events.push(make_event(EventKind::ReadFile, data, ts));
        }
        ToolFamily::WebSearch => {
            if let Some(query) = args_str(&call.args, &["query", "text"]) {
                let mut data = Map::new();
                data.insert("query".to_string(), json!(query.trim()));
                events.push(make_event(EventKind::WebSearch, data, ts));
            }
        }
        ToolFamily::Mutation => {
            let mut data = Map::new();
            data.insert("name".to_string(), json!(call.name));
            data.insert("input".to_string(), Value::Object(call.args));
            data.insert("is_error".to_string(), json!(is_error));
            events.push(make_event(EventKind::ToolCall, data, ts));
        }
        ToolFamily::Unknown => push_error(events, "unhandled_tool", call.name),
    }
}

/// Normalize a Gemini raw stream into canonical events.
pub fn normalize_gemini_events(
    raw_events_path: &Path,
    normalized_events_path: &Path,
    ctx: &AdapterContext,
) -> Result<(), AdapterError> {
    let mut events: Vec<Event> = Vec::new();
    let mut pending: HashMap<String, PendingCall> = HashMap::new();

    for (raw_line, payload) in read_raw_lines(raw_events_path)? {
        let Some(payload) = payload else {
            push_error(&mut events, "raw_non_json_line", raw_line);
            continue;
        };
        let ts = payload
            .get("ts")
            .and_then(Value::as_str)
            .map(str::to_string);

        match payload.get("type").and_then(Value::as_str).unwrap_or("") {
            "content" => {
                if let Some(text) = payload.get("text").and_then(Value::as_str) {
                    push_text(&mut events, "message", text, ts);
                }
            }
            "thought" => {
                if let Some(text) = payload.get("text").and_then(Value::as_str) {
                    push_text(&mut events, "observation", text, ts);
                }
            }
            "tool_call" => {
                let id = payload.get("id").and_then(Value::as_str).unwrap_or("");
                let name = payload.get("name").and_then(Value::as_str);
                if let (false, Some(name)) = (id.is_empty(), name) {
                    let args = payload
                        .get("args")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    pending.insert(
                        id.to_string(),
                        PendingCall {
                            name: name.to_string(),
                            args,
                        },
                    );
                }
            }
            "tool_result" => {
                let id = payload.get("id").and_then(Value::as_str).unwrap_or("");
                if id.is_empty() {
                    continue;
                }
                let Some(result) = payload.as_object() else { continue };
                match pending.remove(id) {
                    Some(call) => emit_joined(&mut events, call, result, ctx, ts),
                    None => push_error(
                        &mut events,
                        "tool_result_missing_use",
                        format!("tool_use_id={id}"),
                    ),
                }
            }
            _ => {}
        }
    }

    write_events_jsonl(normalized_events_path, &events).map_err(|e| AdapterError::Io {
        path: normalized_events_path.display().to_string(),
        source: std::io::Error::other(e),
    })
}
