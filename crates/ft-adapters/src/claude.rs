// SPDX-License-Identifier: MIT OR Apache-2.0
//! Claude stream normalizer.
//!
//! Claude streams `{type: "assistant" | "user", message: {role, content:
//! [block]}}` envelopes. `tool_use` blocks are buffered by id and matched
//! with later `tool_result` blocks carrying `tool_use_id`; a result whose
//! use was never seen becomes an `error{category:"tool_result_missing_use"}`
//! event rather than being dropped.

use crate::command::{format_argv, split_command};
use crate::excerpt::excerpt_text;
use crate::paths::{map_sandbox_path_str, safe_relpath};
use crate::{AdapterContext, AdapterError, read_raw_lines};
use ft_core::{Event, EventKind, make_event, write_events_jsonl};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

struct ToolUse {
    name: String,
    input: Map<String, Value>,
}

fn coerce_tool_result_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let chunks: Vec<&str> = items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .collect();
            if chunks.is_empty() {
                None
            } else {
                Some(chunks.join("\n"))
            }
        }
        _ => None,
    }
}

fn tool_input_str<'a>(input: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn push_error(events: &mut Vec<Event>, category: &str, message: String) {
    let mut data = Map::new();
    data.insert("category".to_string(), json!(category));
    data.insert("message".to_string(), json!(message));
    events.push(make_event(EventKind::Error, data, None));
}

fn emit_tool_result(
    events: &mut Vec<Event>,
    tool_use: ToolUse,
    block: &Map<String, Value>,
    ctx: &AdapterContext,
) {
    let name = tool_use.name.trim().to_lowercase();
    let input = tool_use.input;
    let is_error = block
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    match name.as_str() {
        "bash" => {
            let Some(cmd) = tool_input_str(&input, &["command", "cmd"]) else {
                return;
            };
            let argv = split_command(cmd);
            let mut data = Map::new();
            data.insert("argv".to_string(), json!(argv));
            data.insert("command".to_string(), json!(format_argv(&argv)));
            data.insert("exit_code".to_string(), json!(if is_error { 1 } else { 0 }));
            if is_error {
                if let Some(output) = coerce_tool_result_text(block.get("content")) {
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
            events.push(make_event(EventKind::RunCommand, data, None));
        }
        "read" => {
            let Some(path_raw) = tool_input_str(&input, &["path", "file_path"]) else {
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
            events.push(make_event(EventKind::ReadFile, data, None));
        }
        "edit" | "write" | "grep" | "glob" => {
            let mut data = Map::new();
            data.insert("name".to_string(), json!(tool_use.name));
            data.insert("input".to_string(), Value::Object(input));
            data.insert("is_error".to_string(), json!(is_error));
            events.push(make_event(EventKind::ToolCall, data, None));
        }
        "websearch" | "web_search" => {
            if let Some(query) = tool_input_str(&input, &["query", "text"]) {
                let mut data = Map::new();
                data.insert("query".to_string(), json!(query.trim()));
                events.push(make_event(EventKind::WebSearch, data, None));
            }
        }
        _ => push_error(events, "unhandled_tool", tool_use.name),
    }
}

/// Normalize a Claude raw stream into canonical events.
pub fn normalize_claude_events(
    raw_events_path: &Path,
    normalized_events_path: &Path,
    ctx: &AdapterContext,
) -> Result<(), AdapterError> {
    let mut events: Vec<Event> = Vec::new();
    let mut tool_uses: HashMap<String, ToolUse> = HashMap::new();

    for (raw_line, payload) in read_raw_lines(raw_events_path)? {
        let Some(payload) = payload else {
            push_error(&mut events, "raw_non_json_line", raw_line);
            continue;
        };

        let obj_type = payload.get("type").and_then(Value::as_str).unwrap_or("");
        let Some(msg) = payload.get("message").and_then(Value::as_object) else {
            continue;
        };
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("");
        let Some(content) = msg.get("content").and_then(Value::as_array) else {
            continue;
        };

        for block in content {
            let Some(block) = block.as_object() else { continue };
            let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");

            if obj_type == "assistant" && role == "assistant" && block_type == "text" {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        let mut data = Map::new();
                        data.insert("kind".to_string(), json!("message"));
                        data.insert("text".to_string(), json!(text));
                        events.push(make_event(EventKind::AgentMessage, data, None));
                    }
                }
                continue;
            }

            if block_type == "tool_use" {
                let id = block.get("id").and_then(Value::as_str).unwrap_or("");
                let name = block.get("name").and_then(Value::as_str);
                if let (false, Some(name)) = (id.is_empty(), name) {
                    let input = block
                        .get("input")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    tool_uses.insert(
                        id.to_string(),
                        ToolUse {
                            name: name.to_string(),
                            input,
                        },
                    );
                }
                continue;
            }

            if block_type != "tool_result" {
                continue;
            }

            let tool_use_id = block
                .get("tool_use_id")
                .or_else(|| block.get("id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if tool_use_id.is_empty() {
                continue;
            }

            match tool_uses.remove(tool_use_id) {
                Some(tool_use) => emit_tool_result(&mut events, tool_use, block, ctx),
                None => push_error(
                    &mut events,
                    "tool_result_missing_use",
                    format!("tool_use_id={tool_use_id}"),
                ),
            }
        }
    }

    write_events_jsonl(normalized_events_path, &events).map_err(|e| AdapterError::Io {
        path: normalized_events_path.display().to_string(),
        source: std::io::Error::other(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ft_core::iter_events_jsonl;
    use std::path::PathBuf;

    fn normalize(raw_lines: &[String], ctx: &AdapterContext) -> Vec<Event> {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw_events.jsonl");
        std::fs::write(&raw, raw_lines.join("\n") + "\n").unwrap();
        let normalized = dir.path().join("normalized_events.jsonl");
        normalize_claude_events(&raw, &normalized, ctx).unwrap();
        iter_events_jsonl(&normalized).unwrap()
    }

    fn assistant_blocks(blocks: Value) -> String {
        json!({"type": "assistant",
            "message": {"role": "assistant", "content": blocks}})
        .to_string()
    }

    fn user_blocks(blocks: Value) -> String {
        json!({"type": "user", "message": {"role": "user", "content": blocks}}).to_string()
    }

    #[test]
    fn text_blocks_become_agent_messages() {
        let events = normalize(
            &[assistant_blocks(json!([{"type": "text", "text": "inspecting the repo"}]))],
            &AdapterContext::default(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "agent_message");
        assert_eq!(events[0].data["text"], json!("inspecting the repo"));
    }

    #[test]
    fn bash_tool_use_result_pair_becomes_run_command() {
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "t1", "name": "bash",
                    "input": {"command": "cargo check"}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "t1",
                    "is_error": false, "content": "ok"}])),
            ],
            &AdapterContext::default(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "run_command");
        assert_eq!(events[0].data["argv"], json!(["cargo", "check"]));
        assert_eq!(events[0].data["exit_code"], json!(0));
    }

    #[test]
    fn failing_bash_result_records_excerpt() {
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "t2", "name": "bash",
                    "input": {"command": "cargo test"}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "t2",
                    "is_error": true, "content": "error[E0599]: no method"}])),
            ],
            &AdapterContext::default(),
        );
        assert_eq!(events[0].data["exit_code"], json!(1));
        assert!(
            events[0].data["output_excerpt"]
                .as_str()
                .unwrap()
                .contains("E0599")
        );
    }

    #[test]
    fn orphan_tool_result_is_an_error_event() {
        let events = normalize(
            &[user_blocks(json!([{"type": "tool_result", "tool_use_id": "ghost"}]))],
            &AdapterContext::default(),
        );
        assert_eq!(events[0].kind, "error");
        assert_eq!(events[0].data["category"], json!("tool_result_missing_use"));
        assert_eq!(events[0].data["message"], json!("tool_use_id=ghost"));
    }

    #[test]
    fn read_tool_maps_sandbox_path_and_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "# hi\n").unwrap();
        let ctx = AdapterContext {
            workspace_root: Some(dir.path().to_path_buf()),
            workspace_mount: Some("/workspace".to_string()),
        };
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "r1", "name": "read",
                    "input": {"file_path": "/workspace/README.md"}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "r1"}])),
            ],
            &ctx,
        );
        assert_eq!(events[0].kind, "read_file");
        assert_eq!(events[0].data["path"], json!("README.md"));
        assert_eq!(events[0].data["bytes"], json!(5));
    }

    #[test]
    fn missing_read_target_keeps_raw_path_with_unknown_size() {
        let ctx = AdapterContext {
            workspace_root: Some(PathBuf::from("/nonexistent-root")),
            workspace_mount: None,
        };
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "r2", "name": "read",
                    "input": {"path": "/tmp/gone.txt"}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "r2"}])),
            ],
            &ctx,
        );
        assert_eq!(events[0].data["bytes"], json!(-1));
        assert_eq!(events[0].data["path"], json!("/tmp/gone.txt"));
    }

    #[test]
    fn edit_and_grep_map_to_tool_call() {
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "e1", "name": "Edit",
                    "input": {"file_path": "src/lib.rs"}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "e1"}])),
                assistant_blocks(json!([{"type": "tool_use", "id": "g1", "name": "grep",
                    "input": {"pattern": "fn main"}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "g1"}])),
            ],
            &AdapterContext::default(),
        );
        assert_eq!(events[0].kind, "tool_call");
        assert_eq!(events[0].data["name"], json!("Edit"));
        assert_eq!(events[1].kind, "tool_call");
    }

    #[test]
    fn websearch_maps_to_web_search() {
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "w1", "name": "websearch",
                    "input": {"query": "  tokio select  "}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "w1"}])),
            ],
            &AdapterContext::default(),
        );
        assert_eq!(events[0].kind, "web_search");
        assert_eq!(events[0].data["query"], json!("tokio select"));
    }

    #[test]
    fn unknown_tool_is_reported() {
        let events = normalize(
            &[
                assistant_blocks(json!([{"type": "tool_use", "id": "u1", "name": "Telepathy",
                    "input": {}}])),
                user_blocks(json!([{"type": "tool_result", "tool_use_id": "u1"}])),
            ],
            &AdapterContext::default(),
        );
        assert_eq!(events[0].data["category"], json!("unhandled_tool"));
        assert_eq!(events[0].data["message"], json!("Telepathy"));
    }
}
