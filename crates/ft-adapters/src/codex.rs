// SPDX-License-Identifier: MIT OR Apache-2.0
//! Codex stream normalizer.
//!
//! Codex emits two stream shapes, sometimes interleaved:
//!
//! * `{msg: {type: "exec_command_begin" | "exec_command_end", call_id, ...}}`
//!   where begin/end pairs are joined by `call_id`. A lone `end` still
//!   produces an event from its own argv.
//! * `{type: "item.completed", item: {...}}` where commands arrive as a
//!   single string and must be tokenized.

use crate::command::{
    READLIKE_COMMANDS, format_argv, maybe_unwrap_shell_command, split_chain_segments,
    split_command,
};
use crate::excerpt::{excerpt_text, join_streams};
use crate::failure::{CommandFailure, write_command_failure_artifacts};
use crate::paths::{
    map_sandbox_path_str, maybe_windows_drive_posix_path, render_path, safe_relpath,
    strip_windows_extended_prefix,
};
use crate::{AdapterContext, AdapterError, read_raw_lines};
use ft_core::{Event, EventKind, make_event, write_events_jsonl};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

struct CallContext {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
}

fn payload_ts(payload: &Value) -> Option<String> {
    payload
        .get("ts")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let arr = value?.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(item.as_str()?.to_string());
    }
    Some(out)
}

fn map_cwd(cwd_raw: &str, ctx: &AdapterContext) -> PathBuf {
    match (&ctx.workspace_root, &ctx.workspace_mount) {
        (Some(root), Some(mount)) => map_sandbox_path_str(cwd_raw, root, Some(mount)),
        _ => PathBuf::from(strip_windows_extended_prefix(cwd_raw)),
    }
}

fn resolve_candidate_path(token: &str, base_dir: &Path, ctx: &AdapterContext) -> Option<PathBuf> {
    if token.starts_with('/') {
        if let Some(win) = maybe_windows_drive_posix_path(token) {
            return Some(win);
        }
        if let (Some(root), Some(mount)) = (&ctx.workspace_root, &ctx.workspace_mount) {
            return Some(map_sandbox_path_str(token, root, Some(mount)));
        }
        return Some(PathBuf::from(token));
    }
    let p = PathBuf::from(token);
    Some(if p.is_absolute() { p } else { base_dir.join(p) })
}

fn infer_read_candidate_paths(
    argv: &[String],
    cwd: Option<&Path>,
    ctx: &AdapterContext,
) -> Vec<PathBuf> {
    let Some(root) = &ctx.workspace_root else {
        return Vec::new();
    };

    let mut effective_cwd = cwd.map(Path::to_path_buf).unwrap_or_else(|| root.clone());
    let mut candidates = Vec::new();

    for segment in split_chain_segments(argv) {
        let Some(head) = segment.first() else { continue };
        let cmd = head.to_lowercase();

        if cmd == "cd" {
            if let Some(target) = segment.get(1) {
                if let Some(resolved) = resolve_candidate_path(target, &effective_cwd, ctx) {
                    effective_cwd = resolved;
                }
            }
            continue;
        }

        if !READLIKE_COMMANDS.contains(cmd.as_str()) {
            continue;
        }

        for token in &segment[1..] {
            if token.is_empty() || token.starts_with('-') {
                continue;
            }
            if let Some(candidate) = resolve_candidate_path(token, &effective_cwd, ctx) {
                candidates.push(candidate);
            }
        }
    }

    candidates
}

fn read_events_for(argv: &[String], cwd: Option<&Path>, ctx: &AdapterContext, ts: Option<&str>) -> Vec<Event> {
    let Some(root) = &ctx.workspace_root else {
        return Vec::new();
    };
    infer_read_candidate_paths(argv, cwd, ctx)
        .into_iter()
        .filter(|candidate| candidate.is_file())
        .map(|candidate| {
            let bytes = std::fs::metadata(&candidate).map(|m| m.len()).unwrap_or(0);
            let mut data = Map::new();
            data.insert("path".to_string(), json!(safe_relpath(&candidate, root)));
            data.insert("bytes".to_string(), json!(bytes));
            make_event(EventKind::ReadFile, data, ts.map(str::to_string))
        })
        .collect()
}

struct CommandEmission<'a> {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    exit_code: i64,
    stdout: Option<&'a str>,
    stderr: Option<&'a str>,
    duration: Option<&'a Value>,
}

fn emit_run_command(
    emission: CommandEmission<'_>,
    run_dir: &Path,
    failure_index: &mut usize,
    ts: Option<&str>,
) -> Result<Event, AdapterError> {
    let command = format_argv(&emission.argv);
    let mut data = Map::new();
    data.insert("argv".to_string(), json!(emission.argv));
    data.insert("command".to_string(), json!(command));
    data.insert("exit_code".to_string(), json!(emission.exit_code));
    if let Some(cwd) = &emission.cwd {
        data.insert("cwd".to_string(), json!(render_path(cwd)));
    }

    if emission.exit_code != 0 {
        *failure_index += 1;
        let refs = write_command_failure_artifacts(
            run_dir,
            *failure_index,
            &CommandFailure {
                command: &command,
                argv: &emission.argv,
                cwd: emission.cwd.as_deref().map(render_path).as_deref(),
                exit_code: emission.exit_code as i32,
                stdout_text: emission.stdout.unwrap_or(""),
                stderr_text: emission.stderr.unwrap_or(""),
                duration: emission.duration,
            },
        )?;
        data.insert("failure_artifacts".to_string(), Value::Object(refs));

        let output = join_streams(emission.stdout, emission.stderr);
        if !output.is_empty() {
            let (excerpt, truncated) = excerpt_text(&output);
            data.insert("output_excerpt".to_string(), json!(excerpt));
            if truncated {
                data.insert("output_excerpt_truncated".to_string(), json!(true));
            }
        }
    }

    Ok(make_event(EventKind::RunCommand, data, ts.map(str::to_string)))
}

/// Normalize a Codex raw stream into canonical events.
///
/// Per-failing-command artifacts are written into the normalized stream's
/// parent directory.
pub fn normalize_codex_events(
    raw_events_path: &Path,
    normalized_events_path: &Path,
    ctx: &AdapterContext,
) -> Result<(), AdapterError> {
    let run_dir = normalized_events_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut events: Vec<Event> = Vec::new();
    let mut call_ctx: HashMap<String, CallContext> = HashMap::new();
    let mut failure_index = 0usize;

    for (raw_line, payload) in read_raw_lines(raw_events_path)? {
        let Some(payload) = payload else {
            let mut data = Map::new();
            data.insert("category".to_string(), json!("raw_non_json_line"));
            data.insert("message".to_string(), json!(raw_line));
            events.push(make_event(EventKind::Error, data, None));
            continue;
        };
        let ts = payload_ts(&payload);

        if let Some(msg) = payload.get("msg").and_then(Value::as_object) {
            let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or("");
            match msg_type {
                "agent_message" => {
                    if let Some(text) = msg.get("message").and_then(Value::as_str) {
                        let mut data = Map::new();
                        data.insert("kind".to_string(), json!("message"));
                        data.insert("text".to_string(), json!(text));
                        events.push(make_event(EventKind::AgentMessage, data, ts));
                    }
                }
                "agent_reasoning" => {
                    if let Some(text) = msg.get("text").and_then(Value::as_str) {
                        let mut data = Map::new();
                        data.insert("kind".to_string(), json!("observation"));
                        data.insert("text".to_string(), json!(text));
                        events.push(make_event(EventKind::AgentMessage, data, ts));
                    }
                }
                "exec_command_begin" => {
                    let Some(call_id) = msg.get("call_id").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some(argv) = string_list(msg.get("command")) else {
                        continue;
                    };
                    let cwd = msg
                        .get("cwd")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(|raw| map_cwd(raw, ctx));
                    call_ctx.insert(call_id.to_string(), CallContext { argv, cwd });
                }
                "exec_command_end" => {
                    let stored = msg
                        .get("call_id")
                        .and_then(Value::as_str)
                        .and_then(|id| call_ctx.remove(id));

                    let (mut argv, mut cwd) = match stored {
                        Some(CallContext { argv, cwd }) => (Some(argv), cwd),
                        None => (None, None),
                    };
                    if argv.is_none() {
                        argv = string_list(msg.get("command"));
                    }
                    if cwd.is_none() {
                        cwd = msg
                            .get("cwd")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(|raw| map_cwd(raw, ctx));
                    }
                    let Some(argv) = argv else { continue };
                    let argv = maybe_unwrap_shell_command(argv);

                    let exit_code = msg.get("exit_code").and_then(Value::as_i64).unwrap_or(-1);
                    let stdout = msg.get("stdout").and_then(Value::as_str);
                    let stderr = msg.get("stderr").and_then(Value::as_str);
                    let duration = msg.get("duration").filter(|v| v.is_object());

                    events.push(emit_run_command(
                        CommandEmission {
                            argv: argv.clone(),
                            cwd: cwd.clone(),
                            exit_code,
                            stdout,
                            stderr,
                            duration,
                        },
                        &run_dir,
                        &mut failure_index,
                        ts.as_deref(),
                    )?);
                    events.extend(read_events_for(&argv, cwd.as_deref(), ctx, ts.as_deref()));
                }
                _ => {}
            }
            continue;
        }

        if payload.get("type").and_then(Value::as_str) != Some("item.completed") {
            continue;
        }
        let Some(item) = payload.get("item").and_then(Value::as_object) else {
            continue;
        };

        match item.get("type").and_then(Value::as_str).unwrap_or("") {
            "reasoning" => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        let mut data = Map::new();
                        data.insert("kind".to_string(), json!("observation"));
                        data.insert("text".to_string(), json!(text));
                        events.push(make_event(EventKind::AgentMessage, data, ts));
                    }
                }
            }
            "agent_message" => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        let mut data = Map::new();
                        data.insert("kind".to_string(), json!("message"));
                        data.insert("text".to_string(), json!(text));
                        events.push(make_event(EventKind::AgentMessage, data, ts));
                    }
                }
            }
            "command_execution" => {
                let Some(cmd) = item
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                else {
                    continue;
                };
                let argv = maybe_unwrap_shell_command(split_command(cmd));

                let exit_code = match item.get("exit_code").and_then(Value::as_i64) {
                    Some(code) => code,
                    None => {
                        let failed = item
                            .get("status")
                            .and_then(Value::as_str)
                            .is_some_and(|s| s.eq_ignore_ascii_case("failed"));
                        if failed { 1 } else { -1 }
                    }
                };

                let stdout = item
                    .get("stdout")
                    .and_then(Value::as_str)
                    .or_else(|| item.get("output").and_then(Value::as_str));
                let stderr = item.get("stderr").and_then(Value::as_str);

                events.push(emit_run_command(
                    CommandEmission {
                        argv: argv.clone(),
                        cwd: None,
                        exit_code,
                        stdout,
                        stderr,
                        duration: None,
                    },
                    &run_dir,
                    &mut failure_index,
                    ts.as_deref(),
                )?);
                events.extend(read_events_for(&argv, None, ctx, ts.as_deref()));
            }
            _ => {}
        }
    }

    write_events_jsonl(normalized_events_path, &events).map_err(|e| AdapterError::Io {
        path: normalized_events_path.display().to_string(),
        source: std::io::Error::other(e),
    })
}
