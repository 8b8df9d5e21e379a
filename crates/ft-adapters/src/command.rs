// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command tokenization and reassembly.
//!
//! Two constraints shape this module:
//!
//! 1. Codex often wraps commands in a POSIX shell (`bash -lc "..."`) even on
//!    Windows hosts, so POSIX splitting is the right default.
//! 2. Windows absolute paths (`C:\Python313\python.exe`) must survive
//!    tokenization and reassembly exactly; POSIX backslash-escape handling
//!    would collapse them to `C:Python313python.exe`.
//!
//! Commands containing a backslash therefore take a quote-aware,
//! backslash-literal splitter instead of `shlex`.

use std::collections::HashSet;
use std::sync::LazyLock;

/// Command heads treated as file reads when inferring `read_file` events.
pub static READLIKE_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "cat", "type", "sed", "find", "findstr", "rg", "grep", "more", "head", "tail",
    ]
    .into_iter()
    .collect()
});

const CHAIN_OPERATORS: [&str; 4] = ["&&", ";", "||", "|"];

/// Split a command string into argv tokens.
///
/// POSIX rules via `shlex` for commands without backslashes; a
/// backslash-literal splitter otherwise. Falls back to whitespace splitting
/// when quoting is unbalanced.
pub fn split_command(command: &str) -> Vec<String> {
    if !command.contains('\\') {
        if let Some(tokens) = shlex::split(command) {
            return tokens;
        }
    }
    match split_non_posix(command) {
        Some(tokens) => tokens,
        None => command.split_whitespace().map(str::to_string).collect(),
    }
}

/// Quote-aware split that keeps backslashes literal. Surrounding single or
/// double quotes group tokens but are not retained. `None` on unbalanced
/// quoting.
fn split_non_posix(command: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut saw_any = false;

    for ch in command.chars() {
        match in_quote {
            Some(q) => {
                if ch == q {
                    in_quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '"' | '\'' => {
                    in_quote = Some(ch);
                    saw_any = true;
                }
                c if c.is_whitespace() => {
                    if saw_any {
                        tokens.push(std::mem::take(&mut current));
                        saw_any = false;
                    }
                }
                c => {
                    current.push(c);
                    saw_any = true;
                }
            },
        }
    }
    if in_quote.is_some() {
        return None;
    }
    if saw_any {
        tokens.push(current);
    }
    Some(tokens)
}

/// Reassemble argv into a display command string.
///
/// Tokens containing whitespace or quotes are wrapped in double quotes with
/// embedded quotes doubled; backslashes are never escaped, so Windows paths
/// round-trip byte-for-byte.
pub fn format_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() {
                "\"\"".to_string()
            } else if arg.chars().any(|c| c.is_whitespace() || c == '"') {
                format!("\"{}\"", arg.replace('"', "\"\""))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unwrap one level of shell wrapper:
/// `bash|sh -lc|-c`, `cmd[.exe] /c`, `powershell|pwsh -Command|-c`.
///
/// The inner command is re-tokenized; an empty inner command leaves the argv
/// unchanged.
pub fn maybe_unwrap_shell_command(argv: Vec<String>) -> Vec<String> {
    if argv.len() < 3 {
        return argv;
    }

    let exe = argv[0].replace('\\', "/").to_lowercase();
    let base = exe.rsplit('/').next().unwrap_or(&exe);
    let arg1 = argv[1].to_lowercase();

    let wraps = matches!(
        (base, arg1.as_str()),
        ("bash" | "sh", "-lc" | "-c")
            | ("cmd" | "cmd.exe", "/c")
            | ("powershell" | "powershell.exe" | "pwsh" | "pwsh.exe", "-command" | "-c")
    );
    if !wraps {
        return argv;
    }

    let inner = argv[2].trim();
    if inner.is_empty() {
        return argv;
    }
    let inner_argv = split_command(inner);
    if inner_argv.is_empty() {
        argv
    } else {
        inner_argv
    }
}

/// Split an argv into chain segments at `&&`, `;`, `||`, `|`.
pub fn split_chain_segments(argv: &[String]) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for token in argv {
        if CHAIN_OPERATORS.contains(&token.as_str()) {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push(token.clone());
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn posix_commands_split_normally() {
        assert_eq!(
            split_command("/usr/bin/python3 -m pytest -q"),
            argv(&["/usr/bin/python3", "-m", "pytest", "-q"])
        );
    }

    #[test]
    fn windows_paths_preserve_backslashes() {
        let cases = [
            (
                r"C:\Python313\python.exe -m pytest --version",
                r"C:\Python313\python.exe",
            ),
            (
                r"I:\code\proj\.venv\Scripts\python.exe -m pytest",
                r"I:\code\proj\.venv\Scripts\python.exe",
            ),
            (
                r"C:\Python313\Scripts\pytest.exe -q",
                r"C:\Python313\Scripts\pytest.exe",
            ),
        ];
        for (command, first) in cases {
            let tokens = split_command(command);
            assert_eq!(tokens[0], first, "input: {command}");
        }
    }

    #[test]
    fn quoted_windows_path_with_spaces() {
        let tokens =
            split_command(r#""C:\Program Files\Python313\python.exe" -m pytest --version"#);
        assert_eq!(tokens[0], r"C:\Program Files\Python313\python.exe");
        assert_eq!(&tokens[1..], argv(&["-m", "pytest", "--version"]));
    }

    #[test]
    fn format_argv_round_trips_windows_tokens() {
        let cases = [
            argv(&[r"C:\Python313\python.exe", "-m", "pytest", "--version"]),
            argv(&[r"C:\Program Files\Python313\python.exe", "-m", "pytest", "-q"]),
        ];
        for case in cases {
            let formatted = format_argv(&case);
            for token in &case {
                if token.contains('\\') {
                    assert!(formatted.contains(token), "{token} lost in {formatted}");
                }
            }
            assert!(!formatted.contains("C:P"), "collapsed path in {formatted}");
        }
    }

    #[test]
    fn unwrap_bash_lc() {
        let out = maybe_unwrap_shell_command(argv(&["bash", "-lc", "cargo test --workspace"]));
        assert_eq!(out, argv(&["cargo", "test", "--workspace"]));
    }

    #[test]
    fn unwrap_cmd_preserves_windows_path() {
        let out = maybe_unwrap_shell_command(argv(&[
            "cmd",
            "/c",
            r"C:\Python313\python.exe -m pytest --version",
        ]));
        assert_eq!(out[0], r"C:\Python313\python.exe");
    }

    #[test]
    fn unwrap_powershell_keeps_backslashes() {
        let out = maybe_unwrap_shell_command(argv(&[
            "powershell",
            "-Command",
            r"& 'C:\Python313\python.exe' -m pytest --version",
        ]));
        let joined = out.join(" ");
        assert!(joined.contains(r"C:\Python313\python.exe"), "got {joined}");
    }

    #[test]
    fn unwrap_is_single_level_and_skips_empty_inner() {
        let nested = argv(&["bash", "-c", "sh -c 'echo hi'"]);
        let out = maybe_unwrap_shell_command(nested);
        assert_eq!(out, argv(&["sh", "-c", "echo hi"]));

        let empty = argv(&["bash", "-c", "   "]);
        assert_eq!(
            maybe_unwrap_shell_command(empty.clone()),
            empty
        );
    }

    #[test]
    fn non_wrapper_argv_is_untouched(){
        let plain = argv(&["cargo", "build", "--release"]);
        assert_eq!(maybe_unwrap_shell_command(plain.clone()), plain);
    }

    #[test]
    fn chain_segments_split_on_operators() {
        let segments = split_chain_segments(&argv(&[
            "cd", "src", "&&", "cat", "main.rs", "|", "head", "-n", "5",
        ]));
        assert_eq!(
            segments,
            vec![
                argv(&["cd", "src"]),
                argv(&["cat", "main.rs"]),
                argv(&["head", "-n", "5"]),
            ]
        );
    }
}
