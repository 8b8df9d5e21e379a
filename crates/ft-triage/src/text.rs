// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tokenization and path-anchor extraction shared by the similarity engine.

use std::sync::LazyLock;

use regex::Regex;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("token regex"));

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Path-like fragments: at least one separator, word-ish segments, an
    // optional extension. Windows and posix separators both count.
    Regex::new(r"[A-Za-z0-9_.~-]+(?:[/\\][A-Za-z0-9_.~-]+)+").expect("path regex")
});

/// Lowercase word tokens (alphanumeric runs) of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Extract path-like anchors from text chunks.
///
/// Anchors are normalized to lowercase forward-slash form. For each path the
/// basename and the last two segments are added as well so near-miss paths
/// still overlap.
pub fn extract_path_anchors_from_chunks<'a, I>(chunks: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out: Vec<String> = Vec::new();
    let mut push = |anchor: String| {
        if !anchor.is_empty() && !out.contains(&anchor) {
            out.push(anchor);
        }
    };

    for chunk in chunks {
        for m in PATH_RE.find_iter(chunk) {
            let anchor = m.as_str().trim().to_lowercase().replace('\\', "/");
            let parts: Vec<&str> = anchor.split('/').filter(|p| !p.is_empty()).collect();
            if parts.len() < 2 {
                continue;
            }
            push(anchor.clone());
            if let Some(last) = parts.last() {
                push((*last).to_string());
            }
            if parts.len() >= 2 {
                push(parts[parts.len() - 2..].join("/"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Run `cargo TEST` 3 times"),
            vec!["run", "cargo", "test", "3", "times"]
        );
        assert!(tokenize("—").is_empty());
    }

    #[test]
    fn anchors_include_basename_and_tail_pair() {
        let anchors =
            extract_path_anchors_from_chunks(["error in src/runner/orchestrator.rs line 40"]);
        assert!(anchors.contains(&"src/runner/orchestrator.rs".to_string()));
        assert!(anchors.contains(&"orchestrator.rs".to_string()));
        assert!(anchors.contains(&"runner/orchestrator.rs".to_string()));
    }

    #[test]
    fn windows_paths_normalize_to_forward_slashes() {
        let anchors = extract_path_anchors_from_chunks([r"see C:\Users\dev\notes.md"]);
        assert!(anchors.iter().any(|a| a.ends_with("users/dev/notes.md")));
        assert!(anchors.contains(&"notes.md".to_string()));
    }

    #[test]
    fn bare_words_are_not_anchors() {
        assert!(extract_path_anchors_from_chunks(["no paths here at all"]).is_empty());
    }
}
