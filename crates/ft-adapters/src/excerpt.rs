// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded output excerpts for failing commands.

/// Marker inserted when a command's output is clipped.
pub const TRUNCATED_OUTPUT_MARKER: &str = "\n...[truncated_output]...\n";

/// Upper bound on an inline output excerpt.
pub const MAX_OUTPUT_EXCERPT_CHARS: usize = 2_000;

fn char_prefix(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn char_suffix(text: &str, chars: usize) -> &str {
    let total = text.chars().count();
    if total <= chars {
        return text;
    }
    let skip = total - chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Clip `text` to [`MAX_OUTPUT_EXCERPT_CHARS`], keeping head + tail around a
/// truncation marker. Returns the excerpt and whether it was truncated.
pub fn excerpt_text(text: &str) -> (String, bool) {
    excerpt_text_with_limit(text, MAX_OUTPUT_EXCERPT_CHARS)
}

/// [`excerpt_text`] with an explicit character budget.
pub fn excerpt_text_with_limit(text: &str, max_chars: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= max_chars {
        return (text.to_string(), false);
    }
    let marker_len = TRUNCATED_OUTPUT_MARKER.chars().count();
    if max_chars <= marker_len {
        return (char_prefix(text, max_chars).to_string(), true);
    }
    let available = max_chars - marker_len;
    let head_chars = available / 2;
    let tail_chars = available - head_chars;
    (
        format!(
            "{}{}{}",
            char_prefix(text, head_chars),
            TRUNCATED_OUTPUT_MARKER,
            char_suffix(text, tail_chars)
        ),
        true,
    )
}

/// Join stdout and stderr into one labeled blob; empty streams are skipped.
pub fn join_streams(stdout: Option<&str>, stderr: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(out) = stdout {
        if !out.trim().is_empty() {
            parts.push(format!("[stdout]\n{}", out.trim_end()));
        }
    }
    if let Some(err) = stderr {
        if !err.trim().is_empty() {
            parts.push(format!("[stderr]\n{}", err.trim_end()));
        }
    }
    parts.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_passes_through() {
        let (out, truncated) = excerpt_text("small output");
        assert_eq!(out, "small output");
        assert!(!truncated);
    }

    #[test]
    fn long_text_is_clipped_with_marker() {
        let body = "x".repeat(5_000);
        let (out, truncated) = excerpt_text(&body);
        assert!(truncated);
        assert!(out.contains("...[truncated_output]..."));
        assert!(out.chars().count() <= MAX_OUTPUT_EXCERPT_CHARS);
    }

    #[test]
    fn streams_join_with_labels() {
        let joined = join_streams(Some("line\n"), Some("warning\n"));
        assert_eq!(joined, "[stdout]\nline\n[stderr]\nwarning");
        assert_eq!(join_streams(Some("   "), None), "");
        assert_eq!(join_streams(None, Some("err")), "[stderr]\nerr");
    }
}
