// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed text capture.
//!
//! Large artifacts (stderr, prompts, tool output) are referenced by size and
//! SHA-256, with a bounded head/tail excerpt for inline embedding. Binary
//! content is never excerpted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Marker inserted between head and tail of a truncated excerpt.
pub const TRUNCATION_MARKER: &str = "\n...[truncated; see capture manifest]...\n";

/// Limits applied when capturing a text artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCapturePolicy {
    /// Upper bound on the excerpt size in bytes (head + tail).
    pub max_excerpt_bytes: usize,
    /// Bytes kept from the start of the file.
    pub head_bytes: usize,
    /// Bytes kept from the end of the file.
    pub tail_bytes: usize,
    /// Optional cap on excerpt line count (0 = unlimited).
    pub max_line_count: usize,
    /// How many leading bytes are inspected for binary detection.
    pub binary_detection_bytes: usize,
}

impl Default for TextCapturePolicy {
    fn default() -> Self {
        Self {
            max_excerpt_bytes: 8_192,
            head_bytes: 4_096,
            tail_bytes: 4_096,
            max_line_count: 0,
            binary_detection_bytes: 2_048,
        }
    }
}

impl TextCapturePolicy {
    /// Policy that splits `max_embed_bytes` evenly between head and tail.
    pub fn sized(max_embed_bytes: usize) -> Self {
        let head = max_embed_bytes / 2;
        Self {
            max_excerpt_bytes: max_embed_bytes,
            head_bytes: head,
            tail_bytes: max_embed_bytes - head,
            max_line_count: 0,
            binary_detection_bytes: 2_048,
        }
    }
}

/// Reference to a captured artifact: existence, size, and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path relative to the capture root (or absolute when outside it).
    pub path: String,
    /// Whether the file existed at capture time.
    pub exists: bool,
    /// Size in bytes (`None` when missing).
    pub size_bytes: Option<u64>,
    /// SHA-256 of the full content (`None` when missing or unreadable).
    pub sha256: Option<String>,
}

/// Head/tail excerpt of a text artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextExcerpt {
    /// Leading bytes, lossily decoded as UTF-8.
    pub head: String,
    /// Trailing bytes when truncated, empty otherwise.
    pub tail: String,
    /// Whether content was dropped between head and tail.
    pub truncated: bool,
}

impl TextExcerpt {
    /// Render the excerpt, inserting the truncation marker when needed.
    pub fn composed(&self) -> String {
        if !self.truncated {
            return self.head.clone();
        }
        format!("{}{}{}", self.head, TRUNCATION_MARKER, self.tail)
    }
}

/// Outcome of [`capture_text_artifact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Always present, even for missing files.
    pub artifact: ArtifactRef,
    /// Present iff the file exists and is text.
    pub excerpt: Option<TextExcerpt>,
    /// Failure classification (`binary_content`, `read_error: ...`).
    pub error: Option<String>,
}

fn rel_display(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.display().to_string().replace('\\', "/"),
    }
}

fn looks_binary(bytes: &[u8], probe_len: usize) -> bool {
    let probe = &bytes[..bytes.len().min(probe_len)];
    probe.contains(&0u8)
}

fn clip_lines(text: String, max_lines: usize) -> String {
    if max_lines == 0 {
        return text;
    }
    let mut count = 0usize;
    for (idx, ch) in text.char_indices() {
        if ch == '\n' {
            count += 1;
            if count >= max_lines {
                return text[..=idx].to_string();
            }
        }
    }
    text
}

/// Capture a text file: record size + SHA-256 of the full content and return
/// either a full excerpt (when the file fits in head+tail) or a truncated
/// head/tail pair.
///
/// Binary files and read failures yield an `error` and no excerpt; the
/// artifact reference still records whatever was observable.
pub fn capture_text_artifact(
    path: &Path,
    policy: &TextCapturePolicy,
    root: &Path,
) -> CaptureResult {
    let rel = rel_display(path, root);

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return CaptureResult {
                artifact: ArtifactRef {
                    path: rel,
                    exists: false,
                    size_bytes: None,
                    sha256: None,
                },
                excerpt: None,
                error: None,
            };
        }
        Err(e) => {
            return CaptureResult {
                artifact: ArtifactRef {
                    path: rel,
                    exists: true,
                    size_bytes: None,
                    sha256: None,
                },
                excerpt: None,
                error: Some(format!("read_error: {e}")),
            };
        }
    };

    let sha256 = {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    };
    let artifact = ArtifactRef {
        path: rel,
        exists: true,
        size_bytes: Some(bytes.len() as u64),
        sha256: Some(sha256),
    };

    if looks_binary(&bytes, policy.binary_detection_bytes) {
        return CaptureResult {
            artifact,
            excerpt: None,
            error: Some("binary_content".to_string()),
        };
    }

    let budget = policy.head_bytes + policy.tail_bytes;
    let excerpt = if bytes.len() <= budget {
        TextExcerpt {
            head: clip_lines(
                String::from_utf8_lossy(&bytes).into_owned(),
                policy.max_line_count,
            ),
            tail: String::new(),
            truncated: false,
        }
    } else {
        let head = String::from_utf8_lossy(&bytes[..policy.head_bytes]).into_owned();
        let tail =
            String::from_utf8_lossy(&bytes[bytes.len() - policy.tail_bytes..]).into_owned();
        TextExcerpt {
            head: clip_lines(head, policy.max_line_count),
            tail,
            truncated: true,
        }
    };

    CaptureResult {
        artifact,
        excerpt: Some(excerpt),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_records_absence() {
        let dir = tempfile::tempdir().unwrap();
        let result = capture_text_artifact(
            &dir.path().join("nope.txt"),
            &TextCapturePolicy::default(),
            dir.path(),
        );
        assert!(!result.artifact.exists);
        assert!(result.excerpt.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn small_file_is_captured_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello\nworld\n").unwrap();

        let result =
            capture_text_artifact(&path, &TextCapturePolicy::default(), dir.path());
        let excerpt = result.excerpt.unwrap();
        assert!(!excerpt.truncated);
        assert_eq!(excerpt.head, "hello\nworld\n");
        assert_eq!(result.artifact.size_bytes, Some(12));
        assert_eq!(result.artifact.path, "note.txt");
        assert!(result.artifact.sha256.is_some());
    }

    #[test]
    fn oversized_file_yields_truncated_head_tail() {
        // 16 KiB against the default 4 KiB head + 4 KiB tail policy must
        // mark truncation.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let body: String = std::iter::repeat("abcdefgh".to_string())
            .take(2_048)
            .collect();
        std::fs::write(&path, &body).unwrap();

        let result =
            capture_text_artifact(&path, &TextCapturePolicy::default(), dir.path());
        let excerpt = result.excerpt.unwrap();
        assert!(excerpt.truncated);
        assert_eq!(excerpt.head.len(), 4_096);
        assert_eq!(excerpt.tail.len(), 4_096);
        assert!(excerpt.composed().contains("[truncated"));
    }

    #[test]
    fn binary_content_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, [0x7fu8, b'E', b'L', b'F', 0x00, 0x01]).unwrap();

        let result =
            capture_text_artifact(&path, &TextCapturePolicy::default(), dir.path());
        assert!(result.excerpt.is_none());
        assert_eq!(result.error.as_deref(), Some("binary_content"));
        assert!(result.artifact.sha256.is_some());
    }

    #[test]
    fn digest_covers_full_content_not_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.txt");
        let body = "x".repeat(50_000);
        std::fs::write(&path, &body).unwrap();

        let result =
            capture_text_artifact(&path, &TextCapturePolicy::default(), dir.path());
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        assert_eq!(
            result.artifact.sha256.as_deref(),
            Some(format!("{:x}", hasher.finalize()).as_str())
        );
    }
}
