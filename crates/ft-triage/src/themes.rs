// SPDX-License-Identifier: MIT OR Apache-2.0
//! Regex theme classification.
//!
//! Signals (atom text, error messages, stderr lines) are mapped onto a
//! closed set of coarse themes. Rules are ordered: most sources take the
//! first match, while run-failure signals may legitimately match several
//! families and keep all of them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// The closed theme set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    /// Agent could not run something it needed (shell denied, sandbox
    /// policy, missing permissions).
    ExecutionPermissions,
    /// The agent's structured output broke the contract (invalid JSON,
    /// schema violations, missing report).
    OutputContract,
    /// The agent could not find or understand documentation.
    DocsDiscoverability,
    /// Provider-side capacity or rate limiting.
    ProviderCapacity,
    /// Required binaries missing at preflight.
    BinaryPreflight,
    /// Sandbox path mapping confusion (mount points, Windows paths).
    SandboxPaths,
    /// Python runtime discovery and probing.
    PythonRuntime,
    /// Everything else.
    Other,
}

impl Theme {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionPermissions => "execution_permissions",
            Self::OutputContract => "output_contract",
            Self::DocsDiscoverability => "docs_discoverability",
            Self::ProviderCapacity => "provider_capacity",
            Self::BinaryPreflight => "binary_preflight",
            Self::SandboxPaths => "sandbox_paths",
            Self::PythonRuntime => "python_runtime",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ThemeRule {
    theme: Theme,
    pattern: Regex,
}

static RULES: LazyLock<Vec<ThemeRule>> = LazyLock::new(|| {
    let rule = |theme: Theme, pattern: &str| ThemeRule {
        theme,
        pattern: Regex::new(pattern).expect("theme rule regex"),
    };
    vec![
        rule(
            Theme::ProviderCapacity,
            r"(?i)\b429\b|rate.?limit|capacity quota|hit your limit|resets \d|overloaded",
        ),
        rule(
            Theme::ExecutionPermissions,
            r"(?i)permission denied|not permitted|requires.?shell|policy (?:forbids|block)|approval.?request|sandbox denied|read.?only file system",
        ),
        rule(
            Theme::OutputContract,
            r"(?i)invalid json|schema validation|report_validation|missing report|not valid json|json_invalid|malformed output",
        ),
        rule(
            Theme::BinaryPreflight,
            r"(?i)binary.?missing|command not found|No such file or directory.*\bbin\b|not recognized as an internal or external command|not found on PATH",
        ),
        rule(
            Theme::PythonRuntime,
            r"(?i)python_unavailable|windowsapps|no module named|virtualenv|\.venv|python (?:runtime|interpreter)|missing_stdlib",
        ),
        rule(
            Theme::SandboxPaths,
            r"(?i)/workspace/|workspace.?mount|\\\\\?\\|drive letter|path mapping|long.?path",
        ),
        rule(
            Theme::DocsDiscoverability,
            r"(?i)readme|documentation|docs?\b.*(?:missing|unclear|outdated|confus)|quickstart|getting started|no examples",
        ),
    ]
});

/// Classify a signal into one theme (first matching rule; [`Theme::Other`]
/// when nothing matches).
pub fn classify_theme(text: &str) -> Theme {
    RULES
        .iter()
        .find(|rule| rule.pattern.is_match(text))
        .map(|rule| rule.theme)
        .unwrap_or(Theme::Other)
}

/// Classify a signal into every matching theme, in rule order.
///
/// Used for run-failure signals, which often belong to several families at
/// once; falls back to `[Theme::Other]` when nothing matches.
pub fn classify_themes(text: &str, multi: bool) -> Vec<Theme> {
    if !multi {
        return vec![classify_theme(text)];
    }
    let matched: Vec<Theme> = RULES
        .iter()
        .filter(|rule| rule.pattern.is_match(text))
        .map(|rule| rule.theme)
        .collect();
    if matched.is_empty() {
        vec![Theme::Other]
    } else {
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_signals_map_to_provider_capacity() {
        assert_eq!(
            classify_theme("stderr: HTTP 429 exhausted your capacity quota"),
            Theme::ProviderCapacity
        );
        assert_eq!(
            classify_theme("You've hit your limit · resets 4am"),
            Theme::ProviderCapacity
        );
    }

    #[test]
    fn schema_failures_map_to_output_contract() {
        assert_eq!(
            classify_theme("report.json failed schema validation: missing field"),
            Theme::OutputContract
        );
        assert_eq!(classify_theme("agent wrote not valid json"), Theme::OutputContract);
    }

    #[test]
    fn docs_and_binary_rules() {
        assert_eq!(
            classify_theme("the README quickstart is missing the install step"),
            Theme::DocsDiscoverability
        );
        assert_eq!(
            classify_theme("bash: rg: command not found"),
            Theme::BinaryPreflight
        );
    }

    #[test]
    fn unmatched_text_is_other() {
        assert_eq!(classify_theme("perfectly ordinary sentence"), Theme::Other);
        assert_eq!(classify_themes("nothing to see", true), vec![Theme::Other]);
    }

    #[test]
    fn multi_classification_keeps_all_matches() {
        let themes = classify_themes(
            "429 rate limit while probing python interpreter in .venv",
            true,
        );
        assert!(themes.contains(&Theme::ProviderCapacity));
        assert!(themes.contains(&Theme::PythonRuntime));
    }

    #[test]
    fn single_classification_takes_first_rule() {
        let theme = classify_theme("429 rate limit while probing python in .venv");
        assert_eq!(theme, Theme::ProviderCapacity);
    }

    #[test]
    fn wire_strings_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&Theme::ExecutionPermissions).unwrap(),
            "\"execution_permissions\""
        );
    }
}
