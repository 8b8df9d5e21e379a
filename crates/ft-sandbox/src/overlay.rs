// SPDX-License-Identifier: MIT OR Apache-2.0
//! Overlay manifests and base-image selection.
//!
//! Agents and targets can declare CLI tooling to bake into the sandbox
//! image (`sandbox_cli_install`: apt, pip, npm_global). When declared, a
//! per-run image context is materialized under `sandbox/image_context/`
//! with manifest files next to the Dockerfile, and the Dockerfile's first
//! `FROM python:<X.Y>-slim` line is rewritten when the current base no
//! longer satisfies the target's `requires-python` expression.

use crate::SandboxError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Target-side overlay manifest location, relative to the target repo root.
pub const TARGET_OVERLAY_REL: &str = ".usertest/sandbox_cli_install.yaml";

/// Python minor versions the auto-selector may pick from, ascending.
pub const PYTHON_BASE_CANDIDATES: &[(u32, u32)] =
    &[(3, 9), (3, 10), (3, 11), (3, 12), (3, 13)];

/// CLI packages to install into the sandbox image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliInstallSpec {
    /// apt packages.
    #[serde(default)]
    pub apt: Vec<String>,
    /// pip packages.
    #[serde(default)]
    pub pip: Vec<String>,
    /// Globally installed npm packages.
    #[serde(default)]
    pub npm_global: Vec<String>,
}

impl CliInstallSpec {
    /// True when nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.apt.is_empty() && self.pip.is_empty() && self.npm_global.is_empty()
    }

    /// Merge another spec into this one, deduplicating while preserving
    /// first-seen order.
    pub fn merge(&mut self, other: &CliInstallSpec) {
        for (into, from) in [
            (&mut self.apt, &other.apt),
            (&mut self.pip, &other.pip),
            (&mut self.npm_global, &other.npm_global),
        ] {
            for pkg in from {
                if !into.contains(pkg) {
                    into.push(pkg.clone());
                }
            }
        }
    }
}

/// Read the target's `requires-python` expression from `pyproject.toml`,
/// if it declares one.
pub fn read_requires_python(target_root: &Path) -> Option<String> {
    let text = std::fs::read_to_string(target_root.join("pyproject.toml")).ok()?;
    let doc: toml::Value = text.parse().ok()?;
    doc.get("project")?
        .get("requires-python")?
        .as_str()
        .map(str::to_string)
}

/// Load a target's `.usertest/sandbox_cli_install.yaml` if present.
pub fn load_target_cli_install(
    target_root: &Path,
) -> Result<Option<CliInstallSpec>, SandboxError> {
    let path = target_root.join(TARGET_OVERLAY_REL);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).map_err(|e| SandboxError::io(&path, e))?;
    let spec: CliInstallSpec = serde_yaml::from_str(&text)
        .map_err(|e| SandboxError::Overlay(format!("invalid {}: {e}", path.display())))?;
    Ok(Some(spec))
}

// ---------------------------------------------------------------------------
// requires-python
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionOp {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
    Compatible,
}

#[derive(Debug, Clone, Copy)]
struct VersionClause {
    op: VersionOp,
    major: u32,
    minor: u32,
    wildcard: bool,
}

fn parse_clause(raw: &str) -> Result<VersionClause, SandboxError> {
    let raw = raw.trim();
    let (op, rest) = if let Some(rest) = raw.strip_prefix(">=") {
        (VersionOp::Ge, rest)
    } else if let Some(rest) = raw.strip_prefix("<=") {
        (VersionOp::Le, rest)
    } else if let Some(rest) = raw.strip_prefix("==") {
        (VersionOp::Eq, rest)
    } else if let Some(rest) = raw.strip_prefix("!=") {
        (VersionOp::Ne, rest)
    } else if let Some(rest) = raw.strip_prefix("~=") {
        (VersionOp::Compatible, rest)
    } else if let Some(rest) = raw.strip_prefix('>') {
        (VersionOp::Gt, rest)
    } else if let Some(rest) = raw.strip_prefix('<') {
        (VersionOp::Lt, rest)
    } else {
        return Err(SandboxError::Overlay(format!(
            "unsupported requires-python clause: {raw:?}"
        )));
    };

    let version = rest.trim();
    let wildcard = version.ends_with(".*");
    let version = version.trim_end_matches(".*");
    let mut parts = version.split('.');
    let major: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| SandboxError::Overlay(format!("bad version in clause {raw:?}")))?;
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

    Ok(VersionClause {
        op,
        major,
        minor,
        wildcard,
    })
}

fn clause_allows(clause: &VersionClause, major: u32, minor: u32) -> bool {
    let candidate = (major, minor);
    let bound = (clause.major, clause.minor);
    match clause.op {
        VersionOp::Ge => candidate >= bound,
        VersionOp::Gt => candidate > bound,
        VersionOp::Le => candidate <= bound,
        VersionOp::Lt => candidate < bound,
        VersionOp::Eq => {
            if clause.wildcard {
                major == clause.major
            } else {
                candidate == bound
            }
        }
        VersionOp::Ne => {
            if clause.wildcard {
                major != clause.major
            } else {
                candidate != bound
            }
        }
        // ~=X.Y means >=X.Y, ==X.*
        VersionOp::Compatible => candidate >= bound && major == clause.major,
    }
}

/// Whether `major.minor` satisfies a `requires-python` expression
/// (comma-separated clauses, all must hold).
pub fn python_version_satisfies(
    requires_python: &str,
    major: u32,
    minor: u32,
) -> Result<bool, SandboxError> {
    for raw in requires_python.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        if !clause_allows(&parse_clause(raw)?, major, minor) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Pick the smallest candidate base version satisfying `requires_python`.
pub fn select_python_base(requires_python: &str) -> Result<Option<(u32, u32)>, SandboxError> {
    for &(major, minor) in PYTHON_BASE_CANDIDATES {
        if python_version_satisfies(requires_python, major, minor)? {
            return Ok(Some((major, minor)));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Image context materialization
// ---------------------------------------------------------------------------

/// Rewrite the first `FROM python:<X.Y>-slim` line to the given version.
/// Lines that do not match are left alone.
pub fn rewrite_python_base(dockerfile_text: &str, major: u32, minor: u32) -> String {
    let mut rewritten = false;
    let mut out: Vec<String> = Vec::new();
    for line in dockerfile_text.lines() {
        let trimmed = line.trim_start();
        if !rewritten
            && trimmed.to_lowercase().starts_with("from ")
            && trimmed.contains("python:")
            && trimmed.contains("-slim")
        {
            out.push(format!("FROM python:{major}.{minor}-slim"));
            rewritten = true;
            continue;
        }
        out.push(line.to_string());
    }
    let mut text = out.join("\n");
    if dockerfile_text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Materialized per-run image context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContext {
    /// Context directory (`<run_dir>/sandbox/image_context`).
    pub context_dir: PathBuf,
    /// Dockerfile inside the context.
    pub dockerfile: PathBuf,
    /// Base version the Dockerfile was rewritten to, when it was.
    pub python_base: Option<(u32, u32)>,
}

/// Materialize `sandbox/image_context/` for a run: copy the base
/// Dockerfile, write overlay manifests, and rewrite the Python base when
/// the selected image no longer satisfies `requires_python`.
pub fn materialize_image_context(
    run_dir: &Path,
    base_dockerfile: &Path,
    install: &CliInstallSpec,
    requires_python: Option<&str>,
) -> Result<ImageContext, SandboxError> {
    let context_dir = run_dir.join("sandbox").join("image_context");
    std::fs::create_dir_all(&context_dir)
        .map_err(|e| SandboxError::io(&context_dir, e))?;

    let mut dockerfile_text = std::fs::read_to_string(base_dockerfile)
        .map_err(|e| SandboxError::io(base_dockerfile, e))?;

    let mut python_base = None;
    if let Some(expr) = requires_python {
        let expr = expr.trim();
        if !expr.is_empty() {
            let current = current_python_base(&dockerfile_text);
            let satisfied = match current {
                Some((major, minor)) => python_version_satisfies(expr, major, minor)?,
                None => true,
            };
            if !satisfied {
                let Some((major, minor)) = select_python_base(expr)? else {
                    return Err(SandboxError::Overlay(format!(
                        "no candidate python base satisfies requires-python {expr:?}"
                    )));
                };
                dockerfile_text = rewrite_python_base(&dockerfile_text, major, minor);
                python_base = Some((major, minor));
                tracing::info!(major, minor, expr, "rewrote sandbox python base image");
            }
        }
    }

    let dockerfile = context_dir.join("Dockerfile");
    std::fs::write(&dockerfile, &dockerfile_text)
        .map_err(|e| SandboxError::io(&dockerfile, e))?;

    for (name, packages) in [
        ("apt-packages.txt", &install.apt),
        ("pip-packages.txt", &install.pip),
        ("npm-global-packages.txt", &install.npm_global),
    ] {
        let path = context_dir.join(name);
        let mut body = packages.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&path, body).map_err(|e| SandboxError::io(&path, e))?;
    }

    Ok(ImageContext {
        context_dir,
        dockerfile,
        python_base,
    })
}

fn current_python_base(dockerfile_text: &str) -> Option<(u32, u32)> {
    for line in dockerfile_text.lines() {
        let trimmed = line.trim_start().to_lowercase();
        let Some(rest) = trimmed.strip_prefix("from ") else { continue };
        let Some(idx) = rest.find("python:") else { continue };
        let version = &rest[idx + "python:".len()..];
        let version = version.split('-').next().unwrap_or("");
        let mut parts = version.split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = parts.next()?.parse().ok()?;
        return Some((major, minor));
    }
    None
}
