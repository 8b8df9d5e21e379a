// SPDX-License-Identifier: MIT OR Apache-2.0
//! Target acquisition: turn a repo input (local path, URL, or `pip:<spec>`)
//! into an isolated workspace directory with a usable git history.

use crate::RunnerError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

/// Directory names never copied into a workspace.
pub const COPY_IGNORE_SET: &[&str] = &[
    ".git",
    ".venv",
    "node_modules",
    "__pycache__",
    "dist",
    "build",
    "runs",
    "target",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
];

/// Windows `MAX_PATH` limit for files.
pub const WINDOWS_MAX_PATH: usize = 260;
/// Effective limit for directories (`CreateDirectory` headroom).
pub const WINDOWS_MAX_DIR_PATH: usize = 248;

/// How the workspace was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// `git clone` of a local repository.
    CloneLocal,
    /// `git clone` of a remote URL.
    CloneUrl,
    /// Recursive copy plus `git init`.
    CopyTree,
    /// Synthetic workspace describing a pip target.
    PipSpec,
}

/// Result of acquisition, recorded into `target_ref.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquiredTarget {
    /// Workspace directory (may differ from the requested destination
    /// after long-path relocation).
    pub workspace_dir: PathBuf,
    /// How the workspace was produced.
    pub mode: AcquireMode,
    /// Commit the workspace is at, when known.
    pub commit_sha: Option<String>,
}

fn run_git(args: &[&str], cwd: &Path) -> Result<String, RunnerError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| RunnerError::Acquire(format!("git {args:?} failed to spawn: {e}")))?;
    if !output.status.success() {
        return Err(RunnerError::Acquire(format!(
            "git {args:?} exited {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn git_head_sha(repo: &Path) -> Option<String> {
    run_git(&["rev-parse", "HEAD"], repo).ok()
}

fn has_reachable_head(repo: &Path) -> bool {
    repo.join(".git").exists() && git_head_sha(repo).is_some()
}

/// Bootstrap a git identity inside a freshly initialized workspace so
/// commits made by agents do not fail on missing config.
pub fn bootstrap_git_identity(workspace: &Path) -> Result<(), RunnerError> {
    run_git(&["config", "user.email", "agent@fieldtest.invalid"], workspace)?;
    run_git(&["config", "user.name", "fieldtest agent"], workspace)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Long-path mitigation
// ---------------------------------------------------------------------------

/// Longest relative path (in characters, forward-slash form) under `src`,
/// skipping ignored directories. Used to predict Windows `MAX_PATH` trouble
/// before any copy happens.
pub fn estimate_max_relative_path(src: &Path) -> usize {
    let mut max_len = 0usize;
    for entry in WalkDir::new(src)
        .into_iter()
        .filter_entry(|e| {
            !e.file_type().is_dir()
                || e.depth() == 0
                || !COPY_IGNORE_SET
                    .contains(&e.file_name().to_string_lossy().as_ref())
        })
        .flatten()
    {
        let rel = entry
            .path()
            .strip_prefix(src)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        max_len = max_len.max(rel.chars().count());
    }
    max_len
}

/// Decide whether `dest_dir` must be relocated to dodge the Windows path
/// limits, given the longest relative path that will land under it.
///
/// A file path of `len(dest)+1+max_rel >= 260` (or `>= 248` for
/// directories) breaks Win32 APIs without the long-path opt-in; the
/// mitigation is to relocate the workspace under a shorter temp candidate.
pub fn needs_long_path_relocation(dest_dir: &Path, max_rel: usize) -> bool {
    let dest_len = dest_dir.display().to_string().chars().count();
    dest_len + 1 + max_rel >= WINDOWS_MAX_DIR_PATH
}

/// Shorter relocation candidates, tried in order.
pub fn relocation_candidates(temp_root: &Path, run_id: &str) -> Vec<PathBuf> {
    let short_id: String = run_id.chars().take(8).collect();
    vec![
        temp_root.join("ft").join(&short_id),
        temp_root.join(format!("ft-{short_id}")),
        temp_root.join(&short_id),
    ]
}

/// Apply the long-path mitigation when needed: returns the directory to
/// actually acquire into. On hosts where the estimate stays under the
/// limits this is always `dest_dir`.
pub fn maybe_relocate_dest(
    dest_dir: &Path,
    src_max_rel: usize,
    temp_root: &Path,
    run_id: &str,
) -> PathBuf {
    if !needs_long_path_relocation(dest_dir, src_max_rel) {
        return dest_dir.to_path_buf();
    }
    for candidate in relocation_candidates(temp_root, run_id) {
        if !needs_long_path_relocation(&candidate, src_max_rel) {
            tracing::warn!(
                from = %dest_dir.display(),
                to = %candidate.display(),
                "relocating workspace to dodge path-length limits"
            );
            return candidate;
        }
    }
    dest_dir.to_path_buf()
}

// ---------------------------------------------------------------------------
// Acquisition modes
// ---------------------------------------------------------------------------

fn copy_tree(src: &Path, dest: &Path) -> Result<(), RunnerError> {
    for entry in WalkDir::new(src).into_iter().filter_entry(|e| {
        e.depth() == 0
            || !COPY_IGNORE_SET.contains(&e.file_name().to_string_lossy().as_ref())
    }) {
        let entry =
            entry.map_err(|e| RunnerError::Acquire(format!("walk failed: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RunnerError::Acquire(format!("strip_prefix failed: {e}")))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| RunnerError::io(&target, e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
            }
            std::fs::copy(entry.path(), &target)
                .map_err(|e| RunnerError::io(&target, e))?;
        }
    }
    Ok(())
}

fn clone_repo(src: &str, dest: &Path, git_ref: Option<&str>) -> Result<AcquiredTarget, RunnerError> {
    let parent = dest
        .parent()
        .ok_or_else(|| RunnerError::Acquire("destination has no parent".into()))?;
    std::fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
    run_git(&["clone", src, &dest.display().to_string()], parent)?;
    if let Some(git_ref) = git_ref {
        run_git(&["checkout", git_ref], dest)?;
    }
    bootstrap_git_identity(dest)?;
    let mode = if src.contains("://") || src.ends_with(".git") {
        AcquireMode::CloneUrl
    } else {
        AcquireMode::CloneLocal
    };
    Ok(AcquiredTarget {
        workspace_dir: dest.to_path_buf(),
        mode,
        commit_sha: git_head_sha(dest),
    })
}

fn pip_index_config() -> Option<serde_json::Value> {
    let base_url = std::env::var("GITLAB_BASE_URL").ok()?;
    let project_id = std::env::var("GITLAB_PYPI_PROJECT_ID").ok()?;
    Some(serde_json::json!({
        "index_url": format!(
            "{}/api/v4/projects/{project_id}/packages/pypi/simple",
            base_url.trim_end_matches('/')
        ),
        "username_env": "GITLAB_PYPI_USERNAME",
        "password_env": "GITLAB_PYPI_PASSWORD",
        "credentials_present": std::env::var("GITLAB_PYPI_USERNAME").is_ok()
            && std::env::var("GITLAB_PYPI_PASSWORD").is_ok(),
    }))
}

fn acquire_pip_spec(spec: &str, dest: &Path) -> Result<AcquiredTarget, RunnerError> {
    std::fs::create_dir_all(dest).map_err(|e| RunnerError::io(dest, e))?;
    // Credential values stay in the environment; the manifest records only
    // where to look.
    let manifest = serde_json::json!({
        "kind": "pip_target",
        "requirement": spec,
        "private_index": pip_index_config(),
    });
    let manifest_path = dest.join("pip_target.json");
    ft_core::io::write_json_pretty(&manifest_path, &manifest)
        .map_err(|e| RunnerError::io(&manifest_path, e))?;
    let readme = dest.join("README.md");
    std::fs::write(
        &readme,
        format!("# pip target\n\nThis workspace evaluates the pip package `{spec}`.\n"),
    )
    .map_err(|e| RunnerError::io(&readme, e))?;

    run_git(&["init", "-q"], dest)?;
    bootstrap_git_identity(dest)?;
    run_git(&["add", "-A"], dest)?;
    run_git(&["commit", "-q", "-m", "pip target workspace"], dest)?;
    Ok(AcquiredTarget {
        workspace_dir: dest.to_path_buf(),
        mode: AcquireMode::PipSpec,
        commit_sha: git_head_sha(dest),
    })
}

/// Acquire `repo_input` into `dest_dir`.
///
/// * local directory with a reachable git `HEAD` → clone (plus optional
///   checkout of `git_ref`), recording `commit_sha`;
/// * local directory without usable git → copy with the fixed ignore set,
///   then `git init` and an initial commit;
/// * remote URL → clone;
/// * `pip:<spec>` → synthetic workspace describing the pip target.
pub fn acquire_target(
    repo_input: &str,
    dest_dir: &Path,
    git_ref: Option<&str>,
) -> Result<AcquiredTarget, RunnerError> {
    if let Some(spec) = repo_input.strip_prefix("pip:") {
        return acquire_pip_spec(spec.trim(), dest_dir);
    }

    if repo_input.contains("://") {
        return clone_repo(repo_input, dest_dir, git_ref);
    }

    let src = PathBuf::from(repo_input);
    if !src.is_dir() {
        return Err(RunnerError::Acquire(format!(
            "repo input is neither a directory, a URL, nor a pip spec: {repo_input}"
        )));
    }

    if has_reachable_head(&src) {
        return clone_repo(&src.display().to_string(), dest_dir, git_ref);
    }

    // Non-git (or empty-repo) directory: copy and seed a history.
    std::fs::create_dir_all(dest_dir).map_err(|e| RunnerError::io(dest_dir, e))?;
    copy_tree(&src, dest_dir)?;
    run_git(&["init", "-q"], dest_dir)?;
    bootstrap_git_identity(dest_dir)?;
    run_git(&["add", "-A"], dest_dir)?;
    run_git(
        &["commit", "-q", "--allow-empty", "-m", "imported workspace"],
        dest_dir,
    )?;
    Ok(AcquiredTarget {
        workspace_dir: dest_dir.to_path_buf(),
        mode: AcquireMode::CopyTree,
        commit_sha: git_head_sha(dest_dir),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_set_skips_heavy_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("node_modules/dep")).unwrap();
        std::fs::create_dir_all(src.join("code")).unwrap();
        std::fs::write(src.join("node_modules/dep/index.js"), "x").unwrap();
        std::fs::write(src.join("code/main.rs"), "fn main() {}").unwrap();

        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        copy_tree(&src, &dest).unwrap();
        assert!(dest.join("code/main.rs").exists());
        assert!(!dest.join("node_modules").exists());
    }

    #[test]
    fn copytree_acquisition_seeds_git_history() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("README.md"), "# plain\n").unwrap();

        let dest = dir.path().join("ws");
        let acquired =
            acquire_target(&src.display().to_string(), &dest, None).unwrap();
        assert_eq!(acquired.mode, AcquireMode::CopyTree);
        assert!(acquired.commit_sha.is_some());
        assert!(dest.join(".git").is_dir());
        assert!(dest.join("README.md").exists());
    }

    #[test]
    fn git_source_is_cloned_with_commit_sha() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("repo");
        std::fs::create_dir_all(&src).unwrap();
        run_git(&["init", "-q"], &src).unwrap();
        bootstrap_git_identity(&src).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        run_git(&["add", "-A"], &src).unwrap();
        run_git(&["commit", "-q", "-m", "seed"], &src).unwrap();

        let dest = dir.path().join("clone");
        let acquired =
            acquire_target(&src.display().to_string(), &dest, None).unwrap();
        assert_eq!(acquired.mode, AcquireMode::CloneLocal);
        assert_eq!(acquired.commit_sha, git_head_sha(&src));
        assert!(dest.join("a.txt").exists());
    }

    #[test]
    fn pip_spec_yields_synthetic_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pipws");
        let acquired = acquire_target("pip:requests==2.32.0", &dest, None).unwrap();
        assert_eq!(acquired.mode, AcquireMode::PipSpec);
        let manifest: serde_json::Value =
            ft_core::io::read_json_opt(&dest.join("pip_target.json")).unwrap();
        assert_eq!(manifest["requirement"], "requests==2.32.0");
        assert!(acquired.commit_sha.is_some());
    }

    #[test]
    fn long_path_estimate_and_relocation_logic() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("deep");
        std::fs::create_dir_all(src.join("a/b/c")).unwrap();
        std::fs::write(src.join("a/b/c/file.txt"), "x").unwrap();
        let max_rel = estimate_max_relative_path(&src);
        assert_eq!(max_rel, "a/b/c/file.txt".len());

        let short_dest = PathBuf::from("/w");
        assert!(!needs_long_path_relocation(&short_dest, max_rel));

        let long_dest = PathBuf::from(format!("/{}", "x".repeat(240)));
        assert!(needs_long_path_relocation(&long_dest, max_rel));

        let relocated =
            maybe_relocate_dest(&long_dest, max_rel, &PathBuf::from("/tmp"), "20260101T000000Z");
        assert_eq!(relocated, PathBuf::from("/tmp/ft/20260101"));
    }

    #[test]
    fn unknown_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = acquire_target("/definitely/not/here", &dir.path().join("x"), None)
            .unwrap_err();
        assert!(err.to_string().contains("neither a directory"));
    }
}
