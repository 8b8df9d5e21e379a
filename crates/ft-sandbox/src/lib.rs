// SPDX-License-Identifier: MIT OR Apache-2.0
//! ft-sandbox
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Isolation layer for agent runs. Two backends: `local` (direct
//! subprocess, optional env overrides) and `docker` (long-lived container
//! with bind mounts, an env allowlist, and content-addressed image reuse).
//! The runner talks to both through [`SandboxInstance`].

/// Docker container lifecycle and CLI plumbing.
pub mod docker;
/// Content-addressed image identity.
pub mod image;
/// Local (no isolation) backend.
pub mod local;
/// Overlay manifests and base-image selection.
pub mod overlay;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Container-side workspace mount point.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Container-side artifacts mount point.
pub const ARTIFACTS_MOUNT: &str = "/artifacts";
/// Container-side warm-cache mount point.
pub const CACHE_MOUNT: &str = "/cache";

/// Sandbox failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A docker invocation exceeded its timeout.
    #[error("docker call timed out after {timeout_seconds}s: {argv:?} (log: {log_hint})")]
    DockerTimeout {
        /// Host argv of the docker call.
        argv: Vec<String>,
        /// Configured timeout.
        timeout_seconds: f64,
        /// Where to look for partial output.
        log_hint: String,
    },

    /// A docker invocation exited non-zero.
    #[error("docker call failed ({argv:?}): exit {exit_code}: {stderr_tail}")]
    DockerFailed {
        /// Host argv of the docker call.
        argv: Vec<String>,
        /// Exit code (-1 when killed).
        exit_code: i32,
        /// Trailing stderr for diagnosis.
        stderr_tail: String,
    },

    /// Filesystem failure while preparing the sandbox.
    #[error("sandbox io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Overlay manifest or base-image selection failure.
    #[error("sandbox overlay error: {0}")]
    Overlay(String),
}

impl SandboxError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

/// Network access mode for the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Default bridge networking.
    #[default]
    Open,
    /// `--network none`.
    None,
}

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path.
    pub host_path: PathBuf,
    /// Container path.
    pub container_path: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl MountSpec {
    /// Read-write mount.
    pub fn rw(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Read-only mount.
    pub fn ro(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    /// Render as a `-v` argument value.
    pub fn as_volume_arg(&self) -> String {
        let mut arg = format!(
            "{}:{}",
            self.host_path.display(),
            self.container_path
        );
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Docker sandbox configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerSandboxSpec {
    /// Image repository name (tag is content-addressed).
    pub image_repo: String,
    /// Docker build context directory.
    pub context_dir: PathBuf,
    /// Dockerfile path inside the context.
    pub dockerfile: PathBuf,
    /// Host workspace directory (mounted rw at `/workspace`).
    pub workspace_dir: PathBuf,
    /// Host artifacts directory (mounted rw at `/artifacts`).
    pub artifacts_dir: PathBuf,
    /// Optional warm cache directory (mounted rw at `/cache`).
    pub cache_dir: Option<PathBuf>,
    /// Caller-supplied extra mounts.
    #[serde(default)]
    pub extra_mounts: Vec<MountSpec>,
    /// Host env var names copied into the container when present.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Env overrides, merged after the allowlist.
    #[serde(default)]
    pub env_overrides: BTreeMap<String, String>,
    /// Network mode.
    #[serde(default)]
    pub network: NetworkMode,
    /// Force a rebuild even when the content-addressed tag exists.
    #[serde(default)]
    pub rebuild_image: bool,
    /// Keep the container around after close (debugging).
    #[serde(default)]
    pub keep_container: bool,
}

/// Result of one command executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcome {
    /// Exit code (-1 when the process was killed).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// A started sandbox the runner can execute commands in.
///
/// `exec_prefix` is prepended to every agent argv: empty for the local
/// backend, `docker exec -i -w /workspace <name>` for docker.
pub trait SandboxInstance {
    /// Argv prefix for running commands inside the sandbox.
    fn exec_prefix(&self) -> Vec<String>;

    /// Environment the spawned process should see (local backend only;
    /// docker bakes env into the container).
    fn process_env(&self) -> BTreeMap<String, String>;

    /// The workspace path commands should treat as cwd, from the agent's
    /// point of view.
    fn workspace_path(&self) -> String;
}
