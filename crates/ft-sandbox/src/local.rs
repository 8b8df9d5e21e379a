// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local backend: no isolation, direct subprocess with optional env
//! overrides. Used when docker is unavailable or the caller opts out.

use crate::SandboxInstance;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A "sandbox" that runs commands directly on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalSandboxInstance {
    /// Workspace directory commands run in.
    pub workspace_dir: PathBuf,
    /// Env overrides applied to spawned processes.
    pub env_overrides: BTreeMap<String, String>,
}

impl LocalSandboxInstance {
    /// Local sandbox rooted at `workspace_dir`.
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            env_overrides: BTreeMap::new(),
        }
    }

    /// Add an env override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }
}

impl SandboxInstance for LocalSandboxInstance {
    fn exec_prefix(&self) -> Vec<String> {
        Vec::new()
    }

    fn process_env(&self) -> BTreeMap<String, String> {
        self.env_overrides.clone()
    }

    fn workspace_path(&self) -> String {
        self.workspace_dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_has_no_exec_prefix() {
        let instance = LocalSandboxInstance::new("/tmp/work").with_env("K", "v");
        assert!(instance.exec_prefix().is_empty());
        assert_eq!(instance.process_env()["K"], "v");
        assert_eq!(instance.workspace_path(), "/tmp/work");
    }
}
