// SPDX-License-Identifier: MIT OR Apache-2.0
//! Python runtime discovery.
//!
//! Verification plans that reference `pytest` need a real interpreter, and
//! on Windows the first `python` on PATH is often the WindowsApps store
//! alias, which launches a store page instead of an interpreter. Discovery
//! therefore probes each candidate with a one-shot `-c` that must print
//! parseable JSON before the candidate counts as usable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Probe timeout.
pub const PROBE_TIMEOUT_SECONDS: f64 = 10.0;

/// One-shot probe source: importing `encodings` catches broken stdlib
/// installs that still launch.
pub const PROBE_SNIPPET: &str = "import encodings, json, sys; print(json.dumps({\"executable\": sys.executable, \"version\": sys.version.split()[0]}))";

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeReason {
    /// No candidate found at all.
    NotFound,
    /// Path points at the WindowsApps store alias.
    WindowsappsAlias,
    /// Probe did not finish in time.
    Timeout,
    /// Process failed to spawn.
    LaunchFailed,
    /// Probe ran but exited non-zero or printed garbage.
    RuntimeProbeFailed,
    /// Probe import failed (broken stdlib).
    MissingStdlib,
    /// Spawn was denied.
    AccessDenied,
}

impl ProbeReason {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::WindowsappsAlias => "windowsapps_alias",
            Self::Timeout => "timeout",
            Self::LaunchFailed => "launch_failed",
            Self::RuntimeProbeFailed => "runtime_probe_failed",
            Self::MissingStdlib => "missing_stdlib",
            Self::AccessDenied => "access_denied",
        }
    }
}

/// A probed candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonCandidate {
    /// Where the candidate came from (`workspace_venv`, `virtual_env`,
    /// `usertest_python`, `path`, `current_process`).
    pub source: String,
    /// Candidate executable.
    pub executable: PathBuf,
    /// Usable iff the probe exited 0 and printed parseable JSON.
    pub usable: bool,
    /// Interpreter version when usable.
    pub version: Option<String>,
    /// Rejection reason when unusable.
    pub reason: Option<ProbeReason>,
}

/// Discovery outcome: the first usable candidate wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PythonDiscovery {
    /// Winning interpreter, when any candidate was usable.
    pub selected: Option<PythonCandidate>,
    /// Every candidate probed, in discovery order.
    pub candidates: Vec<PythonCandidate>,
}

/// Whether a path looks like the WindowsApps store alias.
pub fn is_windowsapps_alias(path: &Path) -> bool {
    path.display()
        .to_string()
        .to_lowercase()
        .replace('\\', "/")
        .contains("/windowsapps/")
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    executable: String,
    version: String,
}

/// Probe one candidate executable.
pub async fn probe_python(executable: &Path, source: &str) -> PythonCandidate {
    if is_windowsapps_alias(executable) {
        return PythonCandidate {
            source: source.to_string(),
            executable: executable.to_path_buf(),
            usable: false,
            version: None,
            reason: Some(ProbeReason::WindowsappsAlias),
        };
    }

    let future = tokio::process::Command::new(executable)
        .arg("-c")
        .arg(PROBE_SNIPPET)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output();

    let output =
        match tokio::time::timeout(Duration::from_secs_f64(PROBE_TIMEOUT_SECONDS), future).await
        {
            Err(_) => {
                return PythonCandidate {
                    source: source.to_string(),
                    executable: executable.to_path_buf(),
                    usable: false,
                    version: None,
                    reason: Some(ProbeReason::Timeout),
                };
            }
            Ok(Err(e)) => {
                let reason = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => ProbeReason::AccessDenied,
                    std::io::ErrorKind::NotFound => ProbeReason::NotFound,
                    _ => ProbeReason::LaunchFailed,
                };
                return PythonCandidate {
                    source: source.to_string(),
                    executable: executable.to_path_buf(),
                    usable: false,
                    version: None,
                    reason: Some(reason),
                };
            }
            Ok(Ok(output)) => output,
        };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = if stderr.contains("encodings") {
            ProbeReason::MissingStdlib
        } else {
            ProbeReason::RuntimeProbeFailed
        };
        return PythonCandidate {
            source: source.to_string(),
            executable: executable.to_path_buf(),
            usable: false,
            version: None,
            reason: Some(reason),
        };
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match serde_json::from_str::<ProbeOutput>(stdout.trim()) {
        Ok(parsed) => PythonCandidate {
            source: source.to_string(),
            executable: PathBuf::from(parsed.executable),
            usable: true,
            version: Some(parsed.version),
            reason: None,
        },
        Err(_) => PythonCandidate {
            source: source.to_string(),
            executable: executable.to_path_buf(),
            usable: false,
            version: None,
            reason: Some(ProbeReason::RuntimeProbeFailed),
        },
    }
}

fn venv_python(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join("python.exe")
    } else {
        venv_dir.join("bin").join("python")
    }
}

fn path_lookup(name: &str) -> Vec<PathBuf> {
    let Some(path_var) = std::env::var_os("PATH") else {
        return Vec::new();
    };
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .filter(|candidate| candidate.is_file())
        .collect()
}

/// Discover a usable Python interpreter for `workspace`.
///
/// Order: workspace `.venv`, `VIRTUAL_ENV`, `USERTEST_PYTHON`, PATH
/// alternates for `python` (skipping WindowsApps aliases), then `py`,
/// `python`, `python3` name lookups. The first usable candidate is
/// selected; every probe is recorded.
pub async fn discover_python_runtime(workspace: &Path) -> PythonDiscovery {
    let mut candidates: Vec<(String, PathBuf)> = Vec::new();

    let workspace_venv = venv_python(&workspace.join(".venv"));
    if workspace_venv.is_file() {
        candidates.push(("workspace_venv".to_string(), workspace_venv));
    }
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        if !venv.trim().is_empty() {
            candidates.push(("virtual_env".to_string(), venv_python(Path::new(venv.trim()))));
        }
    }
    if let Ok(forced) = std::env::var("USERTEST_PYTHON") {
        if !forced.trim().is_empty() {
            candidates.push(("usertest_python".to_string(), PathBuf::from(forced.trim())));
        }
    }
    for name in ["python", "py", "python3"] {
        for found in path_lookup(name) {
            candidates.push(("path".to_string(), found));
        }
    }

    let mut discovery = PythonDiscovery::default();
    let mut seen: Vec<PathBuf> = Vec::new();
    for (source, executable) in candidates {
        if seen.contains(&executable) {
            continue;
        }
        seen.push(executable.clone());

        let probed = probe_python(&executable, &source).await;
        let usable = probed.usable;
        discovery.candidates.push(probed.clone());
        if usable && discovery.selected.is_none() {
            discovery.selected = Some(probed);
        }
    }

    if discovery.candidates.is_empty() {
        discovery.candidates.push(PythonCandidate {
            source: "path".to_string(),
            executable: PathBuf::from("python"),
            usable: false,
            version: None,
            reason: Some(ProbeReason::NotFound),
        });
    }
    discovery
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windowsapps_alias_detection() {
        assert!(is_windowsapps_alias(Path::new(
            r"C:\Users\j\AppData\Local\Microsoft\WindowsApps\python.exe"
        )));
        assert!(!is_windowsapps_alias(Path::new("/usr/bin/python3")));
    }

    #[tokio::test]
    async fn alias_candidates_are_rejected_without_launching() {
        let probed = probe_python(
            Path::new(r"C:\Users\j\AppData\Local\Microsoft\WindowsApps\python.exe"),
            "path",
        )
        .await;
        assert!(!probed.usable);
        assert_eq!(probed.reason, Some(ProbeReason::WindowsappsAlias));
    }

    #[tokio::test]
    async fn missing_binary_reports_launch_failure() {
        let probed =
            probe_python(Path::new("/definitely/not/a/python"), "usertest_python").await;
        assert!(!probed.usable);
        assert!(matches!(
            probed.reason,
            Some(ProbeReason::NotFound | ProbeReason::LaunchFailed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_interpreter_with_json_output_is_usable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("python");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho '{\"executable\": \"/opt/py/bin/python\", \"version\": \"3.12.1\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probed = probe_python(&fake, "path").await;
        assert!(probed.usable);
        assert_eq!(probed.version.as_deref(), Some("3.12.1"));
        assert_eq!(probed.executable, PathBuf::from("/opt/py/bin/python"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn garbage_probe_output_is_runtime_probe_failed() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("python");
        std::fs::write(&fake, "#!/bin/sh\necho 'Python 3.12.1'\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probed = probe_python(&fake, "path").await;
        assert!(!probed.usable);
        assert_eq!(probed.reason, Some(ProbeReason::RuntimeProbeFailed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broken_stdlib_is_classified() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("python");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho \"ModuleNotFoundError: No module named 'encodings'\" >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probed = probe_python(&fake, "workspace_venv").await;
        assert_eq!(probed.reason, Some(ProbeReason::MissingStdlib));
    }
}
