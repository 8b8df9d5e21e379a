// SPDX-License-Identifier: MIT OR Apache-2.0
//! Docker backend.
//!
//! One long-lived container per run: `docker run -d --name sandbox-<id>
//! ... sleep infinity`, with every agent invocation attached through
//! `docker exec -i -w /workspace`. Every docker CLI call is bounded by a
//! per-call timeout (`SANDBOX_RUNNER_DOCKER_TIMEOUT_SECONDS`).

use crate::{
    ARTIFACTS_MOUNT, CACHE_MOUNT, DockerSandboxSpec, ExecOutcome, MountSpec, NetworkMode,
    SandboxError, SandboxInstance, WORKSPACE_MOUNT,
    image::image_tag,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Default per-call docker timeout in seconds.
pub const DEFAULT_DOCKER_TIMEOUT_SECONDS: f64 = 600.0;

/// Resolve the per-call timeout from the environment.
pub fn docker_timeout_seconds() -> f64 {
    std::env::var("SANDBOX_RUNNER_DOCKER_TIMEOUT_SECONDS")
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(DEFAULT_DOCKER_TIMEOUT_SECONDS)
}

/// Restrict a container name to docker's allowed character set.
pub fn sanitize_container_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if !out.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        out.insert(0, 's');
    }
    out
}

async fn docker_call(
    args: &[String],
    log_hint: &str,
) -> Result<ExecOutcome, SandboxError> {
    let timeout_seconds = docker_timeout_seconds();
    let mut argv = vec!["docker".to_string()];
    argv.extend(args.iter().cloned());

    tracing::debug!(?argv, "docker call");
    let future = Command::new("docker")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs_f64(timeout_seconds), future)
        .await
        .map_err(|_| SandboxError::DockerTimeout {
            argv: argv.clone(),
            timeout_seconds,
            log_hint: log_hint.to_string(),
        })?
        .map_err(|e| SandboxError::Io {
            path: "docker".to_string(),
            source: e,
        })?;

    Ok(ExecOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn require_success(
    outcome: ExecOutcome,
    argv_tail: &[String],
) -> Result<ExecOutcome, SandboxError> {
    if outcome.exit_code == 0 {
        return Ok(outcome);
    }
    let stderr_tail: String = outcome
        .stderr
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    Err(SandboxError::DockerFailed {
        argv: std::iter::once("docker".to_string())
            .chain(argv_tail.iter().cloned())
            .collect(),
        exit_code: outcome.exit_code,
        stderr_tail,
    })
}

/// Whether `tag` exists locally.
pub async fn docker_image_exists(tag: &str) -> Result<bool, SandboxError> {
    let args = vec!["image".to_string(), "inspect".to_string(), tag.to_string()];
    let outcome = docker_call(&args, "docker image inspect").await?;
    Ok(outcome.exit_code == 0)
}

/// Build `tag` from the context, streaming `--progress=plain` output into
/// `log_path`.
pub async fn docker_build_streaming(
    tag: &str,
    dockerfile: &Path,
    context_dir: &Path,
    log_path: &Path,
) -> Result<(), SandboxError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SandboxError::io(parent, e))?;
    }
    let mut log = tokio::fs::File::create(log_path)
        .await
        .map_err(|e| SandboxError::io(log_path, e))?;

    let args: Vec<String> = vec![
        "build".into(),
        "--progress=plain".into(),
        "-t".into(),
        tag.into(),
        "-f".into(),
        dockerfile.display().to_string(),
        context_dir.display().to_string(),
    ];
    let timeout_seconds = docker_timeout_seconds();
    let argv: Vec<String> = std::iter::once("docker".to_string())
        .chain(args.iter().cloned())
        .collect();

    let mut child = Command::new("docker")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::Io {
            path: "docker".to_string(),
            source: e,
        })?;

    // Buildkit writes progress to stderr; capture both streams into the log.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let build = async {
        let mut tasks = Vec::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(256);
        if let Some(stdout) = stdout {
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(stderr) = stderr {
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            let _ = log.write_all(line.as_bytes()).await;
            let _ = log.write_all(b"\n").await;
        }
        for task in tasks {
            let _ = task.await;
        }
        child.wait().await
    };

    let status = tokio::time::timeout(Duration::from_secs_f64(timeout_seconds), build)
        .await
        .map_err(|_| SandboxError::DockerTimeout {
            argv: argv.clone(),
            timeout_seconds,
            log_hint: log_path.display().to_string(),
        })?
        .map_err(|e| SandboxError::Io {
            path: "docker".to_string(),
            source: e,
        })?;

    if !status.success() {
        return Err(SandboxError::DockerFailed {
            argv,
            exit_code: status.code().unwrap_or(-1),
            stderr_tail: format!("see build log: {}", log_path.display()),
        });
    }
    let _ = log.flush().await;
    Ok(())
}

/// Build the env argument list: allowlisted host vars first, overrides
/// merged last.
pub fn env_args_with_overrides(
    allowlist: &[String],
    overrides: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for name in allowlist {
        if let Ok(value) = std::env::var(name) {
            merged.insert(name.clone(), value);
        }
    }
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }

    let mut args = Vec::with_capacity(merged.len() * 2);
    for (name, value) in merged {
        args.push("-e".to_string());
        args.push(format!("{name}={value}"));
    }
    args
}

fn mount_args(mounts: &[MountSpec]) -> Vec<String> {
    let mut args = Vec::with_capacity(mounts.len() * 2);
    for mount in mounts {
        args.push("-v".to_string());
        args.push(mount.as_volume_arg());
    }
    args
}

/// A running docker sandbox.
pub struct DockerSandboxInstance {
    /// Container name (`sandbox-<id>`).
    pub container_name: String,
    /// Image tag the container runs.
    pub image_tag: String,
    /// Whether close leaves the container running.
    keep_container: bool,
}

impl SandboxInstance for DockerSandboxInstance {
    fn exec_prefix(&self) -> Vec<String> {
        vec![
            "docker".to_string(),
            "exec".to_string(),
            "-i".to_string(),
            "-w".to_string(),
            WORKSPACE_MOUNT.to_string(),
            self.container_name.clone(),
        ]
    }

    fn process_env(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn workspace_path(&self) -> String {
        WORKSPACE_MOUNT.to_string()
    }
}

impl DockerSandboxInstance {
    /// Remove the container (`docker rm -f`) unless `keep_container` was
    /// set, in which case the name is logged and the container survives.
    pub async fn close(&self) -> Result<(), SandboxError> {
        if self.keep_container {
            tracing::info!(container = %self.container_name, "keeping sandbox container");
            return Ok(());
        }
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            self.container_name.clone(),
        ];
        let outcome = docker_call(&args, "docker rm").await?;
        require_success(outcome, &args).map(|_| ())
    }
}

/// Ensure the content-addressed image exists (building when needed) and
/// start the run's container.
pub async fn start_docker_sandbox(
    spec: &DockerSandboxSpec,
    sandbox_id: &str,
    build_log_path: &Path,
) -> Result<DockerSandboxInstance, SandboxError> {
    let tag = image_tag(&spec.image_repo, &spec.dockerfile, &spec.context_dir)?;

    let cached = !spec.rebuild_image && docker_image_exists(&tag).await?;
    if cached {
        tracing::debug!(%tag, "reusing cached sandbox image");
    } else {
        tracing::info!(%tag, "building sandbox image");
        docker_build_streaming(&tag, &spec.dockerfile, &spec.context_dir, build_log_path)
            .await?;
    }

    let container_name = sanitize_container_name(&format!("sandbox-{sandbox_id}"));

    let mut mounts = vec![
        MountSpec::rw(&spec.workspace_dir, WORKSPACE_MOUNT),
        MountSpec::rw(&spec.artifacts_dir, ARTIFACTS_MOUNT),
    ];
    if let Some(cache_dir) = &spec.cache_dir {
        mounts.push(MountSpec::rw(cache_dir, CACHE_MOUNT));
    }
    mounts.extend(spec.extra_mounts.iter().cloned());

    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        container_name.clone(),
    ];
    if spec.network == NetworkMode::None {
        args.push("--network".into());
        args.push("none".into());
    }
    args.extend(mount_args(&mounts));
    args.extend(env_args_with_overrides(
        &spec.env_allowlist,
        &spec.env_overrides,
    ));
    args.push("-w".into());
    args.push(WORKSPACE_MOUNT.into());
    args.push(tag.clone());
    args.push("sleep".into());
    args.push("infinity".into());

    let outcome = docker_call(&args, "docker run").await?;
    require_success(outcome, &args)?;

    Ok(DockerSandboxInstance {
        container_name,
        image_tag: tag,
        keep_container: spec.keep_container,
    })
}
