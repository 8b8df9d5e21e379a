// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command handlers. The CLI layer stays thin: argument plumbing, catalog
//! resolution, and exit-code mapping; the crates underneath do the work.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use ft_backlog::{GatePolicy, PipelineOptions, run_backlog_pipeline, run_export_pipeline};
use ft_catalog::{discover_missions, discover_personas, load_catalog_config};
use ft_history::{EmbedLevel, write_report_history_jsonl};
use ft_runner::acquire::acquire_target;
use ft_runner::orchestrator::{AgentCommand, RunPolicy, RunSpec, run_once, write_early_failure};
use ft_runner::preflight::{PreflightSpec, run_preflight};
use ft_runner::prompt::compose_prompt;
use ft_sandbox::overlay::{
    CliInstallSpec, load_target_cli_install, materialize_image_context, read_requires_python,
};
use ft_sandbox::{DockerSandboxSpec, SandboxInstance, WORKSPACE_MOUNT, docker::start_docker_sandbox};
use ft_triage::{
    ClusterOptions, HashingEmbedder, ItemSource, build_item_vectors, classify_theme,
    cluster_items_knn, default_embedder,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

/// Arguments for [`cmd_run`].
pub struct RunArgs {
    pub repo: String,
    pub agent: String,
    pub agent_binary: Option<String>,
    pub persona: Option<String>,
    pub mission: Option<String>,
    pub config_root: PathBuf,
    pub runs_dir: PathBuf,
    pub seed: u32,
    pub rate_limit_retries: u32,
    pub followup_attempts: u32,
    pub timeout_seconds: f64,
    pub verification_commands: Vec<String>,
    pub sandbox: SandboxChoice,
    pub sandbox_context: Option<PathBuf>,
    pub keep_container: bool,
}

/// Execution backend for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SandboxChoice {
    /// Direct subprocess on the host.
    Local,
    /// Docker container with content-addressed image reuse.
    Docker,
}

fn target_slug_for(repo: &str) -> String {
    let base = repo
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(repo);
    let slug: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            c
        } else {
            '_'
        })
        .collect();
    if slug.is_empty() { "target".to_string() } else { slug }
}

/// `fieldtest run`: acquire, preflight, compose, and drive the agent loop.
pub async fn cmd_run(args: RunArgs) -> Result<i32> {
    let run_started = Utc::now();
    let target_slug = target_slug_for(&args.repo);
    let run_dir = args
        .runs_dir
        .join(&target_slug)
        .join(ft_core::timestamp_dirname(run_started))
        .join(&args.agent)
        .join(args.seed.to_string());
    let workspace_dir = run_dir.join("workspace");

    // Acquire.
    let acquired = match acquire_target(&args.repo, &workspace_dir, None) {
        Ok(acquired) => acquired,
        Err(error) => {
            write_early_failure(&run_dir, &error, run_started)?;
            eprintln!("error: {error:#}");
            return Ok(1);
        }
    };

    // Catalog.
    let catalog_result = (|| {
        let config =
            load_catalog_config(&args.config_root, Some(&acquired.workspace_dir))?;
        let personas = discover_personas(&config)?;
        let missions = discover_missions(&config)?;
        Ok::<_, ft_catalog::CatalogError>((config, personas, missions))
    })();
    let (config, personas, missions) = match catalog_result {
        Ok(resolved) => resolved,
        Err(error) => {
            let error = ft_runner::RunnerError::Catalog(error);
            write_early_failure(&run_dir, &error, run_started)?;
            eprintln!("error: {error:#}");
            return Ok(1);
        }
    };

    let persona_id = args
        .persona
        .or(config.defaults_persona_id.clone())
        .context("no persona given and the catalog has no default")?;
    let mission_id = args
        .mission
        .or(config.defaults_mission_id.clone())
        .context("no mission given and the catalog has no default")?;
    let persona = personas
        .get(&persona_id)
        .with_context(|| format!("unknown persona id {persona_id:?}"))?;
    let mission = missions
        .get(&mission_id)
        .with_context(|| format!("unknown mission id {mission_id:?}"))?;

    let template_path = config.prompt_templates_dir.join(&mission.prompt_template);
    let prompt_template = std::fs::read_to_string(&template_path)
        .with_context(|| format!("reading prompt template {}", template_path.display()))?;
    let schema_path = config.report_schemas_dir.join(&mission.report_schema);
    let report_schema: Value = serde_json::from_str(
        &std::fs::read_to_string(&schema_path)
            .with_context(|| format!("reading report schema {}", schema_path.display()))?,
    )
    .with_context(|| format!("parsing report schema {}", schema_path.display()))?;

    // Preflight.
    let agent_binary = args.agent_binary.unwrap_or_else(|| args.agent.clone());
    let preflight_spec = PreflightSpec {
        agent: args.agent.clone(),
        agent_binary,
        required_commands: Vec::new(),
        overrides: Default::default(),
        requires_shell: mission.requires_shell,
        shell_allowed: true,
        verification_commands: args.verification_commands.clone(),
        workspace_dir: acquired.workspace_dir.clone(),
    };
    let preflight = match run_preflight(&preflight_spec).await {
        Ok(doc) => doc,
        Err(error) => {
            write_early_failure(&run_dir, &error, run_started)?;
            eprintln!("error: {error:#}");
            return Ok(1);
        }
    };

    // Sandbox.
    let mut exec_prefix: Vec<String> = Vec::new();
    let mut workspace_mount: Option<String> = None;
    let mut sandbox_instance = None;
    if args.sandbox == SandboxChoice::Docker {
        let context_root = args
            .sandbox_context
            .clone()
            .context("--sandbox docker requires --sandbox-context")?;
        let base_dockerfile = context_root.join("Dockerfile");

        let mut install = CliInstallSpec::default();
        if let Some(target_install) = load_target_cli_install(&acquired.workspace_dir)? {
            install.merge(&target_install);
        }
        let requires_python = read_requires_python(&acquired.workspace_dir);
        let image_context = materialize_image_context(
            &run_dir,
            &base_dockerfile,
            &install,
            requires_python.as_deref(),
        )?;

        let sandbox_spec = DockerSandboxSpec {
            image_repo: "fieldtest-sandbox".to_string(),
            context_dir: image_context.context_dir.clone(),
            dockerfile: image_context.dockerfile.clone(),
            workspace_dir: acquired.workspace_dir.clone(),
            artifacts_dir: run_dir.clone(),
            cache_dir: None,
            extra_mounts: Vec::new(),
            env_allowlist: Vec::new(),
            env_overrides: Default::default(),
            network: Default::default(),
            rebuild_image: false,
            keep_container: args.keep_container,
        };
        let sandbox_id = format!(
            "{target_slug}-{}-{}",
            args.agent,
            ft_core::timestamp_dirname(run_started)
        );
        let build_log = run_dir.join("sandbox").join("docker_build.log");
        let instance =
            start_docker_sandbox(&sandbox_spec, &sandbox_id, &build_log).await?;
        exec_prefix = instance.exec_prefix();
        workspace_mount = Some(WORKSPACE_MOUNT.to_string());
        sandbox_instance = Some(instance);
    }

    // Compose + AgentLoop.
    let prompt = compose_prompt(
        &prompt_template,
        &persona.body_md,
        &mission.body_md,
        &report_schema.to_string(),
    );
    let spec = RunSpec {
        run_dir: run_dir.clone(),
        workspace_dir: acquired.workspace_dir.clone(),
        agent: args.agent.clone(),
        agent_command: AgentCommand {
            binary: preflight_spec.agent_binary.clone(),
            args: Vec::new(),
            last_message_flag: "--output-last-message".to_string(),
        },
        exec_prefix,
        workspace_mount,
        env: Default::default(),
        repo_input: args.repo.clone(),
        commit_sha: acquired.commit_sha.clone(),
        persona_id: persona.id.clone(),
        persona_source_md: std::fs::read_to_string(&persona.source_path)
            .unwrap_or_else(|_| persona.body_md.clone()),
        persona_resolved_md: persona.body_md.clone(),
        mission_id: mission.id.clone(),
        mission_source_md: std::fs::read_to_string(&mission.source_path)
            .unwrap_or_else(|_| mission.body_md.clone()),
        mission_resolved_md: mission.body_md.clone(),
        prompt_template_md: prompt_template,
        prompt,
        report_schema,
        policy: RunPolicy {
            rate_limit_retries: args.rate_limit_retries,
            followup_attempts: args.followup_attempts,
            timeout_seconds: args.timeout_seconds,
            verification_commands: args.verification_commands,
            ..RunPolicy::default()
        },
        preflight,
    };

    let outcome = run_once(&spec).await;
    if let Some(instance) = sandbox_instance {
        if let Err(e) = instance.close().await {
            tracing::warn!(error = %e, "failed to close sandbox container");
        }
    }
    let outcome = outcome?;
    println!(
        "run finished: exit={} attempts={} report={}",
        outcome.exit_code,
        outcome.attempts.attempts.len(),
        if outcome.report_ok { "ok" } else { "missing" }
    );
    println!("artifacts: {}", run_dir.display());
    Ok(outcome.exit_code)
}

/// `fieldtest catalog`: list resolved personas and missions.
pub fn cmd_catalog(config_root: &Path, target: Option<&Path>, as_json: bool) -> Result<i32> {
    let config = load_catalog_config(config_root, target)?;
    let personas = discover_personas(&config)?;
    let missions = discover_missions(&config)?;

    if as_json {
        let payload = json!({
            "defaults": {
                "persona_id": config.defaults_persona_id,
                "mission_id": config.defaults_mission_id,
            },
            "personas": personas.values().map(|p| json!({
                "id": p.id, "name": p.name, "extends": p.extends,
            })).collect::<Vec<_>>(),
            "missions": missions.values().map(|m| json!({
                "id": m.id, "name": m.name, "extends": m.extends,
                "execution_mode": m.execution_mode, "tags": m.tags,
                "requires_shell": m.requires_shell,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(0);
    }

    println!("personas ({}):", personas.len());
    for persona in personas.values() {
        println!("  {}  {}", persona.id, persona.name);
    }
    println!("missions ({}):", missions.len());
    for mission in missions.values() {
        println!(
            "  {}  {}  [{}]",
            mission.id,
            mission.name,
            mission.tags.join(", ")
        );
    }
    Ok(0)
}

/// `fieldtest history`: compile the run tree into a JSONL file.
pub fn cmd_history(
    runs_dir: &Path,
    target: Option<&str>,
    out: Option<&Path>,
) -> Result<i32> {
    let out_path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| runs_dir.join("report_history.jsonl"));
    let counts = write_report_history_jsonl(
        runs_dir,
        &out_path,
        target,
        EmbedLevel::Definitions,
        200_000,
    )?;
    println!(
        "history compiled: total={} ok={} missing_report={} validation={} error={}",
        counts.total,
        counts.ok,
        counts.missing_report,
        counts.report_validation_error,
        counts.error
    );
    println!("wrote {}", out_path.display());
    Ok(0)
}

/// `fieldtest reports backlog`.
pub fn cmd_reports_backlog(
    runs_dir: &Path,
    target: &str,
    owner_roots: Vec<PathBuf>,
) -> Result<i32> {
    let opts = PipelineOptions {
        runs_dir: runs_dir.to_path_buf(),
        target_slug: target.to_string(),
        owner_roots,
        policy: GatePolicy::default(),
        now: Utc::now(),
    };
    let embedder = default_embedder()?;
    let output = run_backlog_pipeline(&opts, embedder.as_ref())?;
    println!(
        "backlog compiled: atoms={} clusters={} tickets={}",
        output.doc.totals.atoms_total,
        output.doc.totals.clusters_total,
        output.doc.totals.tickets_total
    );
    println!("compiled artifacts: {}", output.compiled_dir.display());
    Ok(0)
}

/// `fieldtest reports export-tickets`.
pub fn cmd_reports_export_tickets(
    runs_dir: &Path,
    target: &str,
    owner_root: &Path,
) -> Result<i32> {
    let opts = PipelineOptions {
        runs_dir: runs_dir.to_path_buf(),
        target_slug: target.to_string(),
        owner_roots: vec![owner_root.to_path_buf()],
        policy: GatePolicy::default(),
        now: Utc::now(),
    };
    let embedder = default_embedder()?;
    let output = run_backlog_pipeline(&opts, embedder.as_ref())?;
    let report = run_export_pipeline(&opts, &output.doc, owner_root)?;
    println!(
        "export finished: exported={} skipped_existing={} stale_removed={}",
        report.exports_total, report.skipped_existing_plan, report.stale_removed
    );
    Ok(0)
}

/// `fieldtest reports analyze`: cluster an arbitrary issue list.
pub fn cmd_reports_analyze(input: &Path, out: Option<&Path>) -> Result<i32> {
    let payload: Value = serde_json::from_str(&std::fs::read_to_string(input)?)
        .with_context(|| format!("parsing {}", input.display()))?;

    let items: Vec<Value> = match &payload {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("tickets")
            .or_else(|| map.get("issues"))
            .and_then(Value::as_array)
            .cloned()
            .context("expected a list or an object with a `tickets` list")?,
        _ => bail!("expected a list or an object with a `tickets` list"),
    };

    let sources: Vec<ItemSource> = items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let title = item
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
                .with_context(|| format!("issue at index {idx} is missing `title`"))?;
            let chunks = ["problem", "body", "notes", "user_impact", "proposed_fix"]
                .iter()
                .filter_map(|field| item.get(*field).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            Ok(ItemSource {
                title,
                chunks,
                evidence_ids: Vec::new(),
            })
        })
        .collect::<Result<_>>()?;

    let embedder = HashingEmbedder::default();
    let vectors = build_item_vectors(&sources, &embedder, 12_000)?;
    let clusters = cluster_items_knn(&vectors, &ClusterOptions::default());

    let themes: Vec<Value> = clusters
        .iter()
        .enumerate()
        .map(|(idx, members)| {
            let representative = &sources[members[0]];
            json!({
                "id": idx + 1,
                "size": members.len(),
                "representative_title": representative.title,
                "theme": classify_theme(&representative.title).as_str(),
                "issue_indices": members,
            })
        })
        .collect();

    let analysis = json!({
        "schema_version": ft_core::SCHEMA_VERSION,
        "generated_at_utc": ft_core::utc_timestamp(Utc::now()),
        "totals": {
            "issues_total": items.len(),
            "theme_clusters_total": clusters.len(),
        },
        "themes": themes,
    });

    let out_path = out.map(Path::to_path_buf).unwrap_or_else(|| {
        input.with_extension("analysis.json")
    });
    ft_core::io::write_json_pretty(&out_path, &analysis)?;
    println!(
        "analysis written: issues={} themes={} -> {}",
        items.len(),
        clusters.len(),
        out_path.display()
    );
    Ok(0)
}
