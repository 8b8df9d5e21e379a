// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! fieldtest CLI: run agents against targets and mine the history.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "fieldtest", version, about = "Evaluate coding agents against target repos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one agent against a target under a persona + mission.
    Run {
        /// Repo input: local path, URL, or pip:<spec>.
        #[arg(long)]
        repo: String,

        /// Agent to run: codex | claude | gemini.
        #[arg(long)]
        agent: String,

        /// Agent binary (defaults to the agent name).
        #[arg(long)]
        agent_binary: Option<String>,

        /// Persona id (falls back to the catalog default).
        #[arg(long)]
        persona: Option<String>,

        /// Mission id (falls back to the catalog default).
        #[arg(long)]
        mission: Option<String>,

        /// Root directory holding configs/catalog.yaml and catalog docs.
        #[arg(long, default_value = ".")]
        config_root: PathBuf,

        /// Where run artifacts are written.
        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,

        /// Seed index for this run.
        #[arg(long, default_value_t = 0)]
        seed: u32,

        /// Rate-limit retry slots.
        #[arg(long, default_value_t = 2)]
        rate_limit_retries: u32,

        /// Follow-up attempt slots.
        #[arg(long, default_value_t = 2)]
        followup_attempts: u32,

        /// Per-attempt agent timeout in seconds.
        #[arg(long, default_value_t = 3600.0)]
        timeout_seconds: f64,

        /// Verification command (repeatable).
        #[arg(long = "verify-command")]
        verification_commands: Vec<String>,

        /// Execution backend.
        #[arg(long, value_enum, default_value_t = commands::SandboxChoice::Local)]
        sandbox: commands::SandboxChoice,

        /// Docker build context (holds the base Dockerfile).
        #[arg(long)]
        sandbox_context: Option<PathBuf>,

        /// Keep the sandbox container after the run (debugging).
        #[arg(long)]
        keep_container: bool,
    },

    /// Inspect the persona/mission catalog.
    Catalog {
        /// Root directory holding configs/catalog.yaml.
        #[arg(long, default_value = ".")]
        config_root: PathBuf,

        /// Target repo whose overlay should be applied.
        #[arg(long)]
        target: Option<PathBuf>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Compile the run tree into report_history.jsonl.
    History {
        /// Root of the run tree.
        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,

        /// Restrict to one target slug.
        #[arg(long)]
        target: Option<String>,

        /// Output path (defaults to <runs_dir>/report_history.jsonl).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Backlog reports over the aggregated history.
    #[command(subcommand)]
    Reports(ReportsCommands),
}

#[derive(Subcommand, Debug)]
enum ReportsCommands {
    /// Mine atoms, cluster them, and compile the backlog.
    Backlog {
        /// Root of the run tree.
        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,

        /// Target slug to compile.
        #[arg(long)]
        target: String,

        /// Owner repo root whose plan folders are reconciled (repeatable).
        #[arg(long = "owner-root")]
        owner_roots: Vec<PathBuf>,
    },

    /// Export gated tickets as idea files into an owner repo.
    ExportTickets {
        /// Root of the run tree.
        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,

        /// Target slug to export.
        #[arg(long)]
        target: String,

        /// Owner repo root receiving the idea files.
        #[arg(long)]
        owner_root: PathBuf,
    },

    /// Cluster an arbitrary issue list (JSON) into themes.
    Analyze {
        /// Path to a JSON file: a list of issue objects, or `{"tickets":
        /// [...]}`.
        #[arg()]
        input: PathBuf,

        /// Where to write the analysis JSON (defaults next to the input).
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("fieldtest=debug,ft=debug")
    } else {
        EnvFilter::new("fieldtest=info,ft=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result: Result<i32> = match cli.command {
        Commands::Run {
            repo,
            agent,
            agent_binary,
            persona,
            mission,
            config_root,
            runs_dir,
            seed,
            rate_limit_retries,
            followup_attempts,
            timeout_seconds,
            verification_commands,
            sandbox,
            sandbox_context,
            keep_container,
        } => {
            commands::cmd_run(commands::RunArgs {
                repo,
                agent,
                agent_binary,
                persona,
                mission,
                config_root,
                runs_dir,
                seed,
                rate_limit_retries,
                followup_attempts,
                timeout_seconds,
                verification_commands,
                sandbox,
                sandbox_context,
                keep_container,
            })
            .await
        }
        Commands::Catalog {
            config_root,
            target,
            json,
        } => commands::cmd_catalog(&config_root, target.as_deref(), json),
        Commands::History {
            runs_dir,
            target,
            out,
        } => commands::cmd_history(&runs_dir, target.as_deref(), out.as_deref()),
        Commands::Reports(ReportsCommands::Backlog {
            runs_dir,
            target,
            owner_roots,
        }) => commands::cmd_reports_backlog(&runs_dir, &target, owner_roots),
        Commands::Reports(ReportsCommands::ExportTickets {
            runs_dir,
            target,
            owner_root,
        }) => commands::cmd_reports_export_tickets(&runs_dir, &target, &owner_root),
        Commands::Reports(ReportsCommands::Analyze { input, out }) => {
            commands::cmd_reports_analyze(&input, out.as_deref())
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}
