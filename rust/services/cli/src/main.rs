//! Sluice command-line front end
//!
//! `sluice run` executes a workflow from a parsed script file; `sluice clean`
//! drops persisted run state. The script file is the JSON form emitted by the
//! surface-language parser.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sl_core::{Config, SigMode};
use sl_engine::Executor;
use sl_sig::SignatureStore;
use sl_workflow::Script;

#[derive(Parser)]
#[command(name = "sluice", version, about = "DAG workflow engine with incremental re-execution")]
struct Cli {
    /// Log filter, e.g. `info` or `sl_engine=debug`
    #[arg(long, global = true, env = "SLUICE_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow from a parsed script
    Run {
        /// Parsed script (JSON)
        script: PathBuf,

        /// Workflow to run; defaults to the script's single or `default` one
        workflow: Option<String>,

        /// Number of concurrent workers
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Touch outputs instead of running actions
        #[arg(long)]
        dryrun: bool,

        /// Signature mode: default, force, ignore, build or assert
        #[arg(long, value_name = "MODE")]
        mode: Option<SigMode>,

        /// Workspace directory for signatures and logs
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Print the completion report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove persisted signatures (and, with --all, the whole workspace)
    Clean {
        /// Workspace directory
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Also remove the execution log and run metadata
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let base_config = Config::load().unwrap_or_default();

    let filter = cli
        .log
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(base_config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run {
            script,
            workflow,
            jobs,
            dryrun,
            mode,
            workspace,
            json,
        } => {
            let mut config = base_config;
            if let Some(jobs) = jobs {
                config.jobs = jobs;
            }
            if let Some(mode) = mode {
                config.sig_mode = mode;
            }
            if dryrun {
                config.dry_run = true;
            }
            if let Some(dir) = workspace {
                config.workspace_dir = dir;
            }

            let text = std::fs::read_to_string(&script)?;
            let script = Script::from_json(&text)?;
            let report = Executor::new(script, config)
                .execute(workflow.as_deref())
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Clean { workspace, all } => {
            let dir = workspace.unwrap_or(base_config.workspace_dir);
            let removed = SignatureStore::clean(&dir)?;
            info!(records = removed, "Removed signature records");
            if all && dir.exists() {
                std::fs::remove_dir_all(&dir)?;
                info!(dir = %dir.display(), "Removed workspace");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &sl_engine::ExecutionReport) {
    println!(
        "workflow '{}' ({}): {:?} in {}ms",
        report.workflow, report.run_id, report.status, report.elapsed_ms
    );
    for step in &report.steps {
        println!(
            "  {:<40} {:?} ({} substeps, {} skipped, {} failed)",
            step.node, step.state, step.groups, step.skipped, step.failed
        );
    }
    for failure in &report.failures {
        eprintln!(
            "failed: {} [{}]: {}",
            failure.step, failure.index, failure.diagnostic
        );
    }
    if !report.unresolved.is_empty() {
        eprintln!("unresolved targets: {}", report.unresolved.join(", "));
    }
}
