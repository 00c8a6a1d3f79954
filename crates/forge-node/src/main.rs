//! forge-node: drives an acoustic-model training experiment.
//!
//! ```bash
//! # Run every enabled stage, in-process, with the configured tool wrapper
//! forge-node train exp.toml
//!
//! # Pick up after a crash or a failed stage
//! forge-node train exp.toml --resume
//!
//! # Walk the whole pipeline without tooling
//! forge-node train exp.toml --dry-run
//!
//! forge-node status exp.toml
//! forge-node plan exp.toml
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use forge_pipeline::{
    config_env, prepare_experiment, CommandRunner, ControllerState, Dispatcher, DryRunRunner,
    LocalDispatcher, PipelineController, RemoteDispatcher, RemoteTimings, RetryPolicy,
    SpoolQueue, StageGraph, StagePlan, TaskRunner,
};
use forge_store::{CheckpointStore, PipelineState};
use forge_types::PipelineConfig;
use tokio_util::sync::CancellationToken;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "forge-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Staged HMM acoustic-model training orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the enabled training stages.
    Train {
        /// Experiment configuration (TOML).
        config: PathBuf,

        /// Continue from the saved pipeline state instead of starting over.
        #[arg(long)]
        resume: bool,

        /// Replace the tool wrapper with a runner that only writes markers.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show completed stages, in-flight progress and the last failure.
    Status { config: PathBuf },

    /// Print the stage order and how many steps each stage dispatches.
    Plan { config: PathBuf },
}

impl Command {
    fn config_path(&self) -> &Path {
        match self {
            Self::Train { config, .. } | Self::Status { config } | Self::Plan { config } => config,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.command.config_path();
    let config = PipelineConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;

    // RUST_LOG wins; otherwise settings.verbose picks the level.
    let default_level = match config.settings.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Arc::new(config);
    match cli.command {
        Command::Train { resume, dry_run, .. } => run_train(config, resume, dry_run).await,
        Command::Status { .. }                 => print_status(&config),
        Command::Plan { .. }                   => print_plan(&config),
    }
}

// ── train ─────────────────────────────────────────────────────────────────────

fn build_dispatcher(config: &PipelineConfig, dry_run: bool) -> Result<Arc<dyn Dispatcher>> {
    let settings = &config.settings;
    let policy = RetryPolicy::from_settings(settings);

    if !settings.local {
        let queue = Arc::new(SpoolQueue::new(config.spool_dir())?);
        let timings = RemoteTimings {
            task_timeout: Duration::from_secs(settings.task_timeout_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
        };
        info!(spool = %config.spool_dir().display(), jobs = settings.jobs, "remote dispatch");
        return Ok(Arc::new(RemoteDispatcher::new(queue, settings.jobs, policy, timings)));
    }

    let runner: Arc<dyn TaskRunner> = if dry_run {
        Arc::new(DryRunRunner)
    } else {
        let program = settings.runner.clone().ok_or_else(|| {
            anyhow!("settings.runner is required for local runs (or pass --dry-run)")
        })?;
        Arc::new(CommandRunner::new(program, config.log_dir()).with_env(config_env(config)))
    };
    info!(jobs = settings.jobs, dry_run, "local dispatch");
    Ok(Arc::new(LocalDispatcher::new(runner, settings.jobs, policy)))
}

async fn run_train(config: Arc<PipelineConfig>, resume: bool, dry_run: bool) -> Result<()> {
    if dry_run && !config.settings.local {
        warn!("--dry-run only replaces the local runner; remote tickets are still spooled");
    }
    let dispatcher = build_dispatcher(&config, dry_run)?;
    let state = prepare_experiment(&config, resume)?;
    let controller = PipelineController::new(config.clone(), dispatcher)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, cancelling in-flight tasks");
            on_signal.cancel();
        }
    });

    let report = controller.run(state, cancel).await?;
    match report.outcome {
        ControllerState::PipelineComplete => {
            info!(
                exp = %config.exp_dir().display(),
                completed = report.state.completed.len(),
                "training finished"
            );
            Ok(())
        }
        ControllerState::Failed { stage, reason } => {
            bail!("stage {stage} failed: {reason}")
        }
        other => bail!("pipeline stopped in unexpected state {other}"),
    }
}

// ── status ────────────────────────────────────────────────────────────────────

fn print_status(config: &PipelineConfig) -> Result<()> {
    let Some(state) = PipelineState::load(&config.state_path())? else {
        println!("no pipeline state under {}", config.exp_dir().display());
        return Ok(());
    };

    println!("experiment  {}", config.exp_dir().display());
    println!("created     {}", state.created_at);
    for (stage, record) in &state.completed {
        println!(
            "  done      {:<24} v{:<4} {}",
            stage.as_str(),
            record.version,
            record.completed_at
        );
    }
    if let Some(progress) = &state.in_progress {
        println!(
            "  running   {:<24} {} tasks done since {}",
            progress.stage.as_str(),
            progress.completed_tasks.len(),
            progress.started_at
        );
    }
    if let Some(failure) = &state.last_failure {
        println!("  failed    {:<24} {} ({})", failure.stage.as_str(), failure.reason, failure.at);
    }

    let current = if config.checkpoint_dir().exists() {
        CheckpointStore::new(config.checkpoint_dir())?.current()?
    } else {
        None
    };
    match current {
        Some(current) => println!(
            "checkpoint  v{} {} ({} artifacts, {} bytes)",
            current.version,
            current.stage,
            current.artifacts.len(),
            current.total_bytes()
        ),
        None => println!("checkpoint  none"),
    }
    Ok(())
}

// ── plan ──────────────────────────────────────────────────────────────────────

fn print_plan(config: &PipelineConfig) -> Result<()> {
    let graph = StageGraph::from_config(config)?;
    let state = PipelineState::load(&config.state_path())?.unwrap_or_default();
    let completed = state.completed_set();

    // Mixture counts flow along the input edges, as they will at run time.
    let mut mixtures = BTreeMap::new();
    for (stage, record) in &state.completed {
        if let Ok(checkpoint) = CheckpointStore::load(&record.checkpoint) {
            mixtures.insert(*stage, checkpoint.mixtures);
        }
    }
    for stage in graph.enabled_stages(&completed)? {
        let input_mixtures = stage
            .inputs
            .iter()
            .find_map(|i| mixtures.get(i).copied())
            .unwrap_or(1);
        let plan = StagePlan::build(stage.name, config, input_mixtures);
        mixtures.insert(stage.name, plan.output_mixtures);

        let note = if completed.contains(&stage.name) { "  (complete)" } else { "" };
        println!(
            "{:<24} {:>4} steps  mixtures {}{note}",
            stage.name.as_str(),
            plan.step_count(),
            plan.output_mixtures
        );
    }
    Ok(())
}
