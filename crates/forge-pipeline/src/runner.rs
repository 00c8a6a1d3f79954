//! Task runners: what actually executes one task.
//!
//! The pipeline never runs acoustic tooling itself. [`CommandRunner`] hands
//! each task to an external wrapper program; [`DryRunRunner`] only writes a
//! marker so a whole pipeline can be walked without tooling.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use forge_types::{PipelineConfig, Task};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PipelineError, Result};

#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute `task` once, returning the artifact path on success.
    ///
    /// Must return promptly with [`PipelineError::Cancelled`] once `cancel`
    /// fires.
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<PathBuf>;
}

/// Environment describing `task` to an external program.
pub fn task_env(task: &Task) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let path = |p: &Path| p.display().to_string();

    env.insert("FORGE_TASK_ID".into(), task.id.clone());
    env.insert("FORGE_STAGE".into(), task.stage.to_string());
    env.insert("FORGE_STEP".into(), task.step.clone());
    env.insert("FORGE_OUTPUT".into(), path(&task.output));
    env.insert("FORGE_ATTEMPT".into(), task.attempt.to_string());

    let inputs = &task.inputs;
    if let Some(ckpt) = &inputs.checkpoint {
        env.insert("FORGE_INPUT_MODEL".into(), path(&ckpt.model_dir));
        env.insert("FORGE_INPUT_VERSION".into(), ckpt.version.to_string());
    }
    if let Some(shard) = &inputs.shard {
        env.insert("FORGE_SHARD_LIST".into(), path(&shard.list));
        env.insert("FORGE_SHARD_INDEX".into(), shard.index.to_string());
    }
    if let Some(questions) = &inputs.question_set {
        env.insert("FORGE_QUESTIONS".into(), path(questions));
    }
    if let Some(previous) = &inputs.previous {
        env.insert("FORGE_PREVIOUS".into(), path(previous));
    }
    for (key, value) in &inputs.params {
        env.insert(format!("FORGE_PARAM_{}", key.to_uppercase()), value.clone());
    }
    env
}

/// Experiment-wide paths and front-end options every invocation sees.
pub fn config_env(config: &PipelineConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let common = &config.common;
    env.insert("FORGE_EXP".into(), common.exp.display().to_string());
    let optional = [
        ("FORGE_DATA", &common.data),
        ("FORGE_DICT", &common.dict),
        ("FORGE_TREE_QUESTIONS", &common.tree_questions),
        ("FORGE_SETUP", &common.setup),
        ("FORGE_COMMON", &common.common),
    ];
    for (key, value) in optional {
        if let Some(path) = value {
            env.insert(key.into(), path.display().to_string());
        }
    }
    for (key, value) in config.front_end.params() {
        env.insert(format!("FORGE_FRONT_END_{}", key.to_uppercase()), value);
    }
    env
}

// ── CommandRunner ─────────────────────────────────────────────────────────────

/// Runs `<program> <stage> <step>` with the task described in `FORGE_*`
/// variables. Stdout and stderr go to `<log_dir>/<task_id>.attempt<n>.log`.
pub struct CommandRunner {
    program: PathBuf,
    log_dir: PathBuf,
    base_env: BTreeMap<String, String>,
}

impl CommandRunner {
    pub fn new(program: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            program,
            log_dir,
            base_env: BTreeMap::new(),
        }
    }

    /// Extra variables passed to every invocation (config sections, paths).
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    fn log_path(&self, task: &Task) -> PathBuf {
        self.log_dir
            .join(format!("{}.attempt{}.log", task.id, task.attempt))
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<PathBuf> {
        fs::create_dir_all(&self.log_dir)?;
        if let Some(parent) = task.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let log_path = self.log_path(task);
        let log = fs::File::create(&log_path)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(task.stage.as_str())
            .arg(&task.step)
            .envs(&self.base_env)
            .envs(task_env(task))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PipelineError::TaskExecution {
            task_id: task.id.clone(),
            detail: format!("cannot spawn {}: {e}", self.program.display()),
        })?;
        debug!(task_id = %task.id, attempt = task.attempt, log = %log_path.display(), "runner spawned");

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(PipelineError::Cancelled);
            }
        };

        if !status.success() {
            return Err(PipelineError::TaskExecution {
                task_id: task.id.clone(),
                detail: format!("{status}, see {}", log_path.display()),
            });
        }
        if !task.output.exists() {
            return Err(PipelineError::TaskExecution {
                task_id: task.id.clone(),
                detail: format!("exited cleanly but wrote no {}", task.output.display()),
            });
        }
        Ok(task.output.clone())
    }
}

// ── DryRunRunner ──────────────────────────────────────────────────────────────

/// Writes `<output>/DONE` naming the task and returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunRunner;

#[async_trait]
impl TaskRunner for DryRunRunner {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<PathBuf> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        fs::create_dir_all(&task.output)?;
        fs::write(task.output.join("DONE"), format!("{}\n", task.id))?;
        Ok(task.output.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
