// Units of work dispatched to workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::ModelCheckpoint;
use crate::stage::StageName;

// ── Status ───────────────────────────────────────────────────────────────────

/// Pending → Running → Succeeded | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed    => write!(f, "failed"),
        }
    }
}

// ── Inputs ───────────────────────────────────────────────────────────────────

/// One data shard of the training corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub index: u32,
    /// File listing the shard's utterance ids, one per line.
    pub list: PathBuf,
    pub utterances: usize,
}

/// Named inputs of a task.
///
/// The checkpoint is shared with every other task of the stage; tasks never
/// own a copy of it.
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    pub checkpoint: Option<Arc<ModelCheckpoint>>,
    pub shard: Option<ShardRef>,
    pub question_set: Option<PathBuf>,
    /// Output directory of the preceding step of the same stage.
    pub previous: Option<PathBuf>,
    /// Opaque step parameters handed to the runner.
    pub params: BTreeMap<String, String>,
}

// ── Task ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Task {
    /// Deterministic id, e.g. `flat_start.mono_iters.m1.i03.accumulate.s007`.
    pub id: String,
    pub stage: StageName,
    /// Step label within the stage.
    pub step: String,
    pub inputs: TaskInputs,
    /// Where the task must write its artifact.
    pub output: PathBuf,
    pub attempt: u32,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: String, stage: StageName, step: String, inputs: TaskInputs, output: PathBuf) -> Self {
        Self {
            id,
            stage,
            step,
            inputs,
            output,
            attempt: 0,
            status: TaskStatus::Pending,
        }
    }

    pub fn shard_index(&self) -> Option<u32> {
        self.inputs.shard.as_ref().map(|s| s.index)
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Final resolution of a task after the dispatcher's retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded {
        task_id: String,
        artifact: PathBuf,
        attempts: u32,
    },
    Failed {
        task_id: String,
        error: String,
        attempts: u32,
    },
}

impl TaskOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Succeeded { task_id, .. } | Self::Failed { task_id, .. } => task_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}
