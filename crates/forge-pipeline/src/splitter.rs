//! Corpus sharding and step → task expansion.
//!
//! Utterances are assigned to shards by hashing their id, so the partition
//! depends only on the corpus and the shard count. Retries and restarts see
//! identical shards and therefore identical task ids.

use std::fs;
use std::path::{Path, PathBuf};

use forge_store::write_atomic;
use forge_types::task::ShardRef;
use forge_types::{StageName, Task, TaskInputs};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::plan::{ConcreteStep, StepShape};

// ── Corpus ────────────────────────────────────────────────────────────────────

/// Utterance ids of the training corpus, in setup-file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpus {
    utterances: Vec<String>,
}

impl Corpus {
    /// Read a setup file. Each non-blank line is
    /// `<wav> <config> <transcription>`; the first field is the id.
    pub fn load(setup: &Path) -> Result<Self> {
        let text = fs::read_to_string(setup).map_err(|e| {
            PipelineError::Configuration(format!("cannot read setup {}: {e}", setup.display()))
        })?;
        let utterances = text
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect();
        Ok(Self { utterances })
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            utterances: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}

// ── Shard plan ────────────────────────────────────────────────────────────────

/// Shard an utterance id lands in.
pub fn shard_for(utterance: &str, count: u32) -> u32 {
    let hash = blake3::hash(utterance.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(head) % u64::from(count.max(1))) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    shards: Vec<Vec<String>>,
}

impl ShardPlan {
    /// Partition `corpus` into `min(jobs, utterances)` shards, at least one.
    pub fn new(corpus: &Corpus, jobs: u32) -> Self {
        let count = (jobs as usize).min(corpus.len()).max(1) as u32;
        let mut shards = vec![Vec::new(); count as usize];
        for id in &corpus.utterances {
            shards[shard_for(id, count) as usize].push(id.clone());
        }
        Self { shards }
    }

    pub fn count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard(&self, index: u32) -> &[String] {
        &self.shards[index as usize]
    }

    /// Write one list file per shard under `<dir>/<count>/shard-NNN.list`.
    ///
    /// Files whose content is already identical are left untouched.
    pub fn materialize(&self, dir: &Path) -> Result<Vec<ShardRef>> {
        let root = dir.join(self.count().to_string());
        fs::create_dir_all(&root)?;

        let mut refs = Vec::with_capacity(self.shards.len());
        for (index, ids) in self.shards.iter().enumerate() {
            let list = root.join(format!("shard-{index:03}.list"));
            let mut body = ids.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            let unchanged = fs::read(&list).is_ok_and(|existing| existing == body.as_bytes());
            if !unchanged {
                write_atomic(&list, body.as_bytes())?;
            }
            refs.push(ShardRef {
                index: index as u32,
                list,
                utterances: ids.len(),
            });
        }
        debug!(count = refs.len(), dir = %root.display(), "shards materialized");
        Ok(refs)
    }
}

// ── Job splitter ──────────────────────────────────────────────────────────────

/// Expands one step into the tasks that execute it.
#[derive(Debug, Clone)]
pub struct JobSplitter {
    work_dir: PathBuf,
}

impl JobSplitter {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    /// `work/<stage>/<step key>`
    pub fn step_dir(&self, stage: StageName, step: &ConcreteStep) -> PathBuf {
        self.work_dir.join(stage.as_str()).join(&step.key)
    }

    /// One task per non-empty shard for sharded steps, one task otherwise.
    ///
    /// `base` carries the inputs common to every task of the step; the step's
    /// parameters are merged over its params.
    pub fn split(
        &self,
        stage: StageName,
        step: &ConcreteStep,
        shards: &[ShardRef],
        base: &TaskInputs,
    ) -> Vec<Task> {
        let dir = self.step_dir(stage, step);
        let mut inputs = base.clone();
        inputs.params.extend(step.params.clone());

        match step.shape {
            StepShape::Single => {
                let id = format!("{stage}.{}", step.key);
                vec![Task::new(id, stage, step.label.clone(), inputs, dir.join("out"))]
            }
            StepShape::Sharded => shards
                .iter()
                .filter(|s| s.utterances > 0)
                .map(|shard| {
                    let id = format!("{stage}.{}.s{:03}", step.key, shard.index);
                    let mut inputs = inputs.clone();
                    inputs.shard = Some(shard.clone());
                    let output = dir.join(format!("s{:03}", shard.index));
                    Task::new(id, stage, step.label.clone(), inputs, output)
                })
                .collect(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
