//! The durable pipeline-state record.
//!
//! This is the sole source of truth for resume. It is passed into the
//! controller and handed back out; nothing else holds pipeline progress.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use forge_types::StageName;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_atomic;
use crate::error::{Result, StoreError};

/// Completion entry for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub completed_at: String,
    pub checkpoint: PathBuf,
    pub version: u32,
}

/// Tasks already finished inside the stage that is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: StageName,
    pub started_at: String,
    pub completed_tasks: BTreeSet<String>,
}

/// Why the last run stopped, kept for `status` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: StageName,
    pub reason: String,
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub created_at: String,
    pub completed: BTreeMap<StageName, StageRecord>,
    pub last_completed: Option<StageName>,
    /// Checkpoint of the most recently completed stage.
    pub checkpoint: Option<PathBuf>,
    pub in_progress: Option<StageProgress>,
    #[serde(default)]
    pub last_failure: Option<FailureRecord>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            created_at: chrono::Utc::now().to_rfc3339(),
            completed: BTreeMap::new(),
            last_completed: None,
            checkpoint: None,
            in_progress: None,
            last_failure: None,
        }
    }

    /// Load a persisted record. `Ok(None)` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(path)?;
        let state = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
        Ok(Some(state))
    }

    /// Atomically persist the record as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(path, &bytes)?;
        debug!(path = %path.display(), "pipeline state saved");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn is_complete(&self, stage: StageName) -> bool {
        self.completed.contains_key(&stage)
    }

    pub fn completed_set(&self) -> BTreeSet<StageName> {
        self.completed.keys().copied().collect()
    }

    pub fn record(&self, stage: StageName) -> Option<&StageRecord> {
        self.completed.get(&stage)
    }

    /// True if `task_id` finished inside the currently running `stage`.
    pub fn is_task_done(&self, stage: StageName, task_id: &str) -> bool {
        self.in_progress
            .as_ref()
            .is_some_and(|p| p.stage == stage && p.completed_tasks.contains(task_id))
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// Open (or reopen, on resume) the progress entry for `stage`.
    ///
    /// Task completions recorded for the same stage are kept; progress of any
    /// other stage is discarded.
    pub fn begin_stage(&mut self, stage: StageName) {
        match &self.in_progress {
            Some(p) if p.stage == stage => {}
            _ => {
                self.in_progress = Some(StageProgress {
                    stage,
                    started_at: chrono::Utc::now().to_rfc3339(),
                    completed_tasks: BTreeSet::new(),
                });
            }
        }
    }

    pub fn record_tasks<I>(&mut self, stage: StageName, task_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.begin_stage(stage);
        if let Some(progress) = self.in_progress.as_mut() {
            progress.completed_tasks.extend(task_ids);
        }
    }

    /// Mark `stage` complete. The checkpoint must already be committed.
    pub fn complete_stage(&mut self, stage: StageName, checkpoint: PathBuf, version: u32) {
        self.completed.insert(
            stage,
            StageRecord {
                completed_at: chrono::Utc::now().to_rfc3339(),
                checkpoint: checkpoint.clone(),
                version,
            },
        );
        self.last_completed = Some(stage);
        self.checkpoint = Some(checkpoint);
        self.in_progress = None;
        self.last_failure = None;
    }

    pub fn record_failure(&mut self, stage: StageName, reason: &str) {
        self.last_failure = Some(FailureRecord {
            stage,
            reason: reason.to_string(),
            at: chrono::Utc::now().to_rfc3339(),
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
