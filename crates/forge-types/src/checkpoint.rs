// Versioned model snapshots produced by completed stages.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::stage::StageName;

/// One task artifact folded into a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub task_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// BLAKE3 digest of the artifact (hex, 64 chars).
    pub blake3_hash: String,
}

/// Snapshot of trained parameters written by the controller when a stage
/// completes. The next stage reads its model from `model_dir`.
///
/// Serialized as CBOR on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    /// Monotonic version, unique within an experiment.
    pub version: u32,
    pub stage: StageName,
    /// Directory holding the final model files of the stage.
    pub model_dir: PathBuf,
    /// Mixture components per state in the final model.
    pub mixtures: u32,
    /// Version of the checkpoint this one was trained from.
    pub input_version: Option<u32>,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: String,
}

impl ModelCheckpoint {
    /// File name inside the checkpoint directory, e.g. `0003-mono_to_tri.cbor`.
    pub fn file_name(&self) -> String {
        format!("{:04}-{}.cbor", self.version, self.stage)
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size_bytes).sum()
    }
}
