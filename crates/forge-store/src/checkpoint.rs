//! Versioned on-disk checkpoint store.
//!
//! Layout:
//!
//! ```text
//! <checkpoint_dir>/
//!   0001-coding.cbor
//!   0002-flat_start.cbor
//!   CURRENT            ← file name of the newest committed checkpoint
//! ```
//!
//! A commit writes the manifest atomically and only then swaps `CURRENT`,
//! also atomically. A checkpoint that never reached `CURRENT` is ignored.

use std::fs;
use std::path::{Path, PathBuf};

use forge_types::{ArtifactRef, ModelCheckpoint, StageName};
use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::error::{Result, StoreError};
use crate::verify;

const CURRENT: &str = "CURRENT";

/// Filesystem-backed checkpoint store. Only the controller writes to it.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (or create) a checkpoint store rooted at `dir`.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path on disk for a given checkpoint.
    pub fn path_of(&self, checkpoint: &ModelCheckpoint) -> PathBuf {
        self.dir.join(checkpoint.file_name())
    }

    /// Digest every artifact and assemble the next checkpoint version.
    ///
    /// `artifacts` are `(task_id, path)` pairs of the stage's final step.
    pub fn seal(
        &self,
        stage: StageName,
        model_dir: PathBuf,
        mixtures: u32,
        input_version: Option<u32>,
        artifacts: &[(String, PathBuf)],
    ) -> Result<ModelCheckpoint> {
        let mut refs = Vec::with_capacity(artifacts.len());
        for (task_id, path) in artifacts {
            let (size_bytes, blake3_hash) = verify::digest_path(path)?;
            refs.push(ArtifactRef {
                task_id: task_id.clone(),
                path: path.clone(),
                size_bytes,
                blake3_hash,
            });
        }

        Ok(ModelCheckpoint {
            version: self.latest_version()? + 1,
            stage,
            model_dir,
            mixtures,
            input_version,
            artifacts: refs,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Durably write `checkpoint` and make it the current one.
    pub fn commit(&self, checkpoint: &ModelCheckpoint) -> Result<PathBuf> {
        let path = self.path_of(checkpoint);
        let mut buf: Vec<u8> = Vec::new();
        ciborium::ser::into_writer(checkpoint, &mut buf)
            .map_err(|e| StoreError::Serialization(format!("CBOR serialization: {e}")))?;
        write_atomic(&path, &buf)?;
        write_atomic(&self.dir.join(CURRENT), checkpoint.file_name().as_bytes())?;

        info!(
            path = %path.display(),
            stage = %checkpoint.stage,
            version = checkpoint.version,
            artifacts = checkpoint.artifacts.len(),
            "checkpoint committed"
        );
        Ok(path)
    }

    /// Read a checkpoint manifest from a CBOR file.
    pub fn load(path: &Path) -> Result<ModelCheckpoint> {
        if !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        let data = fs::read(path)?;
        ciborium::de::from_reader(&data[..])
            .map_err(|e| StoreError::Serialization(format!("CBOR deserialization: {e}")))
    }

    /// The checkpoint `CURRENT` points at, if any.
    pub fn current(&self) -> Result<Option<ModelCheckpoint>> {
        let pointer = self.dir.join(CURRENT);
        if !pointer.exists() {
            return Ok(None);
        }
        let name = fs::read_to_string(&pointer)?;
        let checkpoint = Self::load(&self.dir.join(name.trim()))?;
        Ok(Some(checkpoint))
    }

    /// Load a checkpoint and check every artifact against its digest.
    pub fn load_verified(path: &Path) -> Result<ModelCheckpoint> {
        let checkpoint = Self::load(path)?;
        for artifact in &checkpoint.artifacts {
            verify::verify_artifact(artifact)?;
        }
        debug!(path = %path.display(), "checkpoint verified");
        Ok(checkpoint)
    }

    /// Highest version present in the directory (0 when empty).
    ///
    /// Uncommitted manifests count too, so a version number is never reused.
    pub fn latest_version(&self) -> Result<u32> {
        let mut latest = 0;
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".cbor") {
                continue;
            }
            if let Some(v) = name.split('-').next().and_then(|v| v.parse::<u32>().ok()) {
                latest = latest.max(v);
            }
        }
        Ok(latest)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
