//! `forge-store`: durable state for the training pipeline.
//!
//! Everything the controller must find again after a crash lives here:
//! the versioned checkpoint manifests and the pipeline-state record. Both are
//! written with [`atomic::write_atomic`], so a reader sees either the
//! previous complete file or the new one.

pub mod atomic;
pub mod checkpoint;
pub mod error;
pub mod state;
pub mod verify;

pub use atomic::write_atomic;
pub use checkpoint::CheckpointStore;
pub use error::{Result, StoreError};
pub use state::{FailureRecord, PipelineState, StageProgress, StageRecord};
pub use verify::{digest_path, verify_artifact};
