use forge_store::StoreError;
use forge_types::{ForgeError, StageName};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("task {task_id} failed: {detail}")]
    TaskExecution { task_id: String, detail: String },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("stage {stage} failed at task {task_id}: {detail}")]
    StageFailure {
        stage: StageName,
        task_id: String,
        detail: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid state transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Task-level errors the dispatcher's retry loop may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TaskExecution { .. } | Self::Resource(_))
    }
}

impl From<ForgeError> for PipelineError {
    fn from(e: ForgeError) -> Self {
        Self::Configuration(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
