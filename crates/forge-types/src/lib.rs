pub mod checkpoint;
pub mod config;
pub mod error;
pub mod stage;
pub mod task;

pub use checkpoint::{ArtifactRef, ModelCheckpoint};
pub use config::PipelineConfig;
pub use error::ForgeError;
pub use stage::{MixupSchedule, StageName};
pub use task::{Task, TaskInputs, TaskOutcome, TaskStatus};
