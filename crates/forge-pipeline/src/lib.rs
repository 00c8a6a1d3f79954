//! `forge-pipeline`: stage orchestration for acoustic-model training.
//!
//! This crate is a **coordination layer**, not a compute layer. Feature
//! extraction, alignment and re-estimation run in external tooling behind a
//! [`TaskRunner`]. Rust decides which stages run in which order, shards the
//! corpus into tasks, bounds how many run at once, retries failures and
//! commits a checkpoint after every stage.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ StageGraph │──▶│ StagePlan + │──▶│ JobSplitter  │──▶│  Dispatcher  │
//! │   order    │   │ Convergence │   │ step → tasks │   │ local/remote │
//! └────────────┘   └─────────────┘   └──────────────┘   └──────┬───────┘
//!        ▲                                                      │
//!        └──────────── PipelineController ◀── outcomes ─────────┘
//!                        │
//!                        ▼
//!              CheckpointStore + PipelineState (forge-store)
//! ```

pub mod controller;
pub mod convergence;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod local;
pub mod plan;
pub mod remote;
pub mod runner;
pub mod splitter;
pub mod status;
pub mod transport;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use controller::{prepare_experiment, PipelineController, RunReport};
pub use convergence::{ConvergenceTracker, Decision, IterationRecord};
pub use dispatcher::{Dispatcher, RetryPolicy};
pub use error::{PipelineError, Result};
pub use graph::{Stage, StageGraph};
pub use local::LocalDispatcher;
pub use plan::{StagePlan, StepShape};
pub use remote::{JobQueue, RemoteDispatcher, RemoteTimings, SpoolQueue};
pub use runner::{config_env, CommandRunner, DryRunRunner, TaskRunner};
pub use splitter::{Corpus, JobSplitter, ShardPlan};
pub use status::ControllerState;
pub use transport::{TaskReceipt, TaskTicket};
