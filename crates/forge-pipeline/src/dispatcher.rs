//! The dispatch capability shared by the local and remote worker pools.
//!
//! Both variants run every task through [`run_with_retry`]: take an execution
//! slot (bounded wait), run one attempt, and retry retryable failures until
//! the policy is exhausted. The caller only ever sees final outcomes.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_types::config::Settings;
use forge_types::{Task, TaskOutcome, TaskStatus};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run every task to a final outcome. Outcomes are in input order.
    async fn dispatch(&self, tasks: Vec<Task>, cancel: &CancellationToken) -> Vec<TaskOutcome>;

    /// Short name for logs: `local` or `remote`.
    fn mode(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub slot_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.retries,
            slot_timeout: Duration::from_secs(settings.slot_timeout_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            slot_timeout: Duration::from_secs(600),
        }
    }
}

/// Wait up to `timeout` for a free slot.
pub async fn acquire_slot(
    slots: &Arc<Semaphore>,
    timeout: Duration,
) -> Result<OwnedSemaphorePermit> {
    match tokio::time::timeout(timeout, slots.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(PipelineError::Resource("worker pool closed".into())),
        Err(_) => Err(PipelineError::Resource(format!(
            "no execution slot free within {}s",
            timeout.as_secs()
        ))),
    }
}

/// Drive one task to its final outcome.
///
/// `attempt_fn` runs a single attempt; it receives the task with `attempt`
/// set (1-based) and `status` set to running. Once started, an attempt is
/// awaited to completion and must honour `cancel` on its own.
pub async fn run_with_retry<F, Fut>(
    mut task: Task,
    slots: &Arc<Semaphore>,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> TaskOutcome
where
    F: FnMut(Task) -> Fut,
    Fut: Future<Output = Result<PathBuf>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return failed(&task, PipelineError::Cancelled.to_string(), attempt - 1);
        }
        task.attempt = attempt;
        task.status = TaskStatus::Running;

        // Only the slot wait races the token. A started attempt observes
        // `cancel` itself so it can release what it holds before returning.
        let result = tokio::select! {
            permit = acquire_slot(slots, policy.slot_timeout) => match permit {
                Ok(_permit) => attempt_fn(task.clone()).await,
                Err(e) => Err(e),
            },
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        };

        match result {
            Ok(artifact) => {
                task.status = TaskStatus::Succeeded;
                debug!(task_id = %task.id, attempt, "task succeeded");
                return TaskOutcome::Succeeded {
                    task_id: task.id,
                    artifact,
                    attempts: attempt,
                };
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(task_id = %task.id, attempt, error = %e, "task failed, retrying");
                last_error = e.to_string();
            }
            Err(e) => {
                last_error = e.to_string();
                warn!(task_id = %task.id, attempt, error = %e, "task failed");
                return failed(&task, last_error, attempt);
            }
        }
    }
    failed(&task, last_error, max_attempts)
}

fn failed(task: &Task, error: String, attempts: u32) -> TaskOutcome {
    TaskOutcome::Failed {
        task_id: task.id.clone(),
        error,
        attempts,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
