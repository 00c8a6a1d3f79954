//! In-process worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use forge_types::{Task, TaskOutcome};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::{run_with_retry, Dispatcher, RetryPolicy};
use crate::runner::TaskRunner;

/// Runs tasks on the local tokio runtime, at most `jobs` at a time.
pub struct LocalDispatcher {
    runner: Arc<dyn TaskRunner>,
    slots: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl LocalDispatcher {
    pub fn new(runner: Arc<dyn TaskRunner>, jobs: u32, policy: RetryPolicy) -> Self {
        Self {
            runner,
            slots: Arc::new(Semaphore::new(jobs.max(1) as usize)),
            policy,
        }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(&self, tasks: Vec<Task>, cancel: &CancellationToken) -> Vec<TaskOutcome> {
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; tasks.len()];
        let mut set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let runner = self.runner.clone();
            let slots = self.slots.clone();
            let policy = self.policy;
            let cancel = cancel.clone();
            set.spawn(async move {
                let outcome = run_with_retry(task, &slots, policy, &cancel, |t| {
                    let runner = runner.clone();
                    let cancel = cancel.clone();
                    async move { runner.run(&t, &cancel).await }
                })
                .await;
                (index, outcome)
            });
        }

        let mut panicked = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => {
                    warn!(error = %e, "local worker panicked");
                    panicked += 1;
                }
            }
        }

        let resolved: Vec<TaskOutcome> = outcomes
            .into_iter()
            .zip(ids)
            .map(|(outcome, task_id)| {
                outcome.unwrap_or(TaskOutcome::Failed {
                    task_id,
                    error: "worker panicked".into(),
                    attempts: 1,
                })
            })
            .collect();

        let failed = resolved.iter().filter(|o| !o.is_success()).count();
        info!(tasks = resolved.len(), failed, panicked, "local dispatch finished");
        resolved
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
