//! Distributed worker pool backed by a job queue.
//!
//! The controller side only submits tickets and waits for receipts; how the
//! cluster schedules them is up to whatever consumes the queue. The bundled
//! [`SpoolQueue`] is a shared directory:
//!
//! ```text
//! <spool>/pending/<task_id>.<attempt>.ticket   ← written by the dispatcher
//! <spool>/done/<task_id>.<attempt>.receipt     ← written by the worker
//! ```
//!
//! Task ids and attempt numbers repeat across runs of the same experiment,
//! so a receipt is consumed when it is read and any leftover receipt under
//! the same name is cleared before a ticket is submitted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forge_store::write_atomic;
use forge_types::{Task, TaskOutcome};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{run_with_retry, Dispatcher, RetryPolicy};
use crate::error::{PipelineError, Result};
use crate::transport::{
    decode_receipt, decode_ticket, encode_receipt, encode_ticket, ReceiptStatus, TaskReceipt,
    TaskTicket,
};

// ── Queue ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, ticket: &TaskTicket) -> Result<()>;

    /// The receipt for this attempt, once the worker has written it.
    /// A returned receipt is consumed.
    async fn poll(&self, task_id: &str, attempt: u32) -> Result<Option<TaskReceipt>>;

    /// Drop a ticket that is no longer wanted. Missing tickets are fine.
    async fn withdraw(&self, task_id: &str, attempt: u32) -> Result<()>;
}

pub struct SpoolQueue {
    dir: PathBuf,
}

impl SpoolQueue {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(dir.join("pending"))?;
        fs::create_dir_all(dir.join("done"))?;
        Ok(Self { dir })
    }

    fn ticket_path(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.dir.join("pending").join(format!("{task_id}.{attempt}.ticket"))
    }

    fn receipt_path(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.dir.join("done").join(format!("{task_id}.{attempt}.receipt"))
    }

    /// Tickets waiting for a worker, oldest file name first.
    pub fn pending(&self) -> Result<Vec<TaskTicket>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(self.dir.join("pending"))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "ticket"))
            .collect();
        paths.sort();
        paths.iter().map(|p| decode_ticket(&fs::read(p)?)).collect()
    }

    /// Worker side: publish the receipt and retire the ticket.
    pub fn complete(&self, receipt: &TaskReceipt) -> Result<()> {
        write_atomic(
            &self.receipt_path(&receipt.task_id, receipt.attempt),
            &encode_receipt(receipt)?,
        )?;
        remove_if_present(&self.ticket_path(&receipt.task_id, receipt.attempt))?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn submit(&self, ticket: &TaskTicket) -> Result<()> {
        let stale = self.receipt_path(&ticket.task_id, ticket.attempt);
        if stale.exists() {
            debug!(task_id = %ticket.task_id, attempt = ticket.attempt, "clearing stale receipt");
            remove_if_present(&stale)?;
        }
        let path = self.ticket_path(&ticket.task_id, ticket.attempt);
        write_atomic(&path, &encode_ticket(ticket)?)
            .map_err(|e| PipelineError::Resource(format!("spool submit {}: {e}", path.display())))?;
        debug!(task_id = %ticket.task_id, attempt = ticket.attempt, "ticket spooled");
        Ok(())
    }

    async fn poll(&self, task_id: &str, attempt: u32) -> Result<Option<TaskReceipt>> {
        let path = self.receipt_path(task_id, attempt);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let receipt = decode_receipt(&data)?;
        remove_if_present(&path)?;
        Ok(Some(receipt))
    }

    async fn withdraw(&self, task_id: &str, attempt: u32) -> Result<()> {
        remove_if_present(&self.ticket_path(task_id, attempt))?;
        // A worker may have answered while we gave up on the attempt.
        remove_if_present(&self.receipt_path(task_id, attempt))
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RemoteTimings {
    /// Upper bound on waiting for one attempt's receipt.
    pub task_timeout: Duration,
    pub poll_interval: Duration,
}

/// Submits tickets to a [`JobQueue`], at most `jobs` in flight.
pub struct RemoteDispatcher {
    queue: Arc<dyn JobQueue>,
    slots: Arc<Semaphore>,
    policy: RetryPolicy,
    timings: RemoteTimings,
}

impl RemoteDispatcher {
    pub fn new(queue: Arc<dyn JobQueue>, jobs: u32, policy: RetryPolicy, timings: RemoteTimings) -> Self {
        Self {
            queue,
            slots: Arc::new(Semaphore::new(jobs.max(1) as usize)),
            policy,
            timings,
        }
    }
}

/// Submit one attempt and wait for its receipt.
async fn remote_attempt(
    queue: &dyn JobQueue,
    task: &Task,
    timings: RemoteTimings,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let ticket = TaskTicket::from_task(task);
    queue.submit(&ticket).await?;

    let wait = async {
        loop {
            if let Some(receipt) = queue.poll(&task.id, task.attempt).await? {
                return Ok::<_, PipelineError>(receipt);
            }
            tokio::time::sleep(timings.poll_interval).await;
        }
    };

    let receipt = tokio::select! {
        r = tokio::time::timeout(timings.task_timeout, wait) => match r {
            Ok(receipt) => receipt?,
            Err(_) => {
                queue.withdraw(&task.id, task.attempt).await?;
                return Err(PipelineError::Resource(format!(
                    "no receipt for {} within {}s",
                    task.id,
                    timings.task_timeout.as_secs()
                )));
            }
        },
        _ = cancel.cancelled() => {
            queue.withdraw(&task.id, task.attempt).await?;
            return Err(PipelineError::Cancelled);
        }
    };

    match receipt.status {
        ReceiptStatus::Succeeded { artifact } => Ok(artifact),
        ReceiptStatus::Failed { detail } => Err(PipelineError::TaskExecution {
            task_id: task.id.clone(),
            detail,
        }),
    }
}

#[async_trait]
impl Dispatcher for RemoteDispatcher {
    async fn dispatch(&self, tasks: Vec<Task>, cancel: &CancellationToken) -> Vec<TaskOutcome> {
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut outcomes: Vec<Option<TaskOutcome>> = vec![None; tasks.len()];
        let mut set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let queue = self.queue.clone();
            let slots = self.slots.clone();
            let policy = self.policy;
            let timings = self.timings;
            let cancel = cancel.clone();
            set.spawn(async move {
                let outcome = run_with_retry(task, &slots, policy, &cancel, |t| {
                    let queue = queue.clone();
                    let cancel = cancel.clone();
                    async move { remote_attempt(queue.as_ref(), &t, timings, &cancel).await }
                })
                .await;
                (index, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "remote waiter panicked"),
            }
        }

        let resolved: Vec<TaskOutcome> = outcomes
            .into_iter()
            .zip(ids)
            .map(|(outcome, task_id)| {
                outcome.unwrap_or(TaskOutcome::Failed {
                    task_id,
                    error: "remote waiter panicked".into(),
                    attempts: 1,
                })
            })
            .collect();

        let failed = resolved.iter().filter(|o| !o.is_success()).count();
        info!(tasks = resolved.len(), failed, "remote dispatch finished");
        resolved
    }

    fn mode(&self) -> &'static str {
        "remote"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
