//! Ticket and receipt encoding for the remote job queue.
//!
//! A ticket is everything a cluster-side worker needs to run one attempt of a
//! task; a receipt is what it writes back. Both are serialized with bincode
//! (standard config) so tickets stay compact when thousands sit in the spool.

use std::collections::BTreeMap;
use std::path::PathBuf;

use forge_types::{StageName, Task};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::runner::task_env;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTicket {
    pub task_id: String,
    pub stage: StageName,
    pub step: String,
    pub attempt: u32,
    pub output: PathBuf,
    /// Same `FORGE_*` variables the local command runner exports.
    pub env: BTreeMap<String, String>,
    pub submitted_at: String,
}

impl TaskTicket {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            stage: task.stage,
            step: task.step.clone(),
            attempt: task.attempt,
            output: task.output.clone(),
            env: task_env(task),
            submitted_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Succeeded { artifact: PathBuf },
    Failed { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReceipt {
    pub task_id: String,
    pub attempt: u32,
    pub status: ReceiptStatus,
    pub finished_at: String,
}

impl TaskReceipt {
    pub fn succeeded(ticket: &TaskTicket, artifact: PathBuf) -> Self {
        Self::new(ticket, ReceiptStatus::Succeeded { artifact })
    }

    pub fn failed(ticket: &TaskTicket, detail: impl Into<String>) -> Self {
        Self::new(ticket, ReceiptStatus::Failed { detail: detail.into() })
    }

    fn new(ticket: &TaskTicket, status: ReceiptStatus) -> Self {
        Self {
            task_id: ticket.task_id.clone(),
            attempt: ticket.attempt,
            status,
            finished_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn encode_ticket(ticket: &TaskTicket) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(ticket, bincode::config::standard())
        .map_err(|e| PipelineError::Serialization(e.to_string()))
}

pub fn decode_ticket(data: &[u8]) -> Result<TaskTicket> {
    let (ticket, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| PipelineError::Serialization(e.to_string()))?;
    Ok(ticket)
}

pub fn encode_receipt(receipt: &TaskReceipt) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(receipt, bincode::config::standard())
        .map_err(|e| PipelineError::Serialization(e.to_string()))
}

pub fn decode_receipt(data: &[u8]) -> Result<TaskReceipt> {
    let (receipt, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| PipelineError::Serialization(e.to_string()))?;
    Ok(receipt)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
