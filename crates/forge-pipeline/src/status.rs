use std::fmt;

use forge_types::StageName;

use crate::error::{PipelineError, Result};

// ── Controller State Machine ─────────────────────────────────────────────────

/// NotStarted → StageRunning → StageComplete → … → PipelineComplete | Failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    NotStarted,
    StageRunning(StageName),
    StageComplete(StageName),
    PipelineComplete,
    /// Absorbing: nothing leaves this state.
    Failed { stage: StageName, reason: String },
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted               => write!(f, "NotStarted"),
            Self::StageRunning(stage)      => write!(f, "StageRunning({stage})"),
            Self::StageComplete(stage)     => write!(f, "StageComplete({stage})"),
            Self::PipelineComplete         => write!(f, "PipelineComplete"),
            Self::Failed { stage, reason } => write!(f, "Failed({stage}: {reason})"),
        }
    }
}

impl ControllerState {
    fn invalid(&self, to: impl fmt::Display) -> PipelineError {
        PipelineError::InvalidTransition {
            from: self.to_string(),
            to: to.to_string(),
        }
    }

    /// `NotStarted | StageComplete → StageRunning(stage)`.
    pub fn start_stage(&mut self, stage: StageName) -> Result<()> {
        let next = Self::StageRunning(stage);
        match self {
            Self::NotStarted | Self::StageComplete(_) => {
                *self = next;
                Ok(())
            }
            _ => Err(self.invalid(next)),
        }
    }

    /// `StageRunning(stage) → StageComplete(stage)`.
    pub fn complete_stage(&mut self, stage: StageName) -> Result<()> {
        let next = Self::StageComplete(stage);
        match self {
            Self::StageRunning(running) if *running == stage => {
                *self = next;
                Ok(())
            }
            _ => Err(self.invalid(next)),
        }
    }

    /// `NotStarted | StageComplete → PipelineComplete`.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            Self::NotStarted | Self::StageComplete(_) => {
                *self = Self::PipelineComplete;
                Ok(())
            }
            _ => Err(self.invalid(Self::PipelineComplete)),
        }
    }

    /// Enter `Failed`. A second failure keeps the first reason.
    pub fn fail(&mut self, stage: StageName, reason: &str) -> Result<()> {
        match self {
            Self::Failed { .. } => Ok(()),
            Self::PipelineComplete => Err(self.invalid("Failed")),
            _ => {
                *self = Self::Failed {
                    stage,
                    reason: reason.to_string(),
                };
                Ok(())
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
