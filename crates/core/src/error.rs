//! Error taxonomy for runs, datasets and pipelines.

use crate::types::{DatasetId, RunId, RunStatus};
use serde::{Deserialize, Serialize};

/// Result type for engine operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A single item a step could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.item, self.reason)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The tracking backend could not create the run.
    #[error("Failed to initialize run for step {step}: {reason}")]
    RunInit { step: String, reason: String },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidRunState {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Dataset not found: {project}/{name}")]
    DatasetNotFound { project: String, name: String },

    #[error("Failed to upload dataset {dataset}: {reason}")]
    DatasetUpload { dataset: DatasetId, reason: String },

    #[error("Failed to download input dataset for step {step}: {reason}")]
    DatasetDownload { step: String, reason: String },

    /// Processing aborted; carries whatever per-item failures were collected.
    #[error("Step {step} processing failed: {reason}")]
    StepProcessing {
        step: String,
        reason: String,
        failures: Vec<ItemFailure>,
    },

    #[error("Adding step {step} would create a cycle")]
    PipelineCycle { step: String },

    #[error("Step {0} is already registered")]
    DuplicateStep(String),

    #[error("Step {step} references unknown parent {parent}")]
    UnknownParent { step: String, parent: String },

    #[error("Step {step} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Execution queue not found: {0}")]
    UnknownQueue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors the orchestrator answers by re-running the whole step.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepProcessing { .. } | Self::DatasetUpload { .. } | Self::DatasetDownload { .. }
        )
    }

    /// Errors raised while assembling a pipeline.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::PipelineCycle { .. } | Self::DuplicateStep(_) | Self::UnknownParent { .. }
        )
    }
}
