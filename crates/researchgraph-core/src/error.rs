use std::path::PathBuf;

use thiserror::Error;

use crate::graph::StageName;

/// Core error type for the workflow engine.
///
/// Run-level failures (a stage exhausting its retries, cancellation) are not
/// errors of the engine API; they surface as `StepResult::Failed`. This enum
/// covers caller mistakes, protocol misuse, and infrastructure faults.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("run {run_id} is not resumable: {reason}")]
    NotResumable { run_id: String, reason: String },
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error while accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint for run {run_id} could not be decoded: {reason}")]
    CorruptCheckpoint { run_id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn not_resumable(run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotResumable {
            run_id: run_id.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: PathBuf, source: std::io::Error) -> Self {
        Self::Io { path, source }
    }
}

/// Classification of a terminal run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient collaborator failures that outlived the retry budget.
    Retryable,
    /// Unrecoverable collaborator condition, e.g. a response the stage
    /// could not parse.
    Fatal,
    /// The caller cancelled the run between transitions.
    Cancelled,
}

/// Terminal failure record carried on a FAILED run for diagnostics.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunFailure {
    pub stage: StageName,
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::Retryable => "retries exhausted",
            FailureKind::Fatal => "fatal",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{} failure at {}: {}", kind, self.stage, self.message)
    }
}
