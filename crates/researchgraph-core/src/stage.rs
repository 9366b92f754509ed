//! Uniform contract implemented by all five processing stages.

use async_trait::async_trait;

use crate::collaborators::GenerationError;
use crate::config::WorkflowConfig;
use crate::graph::StageName;
use crate::state::ResearchState;

/// How a stage invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSignal {
    Ok,
    /// The stage succeeded but produced nothing; the next stage must handle
    /// the empty case.
    OkEmpty,
    /// Transient collaborator failure; the engine may retry the invocation.
    Retryable(String),
    /// Unrecoverable condition; the run transitions to FAILED.
    Fatal(String),
}

impl StageSignal {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::OkEmpty => "ok_empty",
            Self::Retryable(_) => "retryable_error",
            Self::Fatal(_) => "fatal_error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::OkEmpty)
    }
}

/// Result of a stage invocation: the successor state plus the signal.
///
/// A failing stage must hand back the state it was given, unmodified; the
/// engine relies on that to retry without rollback.
#[derive(Debug)]
pub struct StageOutcome {
    pub state: ResearchState,
    pub signal: StageSignal,
}

impl StageOutcome {
    pub fn ok(state: ResearchState) -> Self {
        Self {
            state,
            signal: StageSignal::Ok,
        }
    }

    pub fn empty(state: ResearchState) -> Self {
        Self {
            state,
            signal: StageSignal::OkEmpty,
        }
    }

    pub fn retryable(state: ResearchState, reason: impl Into<String>) -> Self {
        Self {
            state,
            signal: StageSignal::Retryable(reason.into()),
        }
    }

    pub fn fatal(state: ResearchState, reason: impl Into<String>) -> Self {
        Self {
            state,
            signal: StageSignal::Fatal(reason.into()),
        }
    }

    /// Map a text-generation failure onto the stage signal taxonomy:
    /// provider outages are retryable, unparseable responses are fatal.
    pub fn from_generation_error(state: ResearchState, err: GenerationError) -> Self {
        match err {
            GenerationError::Unavailable(reason) => Self::retryable(state, reason),
            GenerationError::Malformed(reason) => Self::fatal(state, reason),
        }
    }
}

/// Per-invocation context handed to stages alongside the state.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub run_id: &'a str,
    pub config: &'a WorkflowConfig,
}

/// The contract every stage implements. Stages differ only in which external
/// collaborator they call and which subset of state they touch; the engine
/// treats all of them uniformly.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn execute(&self, ctx: StageContext<'_>, state: ResearchState) -> StageOutcome;
}
