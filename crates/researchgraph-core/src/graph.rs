//! The fixed workflow graph: five stages plus two conditional edges.
//!
//! Transitions are plain data evaluated against the state, so the topology is
//! inspectable and testable without touching any stage logic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::WorkflowConfig;
use crate::state::{ReflectionVerdict, ResearchState, RunStatus};

/// Identity of a workflow stage. The engine uses this only to pick the next
/// graph edge and the stage implementation to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Clarification,
    WebSearch,
    DocumentAnalyzer,
    Synthesis,
    Reflection,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Clarification,
        StageName::WebSearch,
        StageName::DocumentAnalyzer,
        StageName::Synthesis,
        StageName::Reflection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clarification => "clarification",
            Self::WebSearch => "web_search",
            Self::DocumentAnalyzer => "document_analyzer",
            Self::Synthesis => "synthesis",
            Self::Reflection => "reflection",
        }
    }

    /// Status a run reports while this stage is executing.
    pub fn running_status(self) -> RunStatus {
        match self {
            Self::Clarification => RunStatus::Clarifying,
            Self::WebSearch => RunStatus::Searching,
            Self::DocumentAnalyzer => RunStatus::Analyzing,
            Self::Synthesis => RunStatus::Synthesizing,
            Self::Reflection => RunStatus::Reflecting,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate guarding a transition. Evaluated against state and config only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePredicate {
    Always,
    /// Reflection judged the draft insufficient and the iteration budget
    /// still has room.
    ReflectionLoopsBack,
}

impl EdgePredicate {
    pub fn holds(self, state: &ResearchState, config: &WorkflowConfig) -> bool {
        match self {
            Self::Always => true,
            Self::ReflectionLoopsBack => {
                state.last_verdict == Some(ReflectionVerdict::Insufficient)
                    && state.iteration_count < config.max_iterations
            }
        }
    }
}

/// Where a transition leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Stage(StageName),
    Done,
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: StageName,
    pub predicate: EdgePredicate,
    pub to: Target,
}

/// The whole topology. Rows for a node are tried in order; the first
/// predicate that holds wins.
pub const TRANSITIONS: &[Transition] = &[
    Transition {
        from: StageName::Clarification,
        predicate: EdgePredicate::Always,
        to: Target::Stage(StageName::WebSearch),
    },
    Transition {
        from: StageName::WebSearch,
        predicate: EdgePredicate::Always,
        to: Target::Stage(StageName::DocumentAnalyzer),
    },
    Transition {
        from: StageName::DocumentAnalyzer,
        predicate: EdgePredicate::Always,
        to: Target::Stage(StageName::Synthesis),
    },
    Transition {
        from: StageName::Synthesis,
        predicate: EdgePredicate::Always,
        to: Target::Stage(StageName::Reflection),
    },
    Transition {
        from: StageName::Reflection,
        predicate: EdgePredicate::ReflectionLoopsBack,
        to: Target::Stage(StageName::WebSearch),
    },
    Transition {
        from: StageName::Reflection,
        predicate: EdgePredicate::Always,
        to: Target::Done,
    },
];

/// Evaluate the outgoing edge of `from` against the current state.
pub fn next_target(from: StageName, state: &ResearchState, config: &WorkflowConfig) -> Target {
    TRANSITIONS
        .iter()
        .filter(|transition| transition.from == from)
        .find(|transition| transition.predicate.holds(state, config))
        .map(|transition| transition.to)
        .unwrap_or(Target::Done)
}

/// Position of a run inside the graph, persisted with every checkpoint.
///
/// `edge_pending` marks a run suspended after `node` completed but before its
/// outgoing edge was evaluated; resume picks up exactly there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPosition {
    pub node: StageName,
    pub edge_pending: bool,
}

impl GraphPosition {
    pub fn start() -> Self {
        Self {
            node: StageName::Clarification,
            edge_pending: false,
        }
    }

    pub fn at(node: StageName) -> Self {
        Self {
            node,
            edge_pending: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkflowConfig {
        WorkflowConfig::default()
    }

    #[test]
    fn linear_spine_is_wired() {
        let state = ResearchState::new("q");
        assert_eq!(
            next_target(StageName::Clarification, &state, &config()),
            Target::Stage(StageName::WebSearch)
        );
        assert_eq!(
            next_target(StageName::WebSearch, &state, &config()),
            Target::Stage(StageName::DocumentAnalyzer)
        );
        assert_eq!(
            next_target(StageName::DocumentAnalyzer, &state, &config()),
            Target::Stage(StageName::Synthesis)
        );
        assert_eq!(
            next_target(StageName::Synthesis, &state, &config()),
            Target::Stage(StageName::Reflection)
        );
    }

    #[test]
    fn reflection_loops_back_only_under_budget() {
        let mut state = ResearchState::new("q");
        state.last_verdict = Some(ReflectionVerdict::Insufficient);
        state.iteration_count = 0;
        assert_eq!(
            next_target(StageName::Reflection, &state, &config()),
            Target::Stage(StageName::WebSearch)
        );

        state.iteration_count = config().max_iterations;
        assert_eq!(
            next_target(StageName::Reflection, &state, &config()),
            Target::Done
        );

        state.iteration_count = 0;
        state.last_verdict = Some(ReflectionVerdict::Sufficient);
        assert_eq!(
            next_target(StageName::Reflection, &state, &config()),
            Target::Done
        );
    }

    #[test]
    fn every_stage_has_an_outgoing_edge() {
        for stage in StageName::ALL {
            assert!(
                TRANSITIONS.iter().any(|t| t.from == stage
                    && matches!(t.predicate, EdgePredicate::Always)),
                "{stage} lacks an unconditional fallback edge"
            );
        }
    }
}
