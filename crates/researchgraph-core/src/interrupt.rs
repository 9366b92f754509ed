//! Human-in-the-loop interrupts.
//!
//! The decision function is pure: it looks at configuration flags and state
//! content only, so suspension behaviour is deterministic and testable
//! without an engine.

use serde::{Deserialize, Serialize};

use crate::config::WorkflowConfig;
use crate::graph::{next_target, StageName, Target};
use crate::state::{canonical_url, ResearchState, SourceKind};

/// What kind of human input a paused run is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    SourceApproval,
    SearchFeedback,
    ReportReview,
    IterationDecision,
}

/// Source summary shown to the reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub url: String,
    pub title: String,
    pub kind: SourceKind,
}

/// Payload of an interrupt, shaped per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptPayload {
    SourceApproval {
        sources: Vec<SourceSummary>,
    },
    SearchFeedback {
        clarified_query: String,
    },
    ReportReview {
        report: String,
    },
    IterationDecision {
        iteration_count: u32,
        max_iterations: u32,
        feedback: Option<String>,
    },
}

impl InterruptPayload {
    pub fn kind(&self) -> InterruptKind {
        match self {
            Self::SourceApproval { .. } => InterruptKind::SourceApproval,
            Self::SearchFeedback { .. } => InterruptKind::SearchFeedback,
            Self::ReportReview { .. } => InterruptKind::ReportReview,
            Self::IterationDecision { .. } => InterruptKind::IterationDecision,
        }
    }
}

/// A pause surfaced to the caller; consumed by the UI driving the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub run_id: String,
    pub payload: InterruptPayload,
}

impl InterruptRequest {
    pub fn kind(&self) -> InterruptKind {
        self.payload.kind()
    }
}

/// Human input supplied on resume. Must match the pending interrupt kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HumanInput {
    SourceApproval {
        approved_urls: Vec<String>,
    },
    SearchFeedback {
        revised_query: Option<String>,
        #[serde(default)]
        extra_queries: Vec<String>,
    },
    ReportReview {
        accept: bool,
        edited_report: Option<String>,
        feedback: Option<String>,
    },
    IterationDecision {
        continue_search: bool,
    },
}

impl HumanInput {
    pub fn kind(&self) -> InterruptKind {
        match self {
            Self::SourceApproval { .. } => InterruptKind::SourceApproval,
            Self::SearchFeedback { .. } => InterruptKind::SearchFeedback,
            Self::ReportReview { .. } => InterruptKind::ReportReview,
            Self::IterationDecision { .. } => InterruptKind::IterationDecision,
        }
    }
}

/// Decide whether a pause is required after `stage` completed.
///
/// Never pauses on empty content: nothing to review means nothing to ask.
pub fn after_stage(
    run_id: &str,
    stage: StageName,
    state: &ResearchState,
    config: &WorkflowConfig,
) -> Option<InterruptRequest> {
    let payload = match stage {
        StageName::Clarification if config.review_search_plan => {
            let clarified = state.effective_query();
            if clarified.is_empty() {
                return None;
            }
            InterruptPayload::SearchFeedback {
                clarified_query: clarified.to_string(),
            }
        }
        StageName::WebSearch if config.review_sources => {
            let unreviewed: Vec<SourceSummary> = state
                .sources
                .iter()
                .filter(|source| source.approved.is_none())
                .map(|source| SourceSummary {
                    url: source.url.clone(),
                    title: source.title.clone(),
                    kind: source.kind,
                })
                .collect();
            if unreviewed.is_empty() {
                return None;
            }
            InterruptPayload::SourceApproval {
                sources: unreviewed,
            }
        }
        StageName::Synthesis if config.review_report => {
            let Some(report) = state.report_draft.as_ref() else {
                return None;
            };
            InterruptPayload::ReportReview {
                report: report.clone(),
            }
        }
        StageName::Reflection if config.confirm_iterations => {
            // Only worth asking when the loop-back edge would actually fire.
            if next_target(stage, state, config) != Target::Stage(StageName::WebSearch) {
                return None;
            }
            InterruptPayload::IterationDecision {
                iteration_count: state.iteration_count,
                max_iterations: config.max_iterations,
                feedback: state.reflection_notes.last().cloned(),
            }
        }
        _ => return None,
    };

    Some(InterruptRequest {
        run_id: run_id.to_string(),
        payload,
    })
}

/// What the engine should do after merging the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDirective {
    /// Evaluate the pending edge and carry on.
    Continue,
    /// The human declined further work; complete with the current draft.
    Finish,
}

/// Merge human input into the state. Pure with respect to everything but the
/// state value passed in.
pub fn apply_human_input(state: &mut ResearchState, input: HumanInput) -> ResumeDirective {
    match input {
        HumanInput::SourceApproval { approved_urls } => {
            let approved: Vec<String> =
                approved_urls.iter().map(|url| canonical_url(url)).collect();
            // The reviewer only saw unreviewed sources, so only those are
            // marked; verdicts from earlier passes stand.
            for source in &mut state.sources {
                if source.approved.is_none() {
                    source.approved = Some(approved.contains(&canonical_url(&source.url)));
                }
            }
            ResumeDirective::Continue
        }
        HumanInput::SearchFeedback {
            revised_query,
            extra_queries,
        } => {
            if let Some(query) = revised_query {
                if !query.trim().is_empty() {
                    state.clarified_query = Some(query.trim().to_string());
                }
            }
            for query in extra_queries {
                let query = query.trim().to_string();
                if !query.is_empty() && !state.search_queries.contains(&query) {
                    state.search_queries.push(query);
                }
            }
            ResumeDirective::Continue
        }
        HumanInput::ReportReview {
            accept,
            edited_report,
            feedback,
        } => {
            if let Some(edited) = edited_report {
                state.report_draft = Some(edited);
            }
            if !accept {
                if let Some(feedback) = feedback {
                    if !feedback.trim().is_empty() {
                        state.reflection_notes.push(feedback);
                    }
                }
            }
            ResumeDirective::Continue
        }
        HumanInput::IterationDecision { continue_search } => {
            if continue_search {
                ResumeDirective::Continue
            } else {
                ResumeDirective::Finish
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ReflectionVerdict, SourceRecord};

    fn config() -> WorkflowConfig {
        WorkflowConfig::default()
    }

    #[test]
    fn no_pause_when_sources_are_empty() {
        let state = ResearchState::new("q");
        assert!(after_stage("r", StageName::WebSearch, &state, &config()).is_none());
    }

    #[test]
    fn source_review_fires_with_unreviewed_sources() {
        let mut state = ResearchState::new("q");
        state.push_source(SourceRecord::new("https://a.example/1", "One"));

        let request = after_stage("r", StageName::WebSearch, &state, &config()).unwrap();
        assert_eq!(request.kind(), InterruptKind::SourceApproval);
        match request.payload {
            InterruptPayload::SourceApproval { sources } => assert_eq!(sources.len(), 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn review_flags_gate_every_pause() {
        let mut state = ResearchState::new("q");
        state.push_source(SourceRecord::new("https://a.example/1", "One"));
        state.report_draft = Some("draft".into());
        state.last_verdict = Some(ReflectionVerdict::Insufficient);

        let off = WorkflowConfig::unattended();
        for stage in StageName::ALL {
            assert!(after_stage("r", stage, &state, &off).is_none());
        }
    }

    #[test]
    fn iteration_decision_only_when_loop_would_fire() {
        let mut state = ResearchState::new("q");
        state.last_verdict = Some(ReflectionVerdict::Sufficient);
        assert!(after_stage("r", StageName::Reflection, &state, &config()).is_none());

        state.last_verdict = Some(ReflectionVerdict::Insufficient);
        let request = after_stage("r", StageName::Reflection, &state, &config()).unwrap();
        assert_eq!(request.kind(), InterruptKind::IterationDecision);

        state.iteration_count = config().max_iterations;
        assert!(after_stage("r", StageName::Reflection, &state, &config()).is_none());
    }

    #[test]
    fn source_approval_marks_every_unreviewed_source() {
        let mut state = ResearchState::new("q");
        state.push_source(SourceRecord::new("https://a.example/1", "One"));
        state.push_source(SourceRecord::new("https://a.example/2", "Two"));

        let directive = apply_human_input(
            &mut state,
            HumanInput::SourceApproval {
                approved_urls: vec!["https://A.example/1/".into()],
            },
        );

        assert_eq!(directive, ResumeDirective::Continue);
        assert_eq!(state.sources[0].approved, Some(true));
        assert_eq!(state.sources[1].approved, Some(false));
    }

    #[test]
    fn reapproval_leaves_earlier_verdicts_standing() {
        use crate::state::{ChunkRecord, FetchStatus};

        // Pass 1 approved and chunked the first source; pass 2 found a new
        // one and only that one goes before the reviewer.
        let mut state = ResearchState::new("q");
        let mut reviewed = SourceRecord::new("https://a.example/1", "Pass one");
        reviewed.fetch_status = FetchStatus::Fetched;
        reviewed.approved = Some(true);
        state.push_source(reviewed);
        state.push_source(SourceRecord::new("https://a.example/2", "Pass two"));
        state.document_chunks.push(ChunkRecord {
            source_url: "https://a.example/1".into(),
            sequence_index: 0,
            text_span: "pass-1 evidence".into(),
            vector_id: Some("vec-1".into()),
        });

        apply_human_input(
            &mut state,
            HumanInput::SourceApproval {
                approved_urls: vec!["https://a.example/2".into()],
            },
        );

        assert_eq!(state.sources[0].approved, Some(true));
        assert_eq!(state.sources[1].approved, Some(true));
        assert_eq!(state.usable_chunks().len(), 1);
    }

    #[test]
    fn declining_iteration_finishes_the_run() {
        let mut state = ResearchState::new("q");
        let directive = apply_human_input(
            &mut state,
            HumanInput::IterationDecision {
                continue_search: false,
            },
        );
        assert_eq!(directive, ResumeDirective::Finish);
    }

    #[test]
    fn report_review_applies_edits_and_feedback() {
        let mut state = ResearchState::new("q");
        state.report_draft = Some("original".into());

        apply_human_input(
            &mut state,
            HumanInput::ReportReview {
                accept: false,
                edited_report: Some("edited".into()),
                feedback: Some("cover recent work".into()),
            },
        );

        assert_eq!(state.report_draft.as_deref(), Some("edited"));
        assert_eq!(state.reflection_notes, vec!["cover recent work".to_string()]);
    }
}
