use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::collaborators::{GenerationConstraints, TextGenerator};
use crate::graph::StageName;
use crate::stage::{Stage, StageContext, StageOutcome};
use crate::state::ResearchState;

use super::CLARIFY_MARKER;

/// Refines the raw query into a specific, self-contained research question.
pub struct ClarificationStage {
    generator: Arc<dyn TextGenerator>,
}

impl ClarificationStage {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for ClarificationStage {
    fn name(&self) -> StageName {
        StageName::Clarification
    }

    #[instrument(name = "stage.clarification", skip(self, _ctx, state), fields(run_id = _ctx.run_id))]
    async fn execute(&self, _ctx: StageContext<'_>, mut state: ResearchState) -> StageOutcome {
        let prompt = format!(
            "{CLARIFY_MARKER} below as a single, specific, self-contained \
             question. Reply with the rewritten question only.\n\n\
             Question: {}",
            state.query
        );

        let constraints = GenerationConstraints {
            max_tokens: Some(256),
            temperature: Some(0.2),
        };

        match self.generator.generate(&prompt, &constraints).await {
            Ok(text) => {
                let refined = text.trim();
                state.clarified_query = if refined.is_empty() {
                    // Nothing usable came back; the raw query stands.
                    Some(state.query.clone())
                } else {
                    Some(refined.to_string())
                };
                debug!(clarified = %state.clarified_query.as_deref().unwrap_or_default(), "query clarified");
                StageOutcome::ok(state)
            }
            Err(err) => StageOutcome::from_generation_error(state, err),
        }
    }
}
