use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::collaborators::{GenerationConstraints, TextGenerator};
use crate::graph::StageName;
use crate::stage::{Stage, StageContext, StageOutcome};
use crate::state::{ReflectionVerdict, ResearchState};

use super::{strip_code_fence, REFLECT_MARKER};

#[derive(Deserialize)]
struct VerdictResponse {
    verdict: String,
    #[serde(default)]
    feedback: Option<String>,
}

/// Parse the evaluator's response leniently: JSON first, bare keyword as a
/// fallback. A response carrying neither verdict is unparseable.
fn parse_verdict(raw: &str) -> Option<(ReflectionVerdict, Option<String>)> {
    let body = strip_code_fence(raw);

    if let Ok(parsed) = serde_json::from_str::<VerdictResponse>(body) {
        let verdict = match parsed.verdict.trim().to_ascii_uppercase().as_str() {
            "SUFFICIENT" | "ACCEPT" => ReflectionVerdict::Sufficient,
            "INSUFFICIENT" | "REVISE" => ReflectionVerdict::Insufficient,
            _ => return None,
        };
        return Some((verdict, parsed.feedback.filter(|f| !f.trim().is_empty())));
    }

    let upper = body.to_ascii_uppercase();
    // INSUFFICIENT contains SUFFICIENT, so check it first.
    if upper.contains("INSUFFICIENT") {
        return Some((ReflectionVerdict::Insufficient, None));
    }
    if upper.contains("SUFFICIENT") {
        return Some((ReflectionVerdict::Sufficient, None));
    }
    None
}

/// Judges the draft against the research question and decides whether the
/// loop-back edge should be considered.
pub struct ReflectionStage {
    generator: Arc<dyn TextGenerator>,
}

impl ReflectionStage {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for ReflectionStage {
    fn name(&self) -> StageName {
        StageName::Reflection
    }

    #[instrument(name = "stage.reflection", skip(self, _ctx, state), fields(run_id = _ctx.run_id))]
    async fn execute(&self, _ctx: StageContext<'_>, mut state: ResearchState) -> StageOutcome {
        let draft = state.report_draft.clone().unwrap_or_default();

        let prompt = format!(
            "{REFLECT_MARKER} against the research question. Respond with a \
             JSON object {{\"verdict\": \"SUFFICIENT\"|\"INSUFFICIENT\", \
             \"feedback\": \"...\"}} where feedback names the concrete gaps.\n\n\
             Question: {}\n\nReport:\n{draft}",
            state.effective_query()
        );

        let constraints = GenerationConstraints {
            max_tokens: Some(512),
            temperature: Some(0.0),
        };

        let response = match self.generator.generate(&prompt, &constraints).await {
            Ok(response) => response,
            Err(err) => return StageOutcome::from_generation_error(state, err),
        };

        let Some((verdict, feedback)) = parse_verdict(&response) else {
            return StageOutcome::fatal(
                state,
                format!("unparseable reflection verdict: {}", response.trim()),
            );
        };

        info!(?verdict, "reflection evaluated draft");

        state.last_verdict = Some(verdict);
        if let Some(feedback) = feedback {
            state.reflection_notes.push(feedback);
        }
        StageOutcome::ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StubGenerator;
    use crate::config::WorkflowConfig;
    use crate::stage::StageSignal;

    #[test]
    fn parses_json_verdicts() {
        let (verdict, feedback) =
            parse_verdict("{\"verdict\": \"INSUFFICIENT\", \"feedback\": \"too thin\"}").unwrap();
        assert_eq!(verdict, ReflectionVerdict::Insufficient);
        assert_eq!(feedback.as_deref(), Some("too thin"));

        let (verdict, _) = parse_verdict("```json\n{\"verdict\": \"ACCEPT\"}\n```").unwrap();
        assert_eq!(verdict, ReflectionVerdict::Sufficient);
    }

    #[test]
    fn bare_keyword_fallback_prefers_insufficient() {
        let (verdict, _) = parse_verdict("The report is INSUFFICIENT in coverage").unwrap();
        assert_eq!(verdict, ReflectionVerdict::Insufficient);

        let (verdict, _) = parse_verdict("sufficient").unwrap();
        assert_eq!(verdict, ReflectionVerdict::Sufficient);

        assert!(parse_verdict("no verdict here").is_none());
    }

    #[tokio::test]
    async fn unparseable_response_is_fatal() {
        struct Garbage;
        #[async_trait]
        impl TextGenerator for Garbage {
            async fn generate(
                &self,
                _prompt: &str,
                _constraints: &GenerationConstraints,
            ) -> Result<String, crate::collaborators::GenerationError> {
                Ok("???".to_string())
            }
        }

        let stage = ReflectionStage::new(Arc::new(Garbage));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let outcome = stage.execute(ctx, ResearchState::new("q")).await;
        assert!(matches!(outcome.signal, StageSignal::Fatal(_)));
    }

    #[tokio::test]
    async fn scripted_verdicts_flow_into_state() {
        let stage = ReflectionStage::new(Arc::new(StubGenerator::with_verdicts(["INSUFFICIENT"])));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let mut state = ResearchState::new("q");
        state.report_draft = Some("draft".into());

        let outcome = stage.execute(ctx, state).await;
        assert_eq!(outcome.signal, StageSignal::Ok);
        assert_eq!(
            outcome.state.last_verdict,
            Some(ReflectionVerdict::Insufficient)
        );
        assert_eq!(outcome.state.reflection_notes.len(), 1);
    }
}
