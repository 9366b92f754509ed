use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::collaborators::{GenerationConstraints, TextGenerator};
use crate::graph::StageName;
use crate::stage::{Stage, StageContext, StageOutcome};
use crate::state::{canonical_url, ResearchState};

use super::REPORT_MARKER;

/// Writes the cited report draft from the analysed chunks. With zero usable
/// evidence it produces an explicit insufficient-evidence report instead of
/// failing.
pub struct SynthesisStage {
    generator: Arc<dyn TextGenerator>,
}

impl SynthesisStage {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

fn insufficient_evidence_report(query: &str) -> String {
    format!(
        "# {query}\n\n\
         Insufficient evidence: no usable sources were found for this \
         question, so no substantiated report can be written. Consider \
         rephrasing the question or broadening the search."
    )
}

#[async_trait]
impl Stage for SynthesisStage {
    fn name(&self) -> StageName {
        StageName::Synthesis
    }

    #[instrument(name = "stage.synthesis", skip(self, _ctx, state), fields(run_id = _ctx.run_id))]
    async fn execute(&self, _ctx: StageContext<'_>, mut state: ResearchState) -> StageOutcome {
        let chunks = state.usable_chunks();
        if chunks.is_empty() {
            info!("no usable evidence; emitting insufficient-evidence report");
            state.report_draft = Some(insufficient_evidence_report(state.effective_query()));
            return StageOutcome::ok(state);
        }

        // Citation numbers follow first appearance order of distinct sources.
        let mut cited: Vec<(String, String)> = Vec::new();
        let mut evidence = String::new();
        for chunk in &chunks {
            let canonical = canonical_url(&chunk.source_url);
            let number = match cited.iter().position(|(url, _)| *url == canonical) {
                Some(position) => position + 1,
                None => {
                    let title = state
                        .source_by_url(&chunk.source_url)
                        .map(|source| source.title.clone())
                        .unwrap_or_else(|| chunk.source_url.clone());
                    cited.push((canonical, title));
                    cited.len()
                }
            };
            evidence.push_str(&format!("[{number}] {}\n", chunk.text_span));
        }

        let feedback = if state.reflection_notes.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nRevision feedback from earlier passes:\n{}",
                state.reflection_notes.join("\n")
            )
        };

        let prompt = format!(
            "{REPORT_MARKER} answering the research question from the numbered \
             evidence below. Cite evidence inline as [n]. Be factual and note \
             where evidence is thin.{feedback}\n\n\
             Question: {}\n\nEvidence:\n{evidence}",
            state.effective_query()
        );

        let constraints = GenerationConstraints {
            max_tokens: Some(2048),
            temperature: Some(0.3),
        };

        let body = match self.generator.generate(&prompt, &constraints).await {
            Ok(body) => body,
            Err(err) => return StageOutcome::from_generation_error(state, err),
        };

        let mut report = format!("# {}\n\n{}", state.effective_query(), body.trim());
        report.push_str("\n\n## Sources\n");
        for (number, (url, title)) in cited.iter().enumerate() {
            report.push_str(&format!("[{}] {} — {}\n", number + 1, title, url));
        }

        info!(
            citations = cited.len(),
            chars = report.len(),
            "draft report synthesized"
        );
        state.report_draft = Some(report);
        StageOutcome::ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StubGenerator;
    use crate::config::WorkflowConfig;
    use crate::stage::StageSignal;
    use crate::state::{ChunkRecord, FetchStatus, SourceRecord};

    fn evidence_state() -> ResearchState {
        let mut state = ResearchState::new("q");
        let mut source = SourceRecord::new("https://a.example/1", "Primary source");
        source.fetch_status = FetchStatus::Fetched;
        state.push_source(source);
        state.document_chunks.push(ChunkRecord {
            source_url: "https://a.example/1".into(),
            sequence_index: 0,
            text_span: "supporting evidence".into(),
            vector_id: Some("vec-1".into()),
        });
        state
    }

    #[tokio::test]
    async fn synthesis_emits_cited_report() {
        let stage = SynthesisStage::new(Arc::new(StubGenerator::new()));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let outcome = stage.execute(ctx, evidence_state()).await;

        assert_eq!(outcome.signal, StageSignal::Ok);
        let report = outcome.state.report_draft.unwrap();
        assert!(report.contains("## Sources"));
        assert!(report.contains("Primary source"));
    }

    #[tokio::test]
    async fn zero_evidence_yields_insufficient_report_not_error() {
        let stage = SynthesisStage::new(Arc::new(StubGenerator::new()));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let outcome = stage.execute(ctx, ResearchState::new("empty topic")).await;

        assert_eq!(outcome.signal, StageSignal::Ok);
        assert!(outcome
            .state
            .report_draft
            .unwrap()
            .contains("Insufficient evidence"));
    }

    #[tokio::test]
    async fn rejected_sources_are_not_cited() {
        let stage = SynthesisStage::new(Arc::new(StubGenerator::new()));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let mut state = evidence_state();
        state.sources[0].approved = Some(false);

        let outcome = stage.execute(ctx, state).await;
        assert!(outcome
            .state
            .report_draft
            .unwrap()
            .contains("Insufficient evidence"));
    }
}
