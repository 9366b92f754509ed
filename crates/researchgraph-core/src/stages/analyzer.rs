use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::collaborators::VectorStore;
use crate::graph::StageName;
use crate::stage::{Stage, StageContext, StageOutcome};
use crate::state::{canonical_url, ChunkRecord, FetchStatus, ResearchState};

use super::chunk_text;

/// Chunks approved sources and hands the chunks to the vector-storage
/// collaborator. Rejected sources never reach chunking.
pub struct DocumentAnalyzerStage {
    vectors: Arc<dyn VectorStore>,
}

impl DocumentAnalyzerStage {
    pub fn new(vectors: Arc<dyn VectorStore>) -> Self {
        Self { vectors }
    }
}

#[async_trait]
impl Stage for DocumentAnalyzerStage {
    fn name(&self) -> StageName {
        StageName::DocumentAnalyzer
    }

    #[instrument(name = "stage.document_analyzer", skip(self, ctx, state), fields(run_id = ctx.run_id))]
    async fn execute(&self, ctx: StageContext<'_>, mut state: ResearchState) -> StageOutcome {
        // URLs that already have chunks (earlier loop passes) are skipped so
        // re-entering this stage never duplicates chunks.
        let chunked: HashSet<String> = state
            .document_chunks
            .iter()
            .map(|chunk| canonical_url(&chunk.source_url))
            .collect();

        let mut fetched_urls: Vec<String> = Vec::new();
        let mut new_chunks: Vec<ChunkRecord> = Vec::new();

        for source in &state.sources {
            if source.is_excluded() {
                debug!(url = %source.url, "source excluded from analysis");
                continue;
            }
            fetched_urls.push(canonical_url(&source.url));
            if chunked.contains(&canonical_url(&source.url)) {
                continue;
            }

            let text = if source.snippet.trim().is_empty() {
                source.title.clone()
            } else {
                source.snippet.clone()
            };

            for (index, span) in chunk_text(&text, ctx.config.chunk_size, ctx.config.chunk_overlap)
                .into_iter()
                .enumerate()
            {
                new_chunks.push(ChunkRecord {
                    source_url: source.url.clone(),
                    sequence_index: index,
                    text_span: span,
                    vector_id: None,
                });
            }
        }

        if !new_chunks.is_empty() {
            let ids = match self.vectors.upsert(&new_chunks).await {
                Ok(ids) => ids,
                // State is untouched up to here, so a retry starts clean.
                Err(err) => return StageOutcome::retryable(state, err.to_string()),
            };
            for (chunk, id) in new_chunks.iter_mut().zip(ids) {
                chunk.vector_id = Some(id);
            }
        }

        for source in &mut state.sources {
            if fetched_urls.contains(&canonical_url(&source.url)) {
                source.fetch_status = FetchStatus::Fetched;
            }
        }
        let added = new_chunks.len();
        state.document_chunks.extend(new_chunks);

        info!(
            added,
            total = state.document_chunks.len(),
            "document analysis complete"
        );

        if state.document_chunks.is_empty() {
            return StageOutcome::empty(state);
        }
        StageOutcome::ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryVectorStore;
    use crate::config::WorkflowConfig;
    use crate::stage::StageSignal;
    use crate::state::SourceRecord;

    fn state_with_sources() -> ResearchState {
        let mut state = ResearchState::new("q");
        state.push_source(
            SourceRecord::new("https://a.example/1", "One").with_snippet("alpha ".repeat(40)),
        );
        state.push_source(
            SourceRecord::new("https://a.example/2", "Two").with_snippet("beta ".repeat(40)),
        );
        state
    }

    #[tokio::test]
    async fn analyzer_chunks_included_sources() {
        let stage = DocumentAnalyzerStage::new(Arc::new(InMemoryVectorStore::new()));
        let config = WorkflowConfig {
            chunk_size: 100,
            chunk_overlap: 20,
            ..WorkflowConfig::default()
        };
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let outcome = stage.execute(ctx, state_with_sources()).await;

        assert_eq!(outcome.signal, StageSignal::Ok);
        assert!(!outcome.state.document_chunks.is_empty());
        assert!(outcome
            .state
            .document_chunks
            .iter()
            .all(|chunk| chunk.vector_id.is_some()));
        assert!(outcome
            .state
            .sources
            .iter()
            .all(|source| source.fetch_status == FetchStatus::Fetched));
    }

    #[tokio::test]
    async fn rejected_source_never_produces_chunks() {
        let stage = DocumentAnalyzerStage::new(Arc::new(InMemoryVectorStore::new()));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let mut state = state_with_sources();
        state.sources[1].approved = Some(false);

        let outcome = stage.execute(ctx, state).await;

        assert!(outcome
            .state
            .document_chunks
            .iter()
            .all(|chunk| chunk.source_url != "https://a.example/2"));
        assert_eq!(
            outcome.state.sources[1].fetch_status,
            FetchStatus::Pending,
            "excluded sources are not fetched"
        );
    }

    #[tokio::test]
    async fn empty_source_set_yields_ok_empty() {
        let stage = DocumentAnalyzerStage::new(Arc::new(InMemoryVectorStore::new()));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let outcome = stage.execute(ctx, ResearchState::new("q")).await;
        assert_eq!(outcome.signal, StageSignal::OkEmpty);
    }

    #[tokio::test]
    async fn second_pass_does_not_duplicate_chunks() {
        let stage = DocumentAnalyzerStage::new(Arc::new(InMemoryVectorStore::new()));
        let config = WorkflowConfig::default();
        let ctx = StageContext {
            run_id: "run-1",
            config: &config,
        };

        let first = stage.execute(ctx, state_with_sources()).await;
        let count = first.state.document_chunks.len();
        let second = stage.execute(ctx, first.state).await;
        assert_eq!(second.state.document_chunks.len(), count);
    }
}
