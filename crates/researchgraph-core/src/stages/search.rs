use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::{GenerationConstraints, SearchHit, SearchProvider, TextGenerator};
use crate::graph::StageName;
use crate::stage::{Stage, StageContext, StageOutcome};
use crate::state::{FetchStatus, ResearchState, SourceKind, SourceRecord};

use super::{strip_code_fence, QUERY_MARKER};

/// Domain fragments used to classify sources for diversity tracking.
const DOMAIN_KINDS: &[(&str, SourceKind)] = &[
    ("arxiv.org", SourceKind::Academic),
    ("nature.com", SourceKind::Academic),
    ("science.org", SourceKind::Academic),
    ("ieee.org", SourceKind::Academic),
    ("acm.org", SourceKind::Academic),
    ("ncbi.nlm.nih.gov", SourceKind::Academic),
    ("techcrunch.com", SourceKind::News),
    ("wired.com", SourceKind::News),
    ("reuters.com", SourceKind::News),
    ("bbc.com", SourceKind::News),
    ("nytimes.com", SourceKind::News),
    ("-news.com", SourceKind::News),
    ("ibm.com", SourceKind::Industry),
    ("microsoft.com", SourceKind::Industry),
    ("nvidia.com", SourceKind::Industry),
    ("wikipedia.org", SourceKind::Wiki),
    ("medium.com", SourceKind::Blog),
    ("substack.com", SourceKind::Blog),
];

fn classify_source(url: &str) -> SourceKind {
    let lowered = url.to_ascii_lowercase();
    DOMAIN_KINDS
        .iter()
        .find(|(domain, _)| lowered.contains(domain))
        .map(|(_, kind)| *kind)
        .unwrap_or(SourceKind::Other)
}

static LIST_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*])\s*").expect("list prefix regex"));

/// Parse the generated query list: a JSON array when the provider obliges,
/// one query per line otherwise.
fn parse_queries(raw: &str) -> Vec<String> {
    let body = strip_code_fence(raw);

    if let Ok(parsed) = serde_json::from_str::<Vec<String>>(body) {
        return parsed
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
    }

    body.lines()
        .map(|line| LIST_PREFIX.replace(line, "").trim().trim_matches('"').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Fans multiple generated queries out to the search collaborator
/// concurrently and aggregates the deduplicated sources.
pub struct WebSearchStage {
    generator: Arc<dyn TextGenerator>,
    search: Arc<dyn SearchProvider>,
}

impl WebSearchStage {
    pub fn new(generator: Arc<dyn TextGenerator>, search: Arc<dyn SearchProvider>) -> Self {
        Self { generator, search }
    }

    async fn plan_queries(
        &self,
        state: &ResearchState,
        limit: usize,
    ) -> Result<Vec<String>, crate::collaborators::GenerationError> {
        let notes = if state.reflection_notes.is_empty() {
            String::new()
        } else {
            format!(
                "\n\nEarlier passes were judged incomplete; address this feedback:\n{}",
                state.reflection_notes.join("\n")
            )
        };

        let prompt = format!(
            "{QUERY_MARKER} for the research question below, covering academic, \
             news, industry, and critical perspectives. Reply with one search \
             query per line, at most {limit} lines.{notes}\n\n\
             Question: {}",
            state.effective_query()
        );

        let constraints = GenerationConstraints {
            max_tokens: Some(512),
            temperature: Some(0.7),
        };

        let generated = self.generator.generate(&prompt, &constraints).await?;
        let mut queries = parse_queries(&generated);

        // Queries seeded earlier (human search feedback, prior passes) are
        // kept; new ones are appended up to the configured budget.
        let mut merged: Vec<String> = state.search_queries.clone();
        for query in queries.drain(..) {
            if !merged.iter().any(|existing| existing == &query) {
                merged.push(query);
            }
        }
        if merged.is_empty() {
            merged.push(state.effective_query().to_string());
        }
        merged.truncate(limit.max(1));
        Ok(merged)
    }
}

#[async_trait]
impl Stage for WebSearchStage {
    fn name(&self) -> StageName {
        StageName::WebSearch
    }

    #[instrument(name = "stage.web_search", skip(self, ctx, state), fields(run_id = ctx.run_id))]
    async fn execute(&self, ctx: StageContext<'_>, mut state: ResearchState) -> StageOutcome {
        let queries = match self.plan_queries(&state, ctx.config.num_search_queries).await {
            Ok(queries) => queries,
            Err(err) => return StageOutcome::from_generation_error(state, err),
        };

        debug!(count = queries.len(), "search queries planned");

        let mut join_set = JoinSet::new();
        for query in queries.iter().cloned() {
            let provider = self.search.clone();
            let max_results = ctx.config.max_search_results;
            join_set.spawn(async move {
                let result = provider.search(&query, max_results).await;
                (query, result)
            });
        }

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut failed_queries = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(batch))) => hits.extend(batch),
                Ok((query, Err(err))) => {
                    warn!(%query, error = %err, "search query failed");
                    failed_queries += 1;
                }
                Err(err) => {
                    warn!(error = %err, "search task panicked");
                    failed_queries += 1;
                }
            }
        }

        // All results land in the state only now that every outbound call is
        // settled; a cancelled or failed pass leaves no partial writes.
        state.search_queries = queries;

        let mut added = 0usize;
        for hit in hits {
            let record = SourceRecord {
                url: hit.url.clone(),
                title: hit.title,
                snippet: hit.snippet,
                kind: classify_source(&hit.url),
                fetch_status: FetchStatus::Pending,
                approved: None,
            };
            if state.push_source(record) {
                added += 1;
            }
        }

        info!(
            added,
            total = state.sources.len(),
            failed_queries,
            "web search aggregated"
        );

        if state.sources.is_empty() {
            return StageOutcome::empty(state);
        }
        StageOutcome::ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{StubGenerator, StubSearch};
    use crate::config::WorkflowConfig;
    use crate::stage::StageSignal;

    fn ctx(config: &WorkflowConfig) -> StageContext<'_> {
        StageContext {
            run_id: "run-1",
            config,
        }
    }

    #[test]
    fn parses_json_array_queries() {
        let queries = parse_queries("```json\n[\"a b\", \"c d\"]\n```");
        assert_eq!(queries, vec!["a b", "c d"]);
    }

    #[test]
    fn parses_numbered_line_queries() {
        let queries = parse_queries("1. first query\n2) second query\n- third");
        assert_eq!(queries, vec!["first query", "second query", "third"]);
    }

    #[test]
    fn classifies_known_domains() {
        assert_eq!(
            classify_source("https://arxiv.org/abs/1"),
            SourceKind::Academic
        );
        assert_eq!(
            classify_source("https://en.wikipedia.org/wiki/X"),
            SourceKind::Wiki
        );
        assert_eq!(classify_source("https://unknown.example"), SourceKind::Other);
    }

    #[tokio::test]
    async fn search_aggregates_and_dedups_sources() {
        let stage = WebSearchStage::new(
            Arc::new(StubGenerator::new()),
            Arc::new(StubSearch::new()),
        );
        let config = WorkflowConfig::default();

        let outcome = stage.execute(ctx(&config), ResearchState::new("q")).await;

        assert_eq!(outcome.signal, StageSignal::Ok);
        // Three canned hits repeated across queries dedup to three sources.
        assert_eq!(outcome.state.sources.len(), 3);
        assert!(!outcome.state.search_queries.is_empty());
        assert!(outcome
            .state
            .sources
            .iter()
            .all(|s| s.fetch_status == FetchStatus::Pending && s.approved.is_none()));
    }

    #[tokio::test]
    async fn custom_hits_carry_their_domain_kind() {
        let search = Arc::new(StubSearch::with_hits(vec![SearchHit {
            url: "https://www.nature.com/articles/x".into(),
            title: "Journal article".into(),
            snippet: "findings".into(),
        }]));
        let stage = WebSearchStage::new(Arc::new(StubGenerator::new()), search.clone());
        let config = WorkflowConfig::default();

        let outcome = stage.execute(ctx(&config), ResearchState::new("q")).await;

        assert_eq!(outcome.state.sources.len(), 1);
        assert_eq!(outcome.state.sources[0].kind, SourceKind::Academic);
        // One outbound call per planned query.
        assert_eq!(
            search.call_count(),
            outcome.state.search_queries.len() as u64
        );
    }

    #[tokio::test]
    async fn all_queries_failing_degrades_to_empty() {
        let stage = WebSearchStage::new(
            Arc::new(StubGenerator::new()),
            Arc::new(StubSearch::failing()),
        );
        let config = WorkflowConfig::default();

        let outcome = stage.execute(ctx(&config), ResearchState::new("q")).await;

        assert_eq!(outcome.signal, StageSignal::OkEmpty);
        assert!(outcome.state.sources.is_empty());
    }
}
