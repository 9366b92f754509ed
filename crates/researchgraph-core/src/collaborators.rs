//! Narrow interfaces to the external collaborators the stages depend on,
//! plus deterministic in-memory stubs for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::state::ChunkRecord;

/// Failure modes of the text-generation collaborator.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation provider unavailable: {0}")]
    Unavailable(String),
    #[error("malformed generation response: {0}")]
    Malformed(String),
}

/// Optional constraints forwarded to the text-generation provider.
#[derive(Debug, Clone, Default)]
pub struct GenerationConstraints {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Text-generation capability used by every stage.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<String, GenerationError>;
}

/// A raw hit returned by the web-search collaborator.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Web-search capability. Partial failures across queries are tolerated by
/// the search stage; a single call either succeeds or errors whole.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>>;
}

/// Vector-similarity storage. The core treats vector ids as opaque handles.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store chunks and return one id per chunk, in order.
    async fn upsert(&self, chunks: &[ChunkRecord]) -> anyhow::Result<Vec<String>>;

    async fn query_similar(&self, query: &str, limit: usize)
        -> anyhow::Result<Vec<ChunkRecord>>;
}

/// Bundle of collaborator handles a stage registry is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn TextGenerator>,
    pub search: Arc<dyn SearchProvider>,
    pub vectors: Arc<dyn VectorStore>,
}

impl Collaborators {
    /// Fully stubbed set for tests, demos, and offline CLI runs.
    pub fn stubbed() -> Self {
        Self {
            generator: Arc::new(StubGenerator::new()),
            search: Arc::new(StubSearch::new()),
            vectors: Arc::new(InMemoryVectorStore::new()),
        }
    }
}

/// Deterministic generator for offline runs. Routes on the prompt markers the
/// stages embed and never calls out anywhere.
pub struct StubGenerator {
    verdicts: Mutex<VecDeque<String>>,
    fail_next: AtomicU32,
}

impl StubGenerator {
    pub fn new() -> Self {
        Self {
            verdicts: Mutex::new(VecDeque::new()),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Queue reflection verdicts to hand out in order; once drained the stub
    /// answers SUFFICIENT.
    pub fn with_verdicts<I, S>(verdicts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stub = Self::new();
        {
            let mut queue = stub.verdicts.lock().expect("verdict queue poisoned");
            queue.extend(verdicts.into_iter().map(Into::into));
        }
        stub
    }

    /// Make the next `count` generate calls fail with a retryable outage.
    pub fn fail_next(self, count: u32) -> Self {
        self.fail_next.store(count, Ordering::SeqCst);
        self
    }

    fn next_verdict(&self) -> String {
        let mut queue = self.verdicts.lock().expect("verdict queue poisoned");
        queue.pop_front().unwrap_or_else(|| "SUFFICIENT".to_string())
    }
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _constraints: &GenerationConstraints,
    ) -> Result<String, GenerationError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(GenerationError::Unavailable(
                "stub provider outage".to_string(),
            ));
        }

        if prompt.starts_with(crate::stages::CLARIFY_MARKER) {
            let question = prompt.lines().last().unwrap_or_default().trim();
            return Ok(question.trim_start_matches("Question:").trim().to_string());
        }
        if prompt.starts_with(crate::stages::QUERY_MARKER) {
            return Ok([
                "overview and key developments",
                "recent announcements and news",
                "limitations and open challenges",
            ]
            .join("\n"));
        }
        if prompt.starts_with(crate::stages::REPORT_MARKER) {
            return Ok(
                "The collected evidence points to steady progress in the area, \
                 with early results [1] and follow-up analyses [2] broadly in \
                 agreement."
                    .to_string(),
            );
        }
        if prompt.starts_with(crate::stages::REFLECT_MARKER) {
            let verdict = self.next_verdict();
            return Ok(format!(
                "{{\"verdict\": \"{verdict}\", \"feedback\": \"stub evaluation\"}}"
            ));
        }

        Ok(String::new())
    }
}

/// Canned search results for offline runs.
pub struct StubSearch {
    hits: Vec<SearchHit>,
    fail_all: bool,
    calls: AtomicU64,
}

impl StubSearch {
    pub fn new() -> Self {
        Self {
            hits: vec![
                SearchHit {
                    url: "https://arxiv.org/abs/0000.0001".into(),
                    title: "A survey of the field".into(),
                    snippet: "This survey reviews the principal techniques and open \
                              problems, covering both theoretical foundations and \
                              experimental results reported over the last decade."
                        .into(),
                },
                SearchHit {
                    url: "https://example-news.com/latest".into(),
                    title: "Industry announcement".into(),
                    snippet: "The announcement outlines a staged rollout with pilot \
                              deployments in two regions and a broader release to \
                              follow pending review."
                        .into(),
                },
                SearchHit {
                    url: "https://en.wikipedia.org/wiki/Topic".into(),
                    title: "Background article".into(),
                    snippet: "Background material describing terminology, history, \
                              and the main lines of ongoing work."
                        .into(),
                },
            ],
            fail_all: false,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            fail_all: false,
            calls: AtomicU64::new(0),
        }
    }

    /// Every query errors; the search stage should degrade to OK_EMPTY.
    pub fn failing() -> Self {
        Self {
            hits: Vec::new(),
            fail_all: true,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StubSearch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, _query: &str, max_results: usize) -> anyhow::Result<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all {
            anyhow::bail!("stub search backend unreachable");
        }
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}

/// In-memory vector store; ids are monotonic and opaque to the caller.
pub struct InMemoryVectorStore {
    records: DashMap<String, ChunkRecord>,
    next_id: AtomicU64,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, chunks: &[ChunkRecord]) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = format!("vec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.records.insert(id.clone(), chunk.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn query_similar(
        &self,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ChunkRecord>> {
        // Naive term-overlap ranking; real similarity lives in the external
        // collaborator this stub stands in for.
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let mut scored: Vec<(usize, ChunkRecord)> = self
            .records
            .iter()
            .map(|entry| {
                let text = entry.value().text_span.to_ascii_lowercase();
                let score = terms.iter().filter(|term| text.contains(*term)).count();
                (score, entry.value().clone())
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, chunk)| chunk)
            .collect())
    }
}
