//! Shared research state threaded through every stage.
//!
//! The state is a plain value: stages receive it by value and hand back a new
//! one, so nothing outside the engine ever aliases the authoritative copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RunFailure;

/// Lifecycle of a run as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Started,
    Clarifying,
    Searching,
    Analyzing,
    Synthesizing,
    Reflecting,
    AwaitingHuman,
    Done,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Fetch lifecycle of a discovered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Pending,
    Fetched,
    Rejected,
    Failed,
}

/// Rough category of a source, derived from its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Academic,
    News,
    Industry,
    Blog,
    Wiki,
    Other,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Academic => "academic",
            Self::News => "news",
            Self::Industry => "industry",
            Self::Blog => "blog",
            Self::Wiki => "wiki",
            Self::Other => "other",
        }
    }
}

/// A web source discovered by the search stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    pub kind: SourceKind,
    pub fetch_status: FetchStatus,
    /// Unset until human review runs; `Some(false)` permanently excludes the
    /// source from chunking.
    pub approved: Option<bool>,
}

impl SourceRecord {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            snippet: String::new(),
            kind: SourceKind::Other,
            fetch_status: FetchStatus::Pending,
            approved: None,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Excluded sources never reach chunking.
    pub fn is_excluded(&self) -> bool {
        self.approved == Some(false) || self.fetch_status == FetchStatus::Rejected
    }
}

/// Normalised form used for source uniqueness: lowercased scheme and host,
/// fragment dropped, trailing slash trimmed.
pub fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let lowered = match without_fragment.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.split_once('/') {
                Some((host, path)) => (host.to_ascii_lowercase(), format!("/{path}")),
                None => (rest.to_ascii_lowercase(), String::new()),
            };
            format!("{}://{}{}", scheme.to_ascii_lowercase(), host, path)
        }
        None => without_fragment.to_ascii_lowercase(),
    };
    lowered.trim_end_matches('/').to_string()
}

/// One chunk of an analysed document. Holds a back-reference to its source,
/// never ownership of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub source_url: String,
    pub sequence_index: usize,
    pub text_span: String,
    /// Opaque handle issued by the vector storage collaborator.
    pub vector_id: Option<String>,
}

/// Verdict of the reflection stage on the current draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReflectionVerdict {
    Sufficient,
    Insufficient,
}

/// The single mutable record threaded through every stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    pub query: String,
    pub clarified_query: Option<String>,
    pub search_queries: Vec<String>,
    /// Unique by canonical URL; insertion order preserved.
    pub sources: Vec<SourceRecord>,
    pub source_diversity: BTreeMap<String, usize>,
    pub document_chunks: Vec<ChunkRecord>,
    pub report_draft: Option<String>,
    pub reflection_notes: Vec<String>,
    pub last_verdict: Option<ReflectionVerdict>,
    pub iteration_count: u32,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
}

impl ResearchState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            clarified_query: None,
            search_queries: Vec::new(),
            sources: Vec::new(),
            source_diversity: BTreeMap::new(),
            document_chunks: Vec::new(),
            report_draft: None,
            reflection_notes: Vec::new(),
            last_verdict: None,
            iteration_count: 0,
            status: RunStatus::Started,
            failure: None,
        }
    }

    /// The query stages should act on: the clarified form when present.
    pub fn effective_query(&self) -> &str {
        self.clarified_query.as_deref().unwrap_or(&self.query)
    }

    /// Insert a source unless one with the same canonical URL exists.
    /// Returns whether the source was added.
    pub fn push_source(&mut self, source: SourceRecord) -> bool {
        let canonical = canonical_url(&source.url);
        if self
            .sources
            .iter()
            .any(|existing| canonical_url(&existing.url) == canonical)
        {
            return false;
        }
        *self
            .source_diversity
            .entry(source.kind.as_str().to_string())
            .or_insert(0) += 1;
        self.sources.push(source);
        true
    }

    pub fn source_by_url(&self, url: &str) -> Option<&SourceRecord> {
        let canonical = canonical_url(url);
        self.sources
            .iter()
            .find(|source| canonical_url(&source.url) == canonical)
    }

    /// Chunks whose parent source is still included. A chunk of a rejected
    /// source is logically destroyed by exclusion.
    pub fn usable_chunks(&self) -> Vec<&ChunkRecord> {
        self.document_chunks
            .iter()
            .filter(|chunk| {
                self.source_by_url(&chunk.source_url)
                    .is_some_and(|source| !source.is_excluded())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_url_normalises_host_and_trailing_slash() {
        assert_eq!(
            canonical_url("HTTPS://Example.COM/Path/"),
            "https://example.com/Path"
        );
        assert_eq!(
            canonical_url("https://example.com/a#section"),
            "https://example.com/a"
        );
    }

    #[test]
    fn push_source_dedups_by_canonical_url() {
        let mut state = ResearchState::new("q");
        assert!(state.push_source(SourceRecord::new("https://example.com/a", "A")));
        assert!(!state.push_source(SourceRecord::new("https://EXAMPLE.com/a/", "A again")));
        assert_eq!(state.sources.len(), 1);
        assert_eq!(state.source_diversity.get("other"), Some(&1));
    }

    #[test]
    fn usable_chunks_drops_rejected_parents() {
        let mut state = ResearchState::new("q");
        let mut kept = SourceRecord::new("https://a.example/1", "kept");
        kept.fetch_status = FetchStatus::Fetched;
        let mut dropped = SourceRecord::new("https://a.example/2", "dropped");
        dropped.fetch_status = FetchStatus::Fetched;
        dropped.approved = Some(false);
        state.push_source(kept);
        state.push_source(dropped);
        state.document_chunks = vec![
            ChunkRecord {
                source_url: "https://a.example/1".into(),
                sequence_index: 0,
                text_span: "kept text".into(),
                vector_id: None,
            },
            ChunkRecord {
                source_url: "https://a.example/2".into(),
                sequence_index: 0,
                text_span: "dropped text".into(),
                vector_id: None,
            },
        ];

        let usable = state.usable_chunks();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].source_url, "https://a.example/1");
    }

    #[test]
    fn effective_query_prefers_clarified_form() {
        let mut state = ResearchState::new("raw");
        assert_eq!(state.effective_query(), "raw");
        state.clarified_query = Some("clarified".into());
        assert_eq!(state.effective_query(), "clarified");
    }
}
