//! The five stage implementations behind the uniform [`Stage`](crate::stage::Stage) contract.

mod analyzer;
mod clarification;
mod reflection;
mod search;
mod synthesis;

pub use analyzer::DocumentAnalyzerStage;
pub use clarification::ClarificationStage;
pub use reflection::ReflectionStage;
pub use search::WebSearchStage;
pub use synthesis::SynthesisStage;

/// Prompt markers. Each stage opens its prompt with one of these so scripted
/// generators (and log readers) can tell invocations apart.
pub const CLARIFY_MARKER: &str = "Rewrite the research question";
pub const QUERY_MARKER: &str = "Generate diverse search queries";
pub const REPORT_MARKER: &str = "Write a cited research report";
pub const REFLECT_MARKER: &str = "Assess the following research report";

/// Character-based windowing with overlap, used by the analyzer stage.
pub(crate) fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Strip a fenced code block if the generator wrapped its answer in one.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_size_and_overlap() {
        let text = "a".repeat(25);
        let chunks = chunk_text(&text, 10, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 10);
        assert_eq!(chunks[1].chars().count(), 10);
        // Last chunk carries the tail plus overlap.
        assert_eq!(chunks[2].chars().count(), 9);
    }

    #[test]
    fn chunking_short_text_yields_single_chunk() {
        assert_eq!(chunk_text("short", 100, 10), vec!["short".to_string()]);
        assert!(chunk_text("", 100, 10).is_empty());
    }

    #[test]
    fn chunking_is_utf8_safe() {
        let text = "日本語のテキストを分割する".repeat(10);
        let chunks = chunk_text(&text, 16, 4);
        let joined_len: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(joined_len >= text.chars().count());
    }

    #[test]
    fn code_fence_stripping() {
        assert_eq!(strip_code_fence("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("plain"), "plain");
    }
}
