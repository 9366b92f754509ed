use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "RESEARCHGRAPH_CONFIG";

/// Tunable knobs of a workflow run. Every field has a sane default so a bare
/// `WorkflowConfig::default()` drives the full pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Loop-back budget for the reflection edge.
    #[serde(default = "WorkflowConfig::default_max_iterations")]
    pub max_iterations: u32,
    /// Retries per stage invocation on transient collaborator failures.
    #[serde(default = "WorkflowConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "WorkflowConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "WorkflowConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "WorkflowConfig::default_max_query_len")]
    pub max_query_len: usize,

    /// Pause for source approval after the search stage.
    #[serde(default = "WorkflowConfig::default_true")]
    pub review_sources: bool,
    /// Pause for report review after the synthesis stage.
    #[serde(default = "WorkflowConfig::default_true")]
    pub review_report: bool,
    /// Pause for an iteration decision when reflection wants another pass.
    #[serde(default = "WorkflowConfig::default_true")]
    pub confirm_iterations: bool,
    /// Pause for search feedback after clarification. Off by default.
    #[serde(default)]
    pub review_search_plan: bool,

    #[serde(default = "WorkflowConfig::default_num_search_queries")]
    pub num_search_queries: usize,
    /// Maximum results requested per outbound search query.
    #[serde(default = "WorkflowConfig::default_max_search_results")]
    pub max_search_results: usize,
    #[serde(default = "WorkflowConfig::default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "WorkflowConfig::default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl WorkflowConfig {
    const fn default_max_iterations() -> u32 {
        3
    }

    const fn default_max_retries() -> u32 {
        2
    }

    const fn default_initial_backoff_ms() -> u64 {
        500
    }

    const fn default_max_backoff_ms() -> u64 {
        10_000
    }

    const fn default_max_query_len() -> usize {
        4096
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_num_search_queries() -> usize {
        5
    }

    const fn default_max_search_results() -> usize {
        5
    }

    const fn default_chunk_size() -> usize {
        1000
    }

    const fn default_chunk_overlap() -> usize {
        200
    }

    /// Headless profile: no interrupt point fires.
    pub fn unattended() -> Self {
        Self {
            review_sources: false,
            review_report: false,
            confirm_iterations: false,
            review_search_plan: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_query_len == 0 {
            return Err(WorkflowError::InvalidConfiguration(
                "max_query_len must be positive".into(),
            ));
        }
        if self.num_search_queries == 0 {
            return Err(WorkflowError::InvalidConfiguration(
                "num_search_queries must be positive".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(WorkflowError::InvalidConfiguration(
                "chunk_size must be positive".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(WorkflowError::InvalidConfiguration(
                "chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::default_max_iterations(),
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
            max_query_len: Self::default_max_query_len(),
            review_sources: true,
            review_report: true,
            confirm_iterations: true,
            review_search_plan: false,
            num_search_queries: Self::default_num_search_queries(),
            max_search_results: Self::default_max_search_results(),
            chunk_size: Self::default_chunk_size(),
            chunk_overlap: Self::default_chunk_overlap(),
        }
    }
}

/// Loads and validates configuration from disk or the environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument (must exist).
    /// 2. `RESEARCHGRAPH_CONFIG` environment variable (must exist).
    /// 3. `config.toml` in the current working directory, falling back to
    ///    defaults when absent.
    pub fn load(path: Option<PathBuf>) -> Result<WorkflowConfig, WorkflowError> {
        let explicit = path.is_some() || env::var(CONFIG_PATH_ENV).is_ok();
        let candidate = resolve_path(path);

        if !explicit && !candidate.exists() {
            return Ok(WorkflowConfig::default());
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| WorkflowError::io(candidate.clone(), err))?;
        let config: WorkflowConfig = toml::from_str(&raw)
            .map_err(|err| WorkflowError::InvalidConfiguration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkflowConfig::default();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.num_search_queries, 5);
        assert!(config.review_sources);
        assert!(!config.review_search_plan);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn overlap_must_stay_below_chunk_size() {
        let config = WorkflowConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..WorkflowConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: WorkflowConfig =
            toml::from_str("max_iterations = 1\nreview_sources = false").unwrap();
        assert_eq!(config.max_iterations, 1);
        assert!(!config.review_sources);
        assert_eq!(config.chunk_size, 1000);
    }
}
