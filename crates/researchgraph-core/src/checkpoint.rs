//! Durable snapshots of paused runs.
//!
//! Snapshots are independent copies: mutating the live state after a save
//! never alters the stored checkpoint. Stores are keyed by `run_id` and must
//! not interfere across runs.

use std::fs::{create_dir_all, File};
use std::io::BufReader;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WorkflowError;
use crate::graph::GraphPosition;
use crate::state::ResearchState;

/// One durable snapshot. The latest checkpoint for a run is authoritative
/// for resume; earlier ones are superseded but may be retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub position: GraphPosition,
    pub state: ResearchState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, position: GraphPosition, state: ResearchState) -> Self {
        Self {
            run_id: run_id.into(),
            position,
            state,
            created_at: Utc::now(),
        }
    }

    fn same_content(&self, other: &Checkpoint) -> bool {
        self.position == other.position && self.state == other.state
    }
}

/// Persistence contract for paused runs.
pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot. Saving identical content for the same position is
    /// a no-op.
    fn save(&self, checkpoint: Checkpoint) -> Result<(), WorkflowError>;

    /// The most recently saved checkpoint for the run.
    fn latest(&self, run_id: &str) -> Result<Checkpoint, WorkflowError>;

    /// Alias for [`latest`](Self::latest); the latest snapshot is the only
    /// loadable one.
    fn load(&self, run_id: &str) -> Result<Checkpoint, WorkflowError> {
        self.latest(run_id)
    }
}

/// Keeps the full checkpoint history per run in memory.
pub struct InMemoryCheckpointStore {
    runs: DashMap<String, Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
        }
    }

    pub fn history_len(&self, run_id: &str) -> usize {
        self.runs.get(run_id).map(|entry| entry.len()).unwrap_or(0)
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: Checkpoint) -> Result<(), WorkflowError> {
        let mut history = self.runs.entry(checkpoint.run_id.clone()).or_default();
        if let Some(last) = history.last() {
            if last.same_content(&checkpoint) {
                debug!(run_id = %checkpoint.run_id, "identical checkpoint skipped");
                return Ok(());
            }
        }
        history.push(checkpoint);
        Ok(())
    }

    fn latest(&self, run_id: &str) -> Result<Checkpoint, WorkflowError> {
        self.runs
            .get(run_id)
            .and_then(|history| history.last().cloned())
            .ok_or_else(|| WorkflowError::UnknownRun(run_id.to_string()))
    }
}

/// One JSON file per run holding its latest checkpoint; survives process
/// restarts.
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        let safe: String = run_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn save(&self, checkpoint: Checkpoint) -> Result<(), WorkflowError> {
        create_dir_all(&self.dir).map_err(|err| WorkflowError::io(self.dir.clone(), err))?;

        let path = self.path_for(&checkpoint.run_id);
        if let Ok(existing) = self.latest(&checkpoint.run_id) {
            if existing.same_content(&checkpoint) {
                return Ok(());
            }
        }

        let file = File::create(&path).map_err(|err| WorkflowError::io(path.clone(), err))?;
        serde_json::to_writer_pretty(file, &checkpoint)
            .map_err(|err| WorkflowError::CorruptCheckpoint {
                run_id: checkpoint.run_id.clone(),
                reason: err.to_string(),
            })?;
        debug!(run_id = %checkpoint.run_id, path = %path.display(), "checkpoint persisted");
        Ok(())
    }

    fn latest(&self, run_id: &str) -> Result<Checkpoint, WorkflowError> {
        let path = self.path_for(run_id);
        let file = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                WorkflowError::UnknownRun(run_id.to_string())
            } else {
                WorkflowError::io(path.clone(), err)
            }
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            WorkflowError::CorruptCheckpoint {
                run_id: run_id.to_string(),
                reason: err.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageName;

    fn checkpoint(run_id: &str, query: &str) -> Checkpoint {
        Checkpoint::new(
            run_id,
            GraphPosition {
                node: StageName::WebSearch,
                edge_pending: true,
            },
            ResearchState::new(query),
        )
    }

    #[test]
    fn save_then_load_round_trips_deep_copy() {
        let store = InMemoryCheckpointStore::new();
        let mut live = ResearchState::new("q");
        store
            .save(Checkpoint::new("run-1", GraphPosition::start(), live.clone()))
            .unwrap();

        // Mutating the live state must not reach the stored snapshot.
        live.search_queries.push("mutated".into());

        let loaded = store.load("run-1").unwrap();
        assert!(loaded.state.search_queries.is_empty());
        assert_eq!(loaded.state.query, "q");
    }

    #[test]
    fn identical_save_is_a_no_op() {
        let store = InMemoryCheckpointStore::new();
        store.save(checkpoint("run-1", "q")).unwrap();
        store.save(checkpoint("run-1", "q")).unwrap();
        assert_eq!(store.history_len("run-1"), 1);

        store.save(checkpoint("run-1", "q2")).unwrap();
        assert_eq!(store.history_len("run-1"), 2);
    }

    #[test]
    fn latest_wins_and_missing_run_errors() {
        let store = InMemoryCheckpointStore::new();
        store.save(checkpoint("run-1", "first")).unwrap();
        store.save(checkpoint("run-1", "second")).unwrap();

        assert_eq!(store.latest("run-1").unwrap().state.query, "second");
        assert!(matches!(
            store.latest("missing"),
            Err(WorkflowError::UnknownRun(_))
        ));
    }

    #[test]
    fn runs_do_not_interfere() {
        let store = InMemoryCheckpointStore::new();
        store.save(checkpoint("run-a", "qa")).unwrap();
        store.save(checkpoint("run-b", "qb")).unwrap();
        assert_eq!(store.latest("run-a").unwrap().state.query, "qa");
        assert_eq!(store.latest("run-b").unwrap().state.query, "qb");
    }

    #[test]
    fn file_store_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::new(dir.path());
        store.save(checkpoint("run-1", "persisted")).unwrap();

        let reopened = JsonFileCheckpointStore::new(dir.path());
        let loaded = reopened.load("run-1").unwrap();
        assert_eq!(loaded.state.query, "persisted");
        assert_eq!(loaded.position.node, StageName::WebSearch);

        assert!(matches!(
            reopened.load("missing"),
            Err(WorkflowError::UnknownRun(_))
        ));
    }
}
