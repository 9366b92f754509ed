//! The workflow graph engine.
//!
//! Drives one run at a time through the stage graph: strictly ordered
//! transitions per run, at most one invocation in flight per run, bounded
//! reflection looping, and explicit suspension via `StepResult::Paused`.
//! Between `step`/`resume` calls a run holds nothing but checkpointed state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use crate::collaborators::Collaborators;
use crate::config::WorkflowConfig;
use crate::error::{FailureKind, RunFailure, WorkflowError};
use crate::graph::{next_target, GraphPosition, StageName, Target};
use crate::interrupt::{self, HumanInput, InterruptRequest, ResumeDirective};
use crate::metrics::MetricsCollector;
use crate::stage::{Stage, StageContext, StageOutcome, StageSignal};
use crate::stages::{
    ClarificationStage, DocumentAnalyzerStage, ReflectionStage, SynthesisStage, WebSearchStage,
};
use crate::state::{ResearchState, RunStatus};

/// Handle returned by [`WorkflowEngine::start`].
#[derive(Debug, Clone, Serialize)]
pub struct RunHandle {
    pub run_id: String,
    pub status: RunStatus,
}

/// Outcome of one engine transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepResult {
    Continue { status: RunStatus },
    Paused(InterruptRequest),
    Done { report: String },
    Failed(RunFailure),
}

/// Caller-facing view of a run, safe to read while a transition is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub pending_interrupt: Option<InterruptRequest>,
    pub report: Option<String>,
    pub failure: Option<RunFailure>,
    pub iteration_count: u32,
}

struct RunState {
    config: WorkflowConfig,
    state: ResearchState,
    position: GraphPosition,
    pending_interrupt: Option<InterruptRequest>,
}

struct RunSlot {
    /// Advisory per-run lock, held only for the duration of one transition.
    inner: Mutex<RunState>,
    /// Last published view; kept outside the lock so `status` never blocks.
    snapshot: RwLock<RunReport>,
}

/// Builder for [`WorkflowEngine`].
pub struct EngineBuilder {
    config: WorkflowConfig,
    collaborators: Option<Collaborators>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    metrics: Option<MetricsCollector>,
}

impl EngineBuilder {
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, WorkflowError> {
        self.config.validate()?;
        let collaborators = self.collaborators.unwrap_or_else(Collaborators::stubbed);
        Ok(WorkflowEngine {
            config: self.config,
            stages: stage_registry(&collaborators),
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            metrics: self.metrics.unwrap_or_default(),
            runs: DashMap::new(),
        })
    }
}

fn stage_registry(collaborators: &Collaborators) -> HashMap<StageName, Arc<dyn Stage>> {
    let mut stages: HashMap<StageName, Arc<dyn Stage>> = HashMap::new();
    stages.insert(
        StageName::Clarification,
        Arc::new(ClarificationStage::new(collaborators.generator.clone())),
    );
    stages.insert(
        StageName::WebSearch,
        Arc::new(WebSearchStage::new(
            collaborators.generator.clone(),
            collaborators.search.clone(),
        )),
    );
    stages.insert(
        StageName::DocumentAnalyzer,
        Arc::new(DocumentAnalyzerStage::new(collaborators.vectors.clone())),
    );
    stages.insert(
        StageName::Synthesis,
        Arc::new(SynthesisStage::new(collaborators.generator.clone())),
    );
    stages.insert(
        StageName::Reflection,
        Arc::new(ReflectionStage::new(collaborators.generator.clone())),
    );
    stages
}

/// The orchestrator. Runs are independent; the checkpoint store is the only
/// resource shared across them.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    stages: HashMap<StageName, Arc<dyn Stage>>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: MetricsCollector,
    runs: DashMap<String, Arc<RunSlot>>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: WorkflowConfig::default(),
            collaborators: None,
            checkpoints: None,
            metrics: None,
        }
    }

    /// Engine wired entirely to in-memory stubs; suits tests and demos.
    pub fn with_stubs() -> Self {
        Self::builder()
            .build()
            .expect("default configuration is valid")
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        self.checkpoints.clone()
    }

    /// Begin a run for `query`, positioned at the clarification stage.
    pub fn start(
        &self,
        query: &str,
        config: Option<WorkflowConfig>,
    ) -> Result<RunHandle, WorkflowError> {
        let config = config.unwrap_or_else(|| self.config.clone());
        config.validate()?;

        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(WorkflowError::InvalidQuery("query is empty".into()));
        }
        if trimmed.chars().count() > config.max_query_len {
            return Err(WorkflowError::InvalidQuery(format!(
                "query exceeds {} characters",
                config.max_query_len
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        let state = ResearchState::new(trimmed);
        let snapshot = RunReport {
            run_id: run_id.clone(),
            status: RunStatus::Started,
            pending_interrupt: None,
            report: None,
            failure: None,
            iteration_count: 0,
        };
        let slot = Arc::new(RunSlot {
            inner: Mutex::new(RunState {
                config,
                state,
                position: GraphPosition::start(),
                pending_interrupt: None,
            }),
            snapshot: RwLock::new(snapshot),
        });
        self.runs.insert(run_id.clone(), slot);

        info!(%run_id, "run started");
        Ok(RunHandle {
            run_id,
            status: RunStatus::Started,
        })
    }

    /// Advance the run by exactly one stage transition.
    pub async fn step(&self, run_id: &str) -> Result<StepResult, WorkflowError> {
        let slot = self.slot(run_id)?;
        let mut run = lock_run(run_id, &slot)?;

        if run.state.status == RunStatus::AwaitingHuman {
            return Err(WorkflowError::not_resumable(
                run_id,
                "run is paused awaiting human input; call resume",
            ));
        }
        if run.state.status.is_terminal() {
            return Ok(terminal_result(&run.state));
        }

        let stage_name = run.position.node;
        let stage = self
            .stages
            .get(&stage_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no stage registered for {stage_name}"))?;

        run.state.status = stage_name.running_status();
        self.update_snapshot(run_id, &slot, &run);

        match self.run_stage(run_id, stage.as_ref(), &mut run).await {
            StageSignal::Ok | StageSignal::OkEmpty => {}
            StageSignal::Retryable(message) => {
                let result = self.fail_run(run_id, &mut run, stage_name, FailureKind::Retryable, message);
                self.update_snapshot(run_id, &slot, &run);
                return Ok(result);
            }
            StageSignal::Fatal(message) => {
                let result = self.fail_run(run_id, &mut run, stage_name, FailureKind::Fatal, message);
                self.update_snapshot(run_id, &slot, &run);
                return Ok(result);
            }
        }

        if let Some(request) = interrupt::after_stage(run_id, stage_name, &run.state, &run.config) {
            run.state.status = RunStatus::AwaitingHuman;
            run.position.edge_pending = true;
            run.pending_interrupt = Some(request.clone());
            self.save_checkpoint(run_id, &run)?;
            self.update_snapshot(run_id, &slot, &run);
            info!(%run_id, kind = ?request.kind(), "run paused for human input");
            return Ok(StepResult::Paused(request));
        }

        let result = self.advance(run_id, &mut run);
        self.update_snapshot(run_id, &slot, &run);
        Ok(result)
    }

    /// Merge human input into a paused run and continue past the pending edge.
    pub async fn resume(
        &self,
        run_id: &str,
        input: HumanInput,
    ) -> Result<StepResult, WorkflowError> {
        let slot = self.slot(run_id)?;
        let mut run = lock_run(run_id, &slot)?;

        if run.state.status != RunStatus::AwaitingHuman {
            return Err(WorkflowError::not_resumable(
                run_id,
                "run has no pending interrupt",
            ));
        }
        let Some(pending) = run.pending_interrupt.clone() else {
            return Err(WorkflowError::not_resumable(
                run_id,
                "pending interrupt record is missing",
            ));
        };
        if pending.kind() != input.kind() {
            return Err(WorkflowError::not_resumable(
                run_id,
                format!(
                    "expected {:?} input, got {:?}",
                    pending.kind(),
                    input.kind()
                ),
            ));
        }

        run.pending_interrupt = None;
        let directive = interrupt::apply_human_input(&mut run.state, input);
        run.state.status = run.position.node.running_status();

        let result = match directive {
            ResumeDirective::Finish => {
                run.position.edge_pending = false;
                self.finish(run_id, &mut run)
            }
            ResumeDirective::Continue => self.advance(run_id, &mut run),
        };

        if !run.state.status.is_terminal() {
            self.save_checkpoint(run_id, &run)?;
        }
        self.update_snapshot(run_id, &slot, &run);
        Ok(result)
    }

    /// Mark a run failed between transitions. In-flight stage work for other
    /// runs is untouched; a terminal run is left as-is.
    pub async fn cancel(&self, run_id: &str) -> Result<(), WorkflowError> {
        let slot = self.slot(run_id)?;
        let mut run = lock_run(run_id, &slot)?;

        if run.state.status.is_terminal() {
            return Ok(());
        }

        let stage = run.position.node;
        run.pending_interrupt = None;
        let _ = self.fail_run(
            run_id,
            &mut run,
            stage,
            FailureKind::Cancelled,
            "cancelled by caller".to_string(),
        );
        self.update_snapshot(run_id, &slot, &run);
        Ok(())
    }

    /// Current view of a run; never blocks on an in-flight transition.
    pub fn status(&self, run_id: &str) -> Result<RunReport, WorkflowError> {
        if let Some(slot) = self.runs.get(run_id) {
            let report = match slot.snapshot.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            return Ok(report);
        }

        // Restarted process: fall back to the checkpoint store.
        let checkpoint = self.checkpoints.latest(run_id)?;
        Ok(self.report_from_checkpoint(run_id, &checkpoint))
    }

    /// Drive the run until it pauses, completes, or fails.
    pub async fn run_until_settled(&self, run_id: &str) -> Result<StepResult, WorkflowError> {
        loop {
            match self.step(run_id).await? {
                StepResult::Continue { .. } => continue,
                settled => return Ok(settled),
            }
        }
    }

    /// Latest durable snapshot; partial state of failed runs stays
    /// inspectable through this.
    pub fn latest_checkpoint(&self, run_id: &str) -> Result<Checkpoint, WorkflowError> {
        self.checkpoints.latest(run_id)
    }

    fn slot(&self, run_id: &str) -> Result<Arc<RunSlot>, WorkflowError> {
        if let Some(slot) = self.runs.get(run_id) {
            return Ok(slot.value().clone());
        }

        // No live slot: rebuild one from the checkpoint store so resume works
        // across process restarts.
        let checkpoint = self.checkpoints.latest(run_id)?;
        let report = self.report_from_checkpoint(run_id, &checkpoint);
        let pending = report.pending_interrupt.clone();
        let slot = Arc::new(RunSlot {
            inner: Mutex::new(RunState {
                config: self.config.clone(),
                state: checkpoint.state,
                position: checkpoint.position,
                pending_interrupt: pending,
            }),
            snapshot: RwLock::new(report),
        });
        let entry = self
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| slot);
        Ok(entry.value().clone())
    }

    fn report_from_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> RunReport {
        // The interrupt decision is pure, so the pending request of a paused
        // run can be recomputed instead of persisted.
        let pending = if checkpoint.state.status == RunStatus::AwaitingHuman {
            interrupt::after_stage(
                run_id,
                checkpoint.position.node,
                &checkpoint.state,
                &self.config,
            )
        } else {
            None
        };
        RunReport {
            run_id: run_id.to_string(),
            status: checkpoint.state.status,
            pending_interrupt: pending,
            report: if checkpoint.state.status == RunStatus::Done {
                checkpoint.state.report_draft.clone()
            } else {
                None
            },
            failure: checkpoint.state.failure.clone(),
            iteration_count: checkpoint.state.iteration_count,
        }
    }

    /// Execute one stage invocation with the retry loop. On success the run
    /// state is replaced with the stage's output; on failure it is untouched.
    async fn run_stage(
        &self,
        run_id: &str,
        stage: &dyn Stage,
        run: &mut RunState,
    ) -> StageSignal {
        let base = run.state.clone();
        let mut attempt: u32 = 0;
        let mut backoff_ms = run.config.initial_backoff_ms;

        loop {
            self.metrics.on_stage_start(run_id, stage.name());
            let started = Instant::now();
            let ctx = StageContext {
                run_id,
                config: &run.config,
            };
            let StageOutcome { state, signal } = stage.execute(ctx, base.clone()).await;
            self.metrics
                .on_stage_end(run_id, stage.name(), started.elapsed(), &signal);

            match signal {
                StageSignal::Ok | StageSignal::OkEmpty => {
                    run.state = state;
                    return signal;
                }
                StageSignal::Retryable(reason) if attempt < run.config.max_retries => {
                    attempt += 1;
                    warn!(
                        %run_id,
                        stage = %stage.name(),
                        %reason,
                        attempt,
                        backoff_ms,
                        "stage failed, retrying"
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(run.config.max_backoff_ms);
                }
                terminal => return terminal,
            }
        }
    }

    fn fail_run(
        &self,
        run_id: &str,
        run: &mut RunState,
        stage: StageName,
        kind: FailureKind,
        message: String,
    ) -> StepResult {
        let failure = RunFailure {
            stage,
            kind,
            message,
        };
        error!(%run_id, %failure, "run failed");
        run.state.status = RunStatus::Failed;
        run.state.failure = Some(failure.clone());
        // Terminal checkpoint keeps the partial state inspectable.
        if let Err(err) = self.save_checkpoint(run_id, run) {
            warn!(%run_id, error = %err, "failed to persist terminal checkpoint");
        }
        StepResult::Failed(failure)
    }

    fn advance(&self, run_id: &str, run: &mut RunState) -> StepResult {
        let from = run.position.node;
        run.position.edge_pending = false;

        match next_target(from, &run.state, &run.config) {
            Target::Stage(next) => {
                if from == StageName::Reflection && next == StageName::WebSearch {
                    run.state.iteration_count += 1;
                    // The verdict is consumed by the edge; the new pass
                    // starts with a clean slate.
                    run.state.last_verdict = None;
                    self.metrics.on_loop_back(run_id, run.state.iteration_count);
                    info!(
                        %run_id,
                        iteration = run.state.iteration_count,
                        "loop-back to web search"
                    );
                }
                run.position = GraphPosition::at(next);
                StepResult::Continue {
                    status: run.state.status,
                }
            }
            Target::Done => self.finish(run_id, run),
        }
    }

    fn finish(&self, run_id: &str, run: &mut RunState) -> StepResult {
        run.state.status = RunStatus::Done;
        let report = run
            .state
            .report_draft
            .clone()
            .unwrap_or_else(|| "No report was produced.".to_string());
        if let Err(err) = self.save_checkpoint(run_id, run) {
            warn!(%run_id, error = %err, "failed to persist terminal checkpoint");
        }
        info!(%run_id, iterations = run.state.iteration_count, "run complete");
        StepResult::Done { report }
    }

    fn save_checkpoint(&self, run_id: &str, run: &RunState) -> Result<(), WorkflowError> {
        self.checkpoints
            .save(Checkpoint::new(run_id, run.position, run.state.clone()))
    }

    fn update_snapshot(&self, run_id: &str, slot: &RunSlot, run: &RunState) {
        let report = RunReport {
            run_id: run_id.to_string(),
            status: run.state.status,
            pending_interrupt: run.pending_interrupt.clone(),
            report: if run.state.status == RunStatus::Done {
                run.state.report_draft.clone()
            } else {
                None
            },
            failure: run.state.failure.clone(),
            iteration_count: run.state.iteration_count,
        };
        match slot.snapshot.write() {
            Ok(mut guard) => *guard = report,
            Err(poisoned) => *poisoned.into_inner() = report,
        }
    }
}

fn lock_run<'a>(
    run_id: &str,
    slot: &'a RunSlot,
) -> Result<tokio::sync::MutexGuard<'a, RunState>, WorkflowError> {
    slot.inner.try_lock().map_err(|_| {
        WorkflowError::not_resumable(
            run_id,
            "another step or resume for this run is in flight",
        )
    })
}

fn terminal_result(state: &ResearchState) -> StepResult {
    if state.status == RunStatus::Done {
        StepResult::Done {
            report: state.report_draft.clone().unwrap_or_default(),
        }
    } else {
        StepResult::Failed(state.failure.clone().unwrap_or(RunFailure {
            stage: StageName::Clarification,
            kind: FailureKind::Fatal,
            message: "run failed without a recorded cause".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_empty_and_oversized_queries() {
        let engine = WorkflowEngine::with_stubs();
        assert!(matches!(
            engine.start("   ", None),
            Err(WorkflowError::InvalidQuery(_))
        ));

        let long = "x".repeat(engine.config().max_query_len + 1);
        assert!(matches!(
            engine.start(&long, None),
            Err(WorkflowError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn step_on_unknown_run_errors() {
        let engine = WorkflowEngine::with_stubs();
        assert!(matches!(
            engine.step("no-such-run").await,
            Err(WorkflowError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn first_step_runs_clarification() {
        let engine = WorkflowEngine::with_stubs();
        let handle = engine.start("a question", None).unwrap();

        let result = engine.step(&handle.run_id).await.unwrap();
        assert_eq!(
            result,
            StepResult::Continue {
                status: RunStatus::Clarifying
            }
        );

        let report = engine.status(&handle.run_id).unwrap();
        assert_eq!(report.status, RunStatus::Clarifying);
    }

    #[tokio::test]
    async fn cancel_marks_run_failed_with_cancelled_kind() {
        let engine = WorkflowEngine::with_stubs();
        let handle = engine.start("a question", None).unwrap();
        engine.step(&handle.run_id).await.unwrap();

        engine.cancel(&handle.run_id).await.unwrap();

        let report = engine.status(&handle.run_id).unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.unwrap().kind, FailureKind::Cancelled);

        // Terminal: further steps report the failure without executing.
        let result = engine.step(&handle.run_id).await.unwrap();
        assert!(matches!(result, StepResult::Failed(_)));
    }
}
