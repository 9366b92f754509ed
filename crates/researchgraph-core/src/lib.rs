//! Workflow orchestration core for the multi-agent research pipeline.
//!
//! This crate provides the graph engine that drives a research query through
//! clarification, web search, document analysis, synthesis, and reflection,
//! with human-in-the-loop suspension, durable checkpoints, and a bounded
//! reflection loop. Stage reasoning itself is delegated to external
//! collaborators behind narrow traits.

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod metrics;
pub mod stage;
pub mod stages;
pub mod state;
pub mod telemetry;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use collaborators::{
    Collaborators, GenerationConstraints, GenerationError, InMemoryVectorStore, SearchHit,
    SearchProvider, StubGenerator, StubSearch, TextGenerator, VectorStore,
};
pub use config::{ConfigLoader, WorkflowConfig};
pub use engine::{EngineBuilder, RunHandle, RunReport, StepResult, WorkflowEngine};
pub use error::{FailureKind, RunFailure, WorkflowError};
pub use graph::{EdgePredicate, GraphPosition, StageName, Target, Transition, TRANSITIONS};
pub use interrupt::{HumanInput, InterruptKind, InterruptPayload, InterruptRequest, SourceSummary};
pub use metrics::{EngineEvent, MetricsCollector};
pub use stage::{Stage, StageContext, StageOutcome, StageSignal};
pub use state::{
    ChunkRecord, FetchStatus, ReflectionVerdict, ResearchState, RunStatus, SourceKind,
    SourceRecord,
};
pub use telemetry::{init_telemetry, TelemetryOptions};
