//! Passive observability of engine activity.
//!
//! The collector is fire-and-forget: it never blocks the engine and a failure
//! here never fails a run. Events go out on an unbounded channel for
//! consumers that want them, and aggregate instruments are recorded through
//! the global OTEL meter (no-ops when no provider is installed).

use std::time::Duration;

use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::graph::StageName;
use crate::stage::StageSignal;

struct EngineInstruments {
    stage_runs: Counter<u64>,
    stage_duration_ms: Histogram<f64>,
    loop_backs: Counter<u64>,
}

static INSTRUMENTS: OnceCell<EngineInstruments> = OnceCell::new();

fn instruments() -> &'static EngineInstruments {
    INSTRUMENTS.get_or_init(|| {
        let meter: Meter = global::meter("researchgraph.engine");
        EngineInstruments {
            stage_runs: meter
                .u64_counter("stage_runs_total")
                .with_description("Stage invocations by stage and signal")
                .init(),
            stage_duration_ms: meter
                .f64_histogram("stage_duration_ms")
                .with_description("Stage runtime in milliseconds")
                .init(),
            loop_backs: meter
                .u64_counter("loop_backs_total")
                .with_description("Reflection loop-back edges fired")
                .init(),
        }
    })
}

/// Engine lifecycle events, also useful for audit trails and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StageStart {
        run_id: String,
        stage: StageName,
    },
    StageEnd {
        run_id: String,
        stage: StageName,
        duration_ms: u64,
        signal: String,
    },
    LoopBack {
        run_id: String,
        iteration_count: u32,
    },
}

/// Read-only consumer of engine events.
#[derive(Clone)]
pub struct MetricsCollector {
    sender: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl MetricsCollector {
    /// Collector with an event stream attached.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// OTEL-only collector without an event stream.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(sender) = &self.sender {
            if let Err(err) = sender.send(event) {
                tracing::warn!(error = %err, "failed to emit engine event");
            }
        }
    }

    pub fn on_stage_start(&self, run_id: &str, stage: StageName) {
        self.emit(EngineEvent::StageStart {
            run_id: run_id.to_string(),
            stage,
        });
    }

    pub fn on_stage_end(
        &self,
        run_id: &str,
        stage: StageName,
        duration: Duration,
        signal: &StageSignal,
    ) {
        let duration_ms = duration.as_millis() as u64;
        let handles = instruments();
        let attrs = [
            KeyValue::new("stage", stage.as_str()),
            KeyValue::new("signal", signal.label()),
        ];
        handles.stage_runs.add(1, &attrs);
        handles.stage_duration_ms.record(duration_ms as f64, &attrs);

        self.emit(EngineEvent::StageEnd {
            run_id: run_id.to_string(),
            stage,
            duration_ms,
            signal: signal.label().to_string(),
        });
    }

    pub fn on_loop_back(&self, run_id: &str, iteration_count: u32) {
        instruments()
            .loop_backs
            .add(1, &[KeyValue::new("iteration", iteration_count as i64)]);
        self.emit(EngineEvent::LoopBack {
            run_id: run_id.to_string(),
            iteration_count,
        });
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::disabled()
    }
}
