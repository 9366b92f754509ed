//! Process-wide tracing setup shared by the CLI and API binaries.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::error::WorkflowError;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Subscriber settings. `RUST_LOG` always wins; `default_directives` applies
/// when it is unset.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub default_directives: String,
    pub with_ansi: bool,
    pub with_target: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            default_directives: "info,researchgraph_core=info".to_string(),
            with_ansi: true,
            with_target: false,
        }
    }
}

/// Install the global tracing subscriber. Only the first call in a process
/// does anything; later calls return Ok without touching the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), WorkflowError> {
    if INSTALLED.set(()).is_err() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_directives));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(options.with_ansi)
        .with_target(options.with_target)
        .try_init()
        .map_err(|err| {
            WorkflowError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })
}
