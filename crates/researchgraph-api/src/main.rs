use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use researchgraph_core::{
    init_telemetry, ConfigLoader, HumanInput, JsonFileCheckpointStore, RunReport, StepResult,
    TelemetryOptions, WorkflowEngine, WorkflowError,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    signal,
    sync::{Semaphore, TryAcquireError},
};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    engine: Arc<WorkflowEngine>,
    run_permits: Arc<Semaphore>,
    max_runs: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryOptions::default())?;

    let addr: SocketAddr = std::env::var("RESEARCHGRAPH_API_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid RESEARCHGRAPH_API_ADDR: {err}"))?;

    let checkpoint_dir = std::env::var("RESEARCHGRAPH_CHECKPOINT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/checkpoints"));

    let run_limit = std::env::var("RESEARCHGRAPH_MAX_CONCURRENT_RUNS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(5);

    let config = ConfigLoader::load(None)?;
    let engine = WorkflowEngine::builder()
        .config(config)
        .checkpoints(Arc::new(JsonFileCheckpointStore::new(checkpoint_dir)))
        .build()?;

    let state = AppState {
        engine: Arc::new(engine),
        run_permits: Arc::new(Semaphore::new(run_limit)),
        max_runs: run_limit,
    };

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/runs", post(handle_create_run))
        .route("/runs/:id", get(handle_run_status))
        .route("/runs/:id/resume", post(handle_resume))
        .with_state(state);

    info!("research API listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install signal handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<WorkflowError> for AppError {
    fn from(error: WorkflowError) -> Self {
        let status = match &error {
            WorkflowError::InvalidQuery(_) | WorkflowError::InvalidConfiguration(_) => {
                StatusCode::BAD_REQUEST
            }
            WorkflowError::UnknownRun(_) => StatusCode::NOT_FOUND,
            WorkflowError::NotResumable { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

fn acquire_run_permit(state: &AppState) -> ApiResult<tokio::sync::OwnedSemaphorePermit> {
    match state.run_permits.clone().try_acquire_owned() {
        Ok(permit) => Ok(permit),
        Err(TryAcquireError::NoPermits) => Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "run capacity reached; retry once a slot frees up",
        )),
        Err(TryAcquireError::Closed) => Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "run executor unavailable",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: String,
    status: researchgraph_core::RunStatus,
}

#[derive(Debug, Serialize)]
struct CapacityReport {
    max_runs: usize,
    available_runs: usize,
    active_runs: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    capacity: CapacityReport,
}

fn capacity_report(state: &AppState) -> CapacityReport {
    let available = state.run_permits.available_permits();
    CapacityReport {
        max_runs: state.max_runs,
        available_runs: available,
        active_runs: state.max_runs.saturating_sub(available),
    }
}

async fn handle_health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "ok",
        capacity: capacity_report(&state),
    }))
}

/// Start a run and drive it in the background until it pauses or settles.
/// The permit is held for the lifetime of the drive, bounding concurrency.
async fn handle_create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let permit = acquire_run_permit(&state)?;
    let handle = state.engine.start(&request.query, None)?;

    let engine = state.engine.clone();
    let run_id = handle.run_id.clone();
    tokio::spawn(async move {
        let _permit = permit;
        match engine.run_until_settled(&run_id).await {
            Ok(StepResult::Paused(request)) => {
                info!(%run_id, kind = ?request.kind(), "run paused for human input");
            }
            Ok(StepResult::Done { .. }) => info!(%run_id, "run complete"),
            Ok(StepResult::Failed(failure)) => warn!(%run_id, %failure, "run failed"),
            Ok(StepResult::Continue { .. }) => {}
            Err(err) => warn!(%run_id, error = %err, "run driver errored"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id: handle.run_id,
            status: handle.status,
        }),
    ))
}

async fn handle_run_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunReport>> {
    let report = state.engine.status(&run_id)?;
    Ok(Json(report))
}

async fn handle_resume(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(input): Json<HumanInput>,
) -> ApiResult<Json<StepResult>> {
    let permit = acquire_run_permit(&state)?;
    let result = state.engine.resume(&run_id, input).await?;

    // A resumed run that can still make progress is driven in the background,
    // same as a fresh one.
    if matches!(result, StepResult::Continue { .. }) {
        let engine = state.engine.clone();
        let driver_run_id = run_id.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match engine.run_until_settled(&driver_run_id).await {
                Ok(StepResult::Paused(request)) => {
                    info!(run_id = %driver_run_id, kind = ?request.kind(), "run paused for human input");
                }
                Ok(StepResult::Done { .. }) => info!(run_id = %driver_run_id, "run complete"),
                Ok(StepResult::Failed(failure)) => {
                    warn!(run_id = %driver_run_id, %failure, "run failed");
                }
                Ok(StepResult::Continue { .. }) => {}
                Err(err) => warn!(run_id = %driver_run_id, error = %err, "run driver errored"),
            }
        });
    }

    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(limit: usize) -> AppState {
        AppState {
            engine: Arc::new(WorkflowEngine::with_stubs()),
            run_permits: Arc::new(Semaphore::new(limit)),
            max_runs: limit,
        }
    }

    #[test]
    fn capacity_limit_returns_429() {
        let state = test_state(1);

        let permit = acquire_run_permit(&state).expect("first permit should succeed");
        let err = acquire_run_permit(&state).expect_err("second permit should fail");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        drop(permit);
    }

    #[test]
    fn workflow_errors_map_to_http_statuses() {
        let bad = AppError::from(WorkflowError::InvalidQuery("empty".into()));
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let missing = AppError::from(WorkflowError::UnknownRun("r".into()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let busy = AppError::from(WorkflowError::not_resumable("r", "in flight"));
        assert_eq!(busy.status, StatusCode::CONFLICT);
    }
}
