use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use researchgraph_core::{
    init_telemetry, ConfigLoader, HumanInput, JsonFileCheckpointStore, StepResult,
    TelemetryOptions, WorkflowEngine,
};
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "researchgraph-cli",
    version,
    about = "Research workflow engine, offline stub edition"
)]
struct Cli {
    /// Path to a TOML workflow configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for durable run checkpoints.
    #[arg(long, global = true, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a research run and drive it until it pauses or completes.
    Run(RunArgs),
    /// Resume a paused run with human input.
    Resume(ResumeArgs),
    /// Show the current state of a run.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Question to research.
    #[arg(long)]
    query: String,

    /// Disable every human review pause for this run.
    #[arg(long, default_value_t = false)]
    unattended: bool,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    /// Run ID to resume (must have a checkpoint).
    #[arg(long)]
    run: String,

    /// Human input as JSON, e.g.
    /// `{"kind":"source_approval","approved_urls":["https://..."]}`.
    #[arg(long)]
    input: String,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Run ID to inspect.
    #[arg(long)]
    run: String,
}

fn main() -> Result<()> {
    init_telemetry(TelemetryOptions::default())?;

    let cli = Cli::parse();
    let engine = build_engine(&cli)?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(&engine, args).await?,
            Command::Resume(args) => resume_command(&engine, args).await?,
            Command::Status(args) => status_command(&engine, args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn build_engine(cli: &Cli) -> Result<WorkflowEngine> {
    let mut config = ConfigLoader::load(cli.config.clone())?;
    if let Command::Run(args) = &cli.command {
        if args.unattended {
            config.review_sources = false;
            config.review_report = false;
            config.review_search_plan = false;
            config.confirm_iterations = false;
        }
    }

    let engine = WorkflowEngine::builder()
        .config(config)
        .checkpoints(Arc::new(JsonFileCheckpointStore::new(
            cli.checkpoint_dir.clone(),
        )))
        .build()?;
    Ok(engine)
}

async fn run_command(engine: &WorkflowEngine, args: RunArgs) -> Result<()> {
    info!(query = %args.query, "starting research run");

    let handle = engine.start(&args.query, None)?;
    let result = engine.run_until_settled(&handle.run_id).await?;
    print_result(&handle.run_id, &result)?;
    Ok(())
}

async fn resume_command(engine: &WorkflowEngine, args: ResumeArgs) -> Result<()> {
    let input: HumanInput =
        serde_json::from_str(&args.input).context("input is not valid human-input JSON")?;

    info!(run = %args.run, "resuming research run");
    let result = engine.resume(&args.run, input).await?;
    let result = match result {
        StepResult::Continue { .. } => engine.run_until_settled(&args.run).await?,
        settled => settled,
    };
    print_result(&args.run, &result)?;
    Ok(())
}

fn status_command(engine: &WorkflowEngine, args: StatusArgs) -> Result<()> {
    let report = engine.status(&args.run)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_result(run_id: &str, result: &StepResult) -> Result<()> {
    match result {
        StepResult::Done { report } => {
            println!("{report}");
        }
        StepResult::Paused(request) => {
            eprintln!(
                "Run {run_id} is paused ({:?}). Resume with:\n  researchgraph-cli resume --run {run_id} --input '<json>'",
                request.kind()
            );
            println!("{}", serde_json::to_string_pretty(request)?);
        }
        StepResult::Failed(failure) => {
            anyhow::bail!("run {run_id} failed at {}: {}", failure.stage, failure.message);
        }
        StepResult::Continue { status } => {
            println!("run {run_id} is {status:?}");
        }
    }
    Ok(())
}
