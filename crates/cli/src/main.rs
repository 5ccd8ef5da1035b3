use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::{ExecutionMode, ParameterDocument, Settings};

mod catalog;
mod config;

use config::{AppState, PipelineDefinition};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Lineage-tracked ML pipeline runner", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "strata.toml", env = "STRATA_CONFIG")]
    config: PathBuf,

    /// Data directory for storage, overriding the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Pipeline definition
    #[arg(short, long, default_value = "pipeline.toml")]
    pipeline: PathBuf,

    /// Parameter document, overriding the configuration
    #[arg(long)]
    params: Option<PathBuf>,

    /// Dispatch steps through execution queues
    #[arg(long)]
    remote: bool,

    /// Write derived parameter values back to the parameter document
    #[arg(long)]
    persist_params: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=info,strata_core=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    // Load configuration
    let mut settings = Settings::load(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        settings.storage.data_dir = data_dir;
    }
    if let Some(params_path) = args.params {
        settings.params_path = params_path;
    }

    tracing::info!("Data directory: {}", settings.storage.data_dir.display());

    let params = ParameterDocument::load(&settings.params_path)?;
    let definition = PipelineDefinition::load(&args.pipeline)?;
    let pipeline = catalog::build_pipeline(&definition, &settings)?;

    let state = AppState::new(settings, params, &definition.queue_names())?;

    let cancel = state.orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, no further steps will start");
            cancel.cancel();
        }
    });

    let mode = if args.remote {
        ExecutionMode::Remote
    } else {
        ExecutionMode::Local
    };
    let run = state.orchestrator.run(&pipeline, mode).await;

    // Run logs are written out whether or not the pipeline could finish
    let flushed = state
        .event_log
        .flush_all()
        .await
        .context("Failed to flush event log");
    let report = run?;
    flushed?;

    for outcome in &report.outcomes {
        let outputs = outcome
            .outputs
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let status = outcome.state.to_string();
        match &outcome.error {
            Some(error) => println!("{:<24} {:<12} {}", outcome.step_name, status, error),
            None => println!("{:<24} {:<12} {}", outcome.step_name, status, outputs),
        }
    }

    if args.persist_params {
        let params_path = &state.settings.params_path;
        state.params.read().await.save(params_path)?;
        tracing::info!("Saved parameters to {}", params_path.display());
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
