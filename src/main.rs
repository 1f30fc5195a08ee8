use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{info, warn};

use batch_runner::command::{CommandHandler, CommandJob, CommandOutput, load_jobs};
use batch_runner::config::RunnerConfig;
use batch_runner::runner::{RunnerEvent, TaskRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON summary
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: batch-runner <jobs.json>");
        eprintln!("  jobs.json: [{{\"name\": \"...\", \"command\": \"...\"}}, ...]");
        std::process::exit(2);
    });

    let config = RunnerConfig::from_env().context("Invalid BATCH_RUNNER_* configuration")?;
    let jobs = load_jobs(Path::new(&path)).with_context(|| format!("Cannot load {path}"))?;

    eprintln!("⚙️  batch-runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Jobs: {} ({})", jobs.len(), path);
    eprintln!("   Batch limit: {}", config.batch_limit);
    if let Some(timeout) = config.task_timeout {
        eprintln!("   Task timeout: {}s", timeout.as_secs());
    }

    let runner = TaskRunner::<CommandJob, CommandOutput>::builder()
        .config(config)
        .tasks(jobs)
        .with_handler(Arc::new(CommandHandler::new()))
        .build()?;

    let mut events = runner.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunnerEvent::TaskStarted { task_id, .. }) => {
                    info!(task_id = %task_id, "Job started");
                }
                Ok(RunnerEvent::TaskFinished {
                    task_id, status, ..
                }) => {
                    info!(task_id = %task_id, %status, "Job finished");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let canceller = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling run");
            canceller.cancel();
        }
    });

    let summary = runner.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
