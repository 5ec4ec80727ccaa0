//! Sonic worker - serverless talking-head video generation job handler

mod cli;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Commands, LogFormat};
use futures::future::join_all;
use serde_json::Value;
use sonic_foundation::orchestrator::JobOrchestrator;
use sonic_foundation::reference::ReferenceModelLoader;
use sonic_foundation::registry::ModelRegistry;
use sonic_kernel::config::WorkerConfig;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    let config = WorkerConfig::load(cli.config.as_deref())
        .with_context(|| match &cli.config {
            Some(path) => format!("failed to load configuration from {}", path.display()),
            None => "failed to load configuration".to_string(),
        })?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command(cli.command, config))
}

/// Logs go to stderr so stdout carries only job results.
fn init_tracing(format: LogFormat, verbose: bool) {
    let default = if verbose { "sonic=debug" } else { "sonic=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run_command(command: Commands, config: WorkerConfig) -> anyhow::Result<()> {
    match command {
        Commands::Warmup => {
            let registry = registry(&config);
            let bundle = registry.ensure_loaded().await.context("model load failed")?;
            info!(device = %bundle.device, networks = %bundle.describe(), "Warmup complete");
        }

        Commands::Run { input, test_input } => {
            let requests = collect_requests(&input, test_input.as_deref())?;
            if requests.is_empty() {
                bail!("no job requests given");
            }
            run_jobs(&config, requests).await?;
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn registry(config: &WorkerConfig) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(Arc::new(ReferenceModelLoader::new(
        config.clone(),
    ))))
}

/// Requests from files, the inline argument, or stdin lines, in that order
/// of preference.
fn collect_requests(files: &[PathBuf], inline: Option<&str>) -> anyhow::Result<Vec<Value>> {
    let mut requests = Vec::new();
    if let Some(inline) = inline {
        let value = serde_json::from_str(inline).context("invalid --test-input")?;
        push_requests(&mut requests, value);
    } else if !files.is_empty() {
        for path in files {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            push_requests(&mut requests, value);
        }
    } else {
        for line in std::io::stdin().lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(&line).context("invalid request line")?;
            push_requests(&mut requests, value);
        }
    }
    Ok(requests)
}

fn push_requests(out: &mut Vec<Value>, value: Value) {
    match value {
        Value::Array(items) => out.extend(items),
        other => out.push(other),
    }
}

async fn run_jobs(config: &WorkerConfig, requests: Vec<Value>) -> anyhow::Result<()> {
    let registry = registry(config);
    // only a failed model load stops the worker from serving
    let bundle = registry.ensure_loaded().await.context("model load failed")?;
    info!(device = %bundle.device, jobs = requests.len(), "Worker ready");

    let orchestrator = JobOrchestrator::from_config(config, registry)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, withdrawing queued jobs");
                shutdown.cancel();
            }
        });
    }

    let results = join_all(
        requests
            .into_iter()
            .map(|raw| orchestrator.handle_with_cancel(raw, &shutdown)),
    )
    .await;

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let mut stdout = std::io::stdout().lock();
    for result in &results {
        serde_json::to_writer(&mut stdout, result)?;
        writeln!(stdout)?;
    }
    stdout.flush()?;

    let stats = orchestrator.gate_stats();
    info!(
        succeeded,
        failed = results.len() - succeeded,
        admissions = stats.admissions,
        timeouts = stats.timeouts,
        "All jobs finished"
    );
    Ok(())
}
