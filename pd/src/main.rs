//! paperflow daemon entry point

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use paperflow::cli::{Cli, Command};
use paperflow::config::Config;
use paperflow::core::Core;
use paperflow::credits::InMemoryLedger;
use paperflow::papers::{InMemoryPaperStore, PlainTextExtractor};
use paperflow::pipeline::AgentKind;
use paperflow::state::StateManager;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Submit {
            file,
            user,
            stages,
            deadline_ms,
        } => submit(config, file, user, stages, deadline_ms).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let storage = config.storage.clone();
    if let Some(parent) = std::path::Path::new(&storage.path).parent() {
        std::fs::create_dir_all(parent).context("Failed to create storage directory")?;
    }

    let state = StateManager::spawn(
        &storage.path,
        paperstore::StoreConfig {
            memory_cap: storage.memory_cap,
        },
    )?;
    let papers = Arc::new(InMemoryPaperStore::new());
    let credits = Arc::new(InMemoryLedger::new());
    let core = Core::from_config(config, state, papers, Arc::new(PlainTextExtractor), credits)?;

    info!("paperflow running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let metrics = core.metrics();
    println!(
        "submitted={} completed={} failed={} fallbacks={}",
        metrics.submitted, metrics.completed, metrics.failed, metrics.fallbacks_used
    );
    Ok(())
}

async fn submit(
    config: Config,
    file: std::path::PathBuf,
    user: String,
    stages: Vec<String>,
    deadline_ms: Option<u64>,
) -> Result<()> {
    let stages = if stages.is_empty() {
        AgentKind::all().to_vec()
    } else {
        stages
            .iter()
            .map(|name| AgentKind::parse(name).ok_or_else(|| eyre::eyre!("unknown stage: {name}")))
            .collect::<Result<Vec<_>>>()?
    };

    let bytes = std::fs::read(&file).context(format!("Failed to read {}", file.display()))?;
    let paper_id = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "paper".to_string());

    let papers = Arc::new(InMemoryPaperStore::new());
    papers.put_paper(&paper_id, bytes);

    let state = StateManager::spawn_in_memory()?;
    let credits = Arc::new(InMemoryLedger::new());
    let core = Core::from_config(config, state, papers, Arc::new(PlainTextExtractor), credits)?;

    let deadline = deadline_ms.map(std::time::Duration::from_millis);
    let request_id = core
        .submit_pipeline(&user, &paper_id, stages, deadline)
        .await
        .map_err(|e| eyre::eyre!("{e}"))?;

    info!(%request_id, "Pipeline submitted");

    let mut progress = core
        .subscribe_progress(&request_id)
        .ok_or_else(|| eyre::eyre!("request vanished"))?;
    let printer = tokio::spawn(async move {
        while let Some(event) = progress.recv().await {
            println!(
                "{:<20} {:?}{}",
                event.stage.to_string(),
                event.status,
                if event.used_fallback { " (fallback)" } else { "" }
            );
        }
    });

    let result = core
        .wait_for(&request_id)
        .await
        .ok_or_else(|| eyre::eyre!("pipeline produced no result"))?;
    printer.abort();

    println!();
    for (kind, outcome) in &result.stages {
        match &outcome.error {
            None => println!("{kind}: ok ({} ms)", outcome.elapsed_ms),
            Some(error) => println!("{kind}: FAILED - {error}"),
        }
    }
    println!("\nsuccess: {}", result.success);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
