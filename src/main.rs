mod catalogue;
mod cli;
mod config;
mod connectivity;
mod embedding;
mod error;
mod handler;
mod llm;
mod messages;
#[cfg(test)]
mod pipeline_tests;
mod prompts;
mod ranking;
mod retrieval;
mod router;
mod server;
mod state;
mod tools;
mod tracker;
mod trim;

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Load ~/.env into the process environment (once, before any
    // concurrent work).
    config::load_dotenv();

    match cli.command.unwrap_or(cli::Command::Serve { listen: None }) {
        cli::Command::Serve { listen } => serve(&cli.config_dir, listen).await,
        cli::Command::CheckConfig => check_config(&cli.config_dir),
        cli::Command::CheckConnectivity => {
            let config = Arc::new(config::Config::load(&cli.config_dir)?);
            connectivity::run(&config).await
        }
    }
}

async fn serve(config_dir: &Path, listen_override: Option<String>) -> Result<()> {
    let config = Arc::new(config::Config::load(config_dir)?);

    let filter = EnvFilter::try_new(&config.gateway.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_dir = %config_dir.display(),
        endpoints = config.retrieval.endpoints.len(),
        "nlgate starting"
    );

    let catalogue = Arc::new(catalogue::ToolCatalogue::load(&config.tools_path())?);
    let llm: Arc<dyn llm::AskLlm> = Arc::new(llm::LlmClient::new(&config.llm)?);
    let embedder: Arc<dyn embedding::Embed> =
        Arc::new(embedding::EmbeddingClient::new(&config.embedding)?);
    let retriever = Arc::new(retrieval::UnifiedRetriever::new(&config, embedder));

    let app = server::AppContext {
        config: Arc::clone(&config),
        llm,
        retriever,
        catalogue,
        tracker: Arc::new(tracker::QueryTracker::new()),
        start_time: Instant::now(),
    };

    // Shutdown on SIGTERM/SIGINT; the server drains via graceful
    // shutdown.
    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.notify_waiters();
        });
    }

    let listen = listen_override.unwrap_or_else(|| config.server.listen.clone());
    server::start(app, &listen, shutdown).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

fn check_config(config_dir: &Path) -> Result<()> {
    let config = config::Config::load(config_dir)?;
    let catalogue = catalogue::ToolCatalogue::load(&config.tools_path())?;

    let enabled: Vec<&String> = config
        .retrieval
        .endpoints
        .iter()
        .filter(|(_, e)| e.enabled)
        .map(|(name, _)| name)
        .collect();
    println!("configuration ok");
    println!("  llm endpoint:        {}", config.llm.endpoint);
    println!(
        "  models:              high={} low={}",
        config.llm.models.high, config.llm.models.low
    );
    println!("  retrieval endpoints: {enabled:?}");
    println!(
        "  write endpoint:      {}",
        config.retrieval.write_endpoint.as_deref().unwrap_or("(none)")
    );
    println!(
        "  tool catalogue:      {}",
        if catalogue.is_empty() {
            "empty (search only)"
        } else {
            "loaded"
        }
    );
    Ok(())
}
