// Ingest service entry point.
use anyhow::{Context, Result};
use clap::Parser;
use ingest::config::IngestConfig;
use ingest::observability;
use ingest::server::IngestServer;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fleetline-ingest", about = "Fleet telemetry ingestion server")]
struct Cli {
    /// Path to the YAML configuration document.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = IngestConfig::load(&cli.config)?;

    let metrics_handle = observability::init(&config.monitoring);
    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics endpoint exited");
        }
    });

    let server = IngestServer::start(config)
        .await
        .context("start ingestion server")?;

    // Block until SIGINT, then drain.
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    server.shutdown().await;
    Ok(())
}
