//! Launchpad server binary.
//!
//! Serves `GET|POST /deploy`, which takes a repository URL through ingest,
//! build and delivery and answers with the public URL.

use std::sync::Arc;

use clap::Parser;
use launchpad_core::serve::serve_tcp;
use launchpad_core::TokioProcessRunner;
use launchpad_server::api::{self, AppState};
use launchpad_server::{LaunchpadConfig, Pipeline};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Launchpad deployment server.
#[derive(Parser, Debug)]
#[command(name = "launchpad")]
#[command(about = "Deploy a repository as a public static site")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE", env = "LAUNCHPAD_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug,hyper=info,tower=info"
    } else {
        "launchpad_server=info,launchpad_ingest=info,launchpad_build=info,launchpad_deliver=info,launchpad_core=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("launchpad server starting");

    let config = LaunchpadConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        LaunchpadConfig::default()
    });

    info!(
        listen = %config.server.listen,
        bucket = %config.storage.bucket,
        remote_ingest = config.ingest.url.is_some(),
        remote_build = config.build.url.is_some(),
        site = %config.deliver.site_addr,
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    let pipeline = Pipeline::from_config(
        &config,
        Arc::new(TokioProcessRunner::new()),
        cancel.clone(),
    )?;

    let app = api::router(
        Arc::new(AppState {
            orchestrator: Arc::clone(&pipeline.orchestrator),
        }),
        &config.server.cors_origins,
    );

    serve_tcp(config.server.listen, app, cancel).await?;

    pipeline.shutdown().await;
    info!("launchpad server shutdown complete");
    Ok(())
}
