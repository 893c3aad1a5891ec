//! Launchpad ingest service binary.
//!
//! Exposes `POST /upload`, which clones a repository and stores its source
//! archive.

use std::sync::Arc;

use launchpad_core::serve::serve_tcp;
use launchpad_core::{ObjectArtifactStore, TokioProcessRunner};
use launchpad_ingest::{api, stage_from_config, ServiceConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("launchpad_ingest=info".parse()?),
        )
        .init();

    info!("launchpad ingest service starting");

    let config_path = std::env::var("INGEST_CONFIG").ok();
    let config = ServiceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ServiceConfig::default()
    });

    info!(
        listen = %config.server.listen,
        bucket = %config.storage.bucket,
        "configuration loaded"
    );

    let store = Arc::new(ObjectArtifactStore::new(config.storage.clone()));
    let stage = stage_from_config(
        &config.ingest,
        &config.storage,
        &config.workspace,
        store,
        Arc::new(TokioProcessRunner::new()),
    )?;

    let app = api::router(Arc::new(api::AppState {
        stage: Arc::new(stage),
    }));

    serve_tcp(config.server.listen, app, CancellationToken::new()).await?;

    info!("ingest service shutdown complete");
    Ok(())
}
