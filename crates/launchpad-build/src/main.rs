//! Launchpad build service binary.
//!
//! Exposes `POST /build`, which compiles stored source (or a starter
//! template) and stores the packaged output.

use std::sync::Arc;

use launchpad_build::{api, stage_from_config, ServiceConfig};
use launchpad_core::serve::serve_tcp;
use launchpad_core::{ObjectArtifactStore, TokioProcessRunner};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("launchpad_build=info".parse()?),
        )
        .init();

    info!("launchpad build service starting");

    let config_path = std::env::var("BUILD_CONFIG").ok();
    let config = ServiceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ServiceConfig::default()
    });

    info!(
        listen = %config.server.listen,
        bucket = %config.storage.bucket,
        auto_template = config.build.auto_template,
        lock_scope = ?config.build.lock_scope,
        "configuration loaded"
    );

    let store = Arc::new(ObjectArtifactStore::new(config.storage.clone()));
    let stage = stage_from_config(
        &config.build,
        &config.storage,
        &config.workspace,
        store,
        Arc::new(TokioProcessRunner::new()),
    )?;

    let app = api::router(Arc::new(api::AppState {
        stage: Arc::new(stage),
        default_template: config.build.default_template,
    }));

    serve_tcp(config.server.listen, app, CancellationToken::new()).await?;

    info!("build service shutdown complete");
    Ok(())
}
