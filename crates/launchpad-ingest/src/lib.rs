//! Ingest stage of the launchpad pipeline.
//!
//! Turns a repository URL into a stored source archive, `<name>.zip`:
//! validate the URL, shallow-clone into a private scratch directory, pack the
//! tree without `.git`, upload, and clean up.

pub mod api;
pub mod config;
pub mod fetch;
pub mod stage;

use std::sync::Arc;

use launchpad_core::config::WorkspaceConfig;
use launchpad_core::{ArtifactStore, PipelineResult, ProcessRunner, Scratch, StorageConfig};

pub use config::{IngestConfig, ServiceConfig};
pub use fetch::{GitFetcher, SourceFetcher};
pub use stage::{IngestReceipt, IngestSettings, IngestStage};

/// Assemble an ingest stage from configuration.
pub fn stage_from_config(
    config: &IngestConfig,
    storage: &StorageConfig,
    workspace: &WorkspaceConfig,
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn ProcessRunner>,
) -> PipelineResult<IngestStage> {
    let fetcher = GitFetcher::new(runner)
        .with_program(&config.git_program)
        .with_token(config.token.clone())
        .with_timeout(config.clone_timeout());
    let scratch = Scratch::new(workspace.root.join("ingest"))?;

    Ok(IngestStage::new(
        Arc::new(fetcher),
        store,
        scratch,
        IngestSettings {
            bucket: storage.bucket.clone(),
            allowed_hosts: config.allowed_hosts.clone(),
            exclude: config.exclude.clone(),
        },
    ))
}
