//! Build stage of the launchpad pipeline.
//!
//! Turns a stored source archive, or a freshly scaffolded starter template,
//! into a stored build archive `<name>-build.zip`. Builds of the same
//! repository are serialised through [`BuildLocks`].

pub mod api;
pub mod config;
pub mod lock;
pub mod stage;
pub mod template;

use std::sync::Arc;

use launchpad_core::config::WorkspaceConfig;
use launchpad_core::{
    ArtifactStore, PipelineResult, ProcessRunner, Scratch, StorageConfig, Toolchain,
};

pub use config::{BuildConfig, ServiceConfig};
pub use lock::{BuildLocks, BuildPermit, LockScope};
pub use stage::{BuildPhase, BuildSettings, BuildStage};
pub use template::Scaffolder;

/// Assemble a build stage from configuration.
pub fn stage_from_config(
    config: &BuildConfig,
    storage: &StorageConfig,
    workspace: &WorkspaceConfig,
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn ProcessRunner>,
) -> PipelineResult<BuildStage> {
    let toolchain = Toolchain::new(runner, config.toolchain.clone())?;
    let scratch = Scratch::new(workspace.root.join("build"))?;

    Ok(BuildStage::new(
        store,
        toolchain,
        BuildLocks::new(config.lock_scope),
        scratch,
        BuildSettings {
            bucket: storage.bucket.clone(),
            auto_template: config.auto_template,
            scaffold_exclude: config.scaffold_exclude.clone(),
        },
    ))
}
