//! Delivery stage of the launchpad pipeline.
//!
//! Serves a stored build archive as a static site with single-page-app
//! fallback and exposes the site port through a public tunnel.
//!
//! The site server and the tunnel outlive the delivery call that started
//! them. A later delivery reuses both: the listener stays bound, the serving
//! root is swapped and the previous deployment is deleted.

pub mod clock;
pub mod config;
pub mod site;
pub mod stage;
pub mod tunnel;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use launchpad_core::config::WorkspaceConfig;
use launchpad_core::{ArtifactStore, PipelineResult, ProcessRunner, Scratch, StorageConfig, Toolchain};
use tokio_util::sync::CancellationToken;

pub use clock::{Clock, TokioClock};
pub use config::DeliveryConfig;
pub use site::{resolve_serving_root, ServingRoot, SiteHost};
pub use stage::{DeliveryOutcome, DeliveryStage};
pub use tunnel::{NgrokDiscovery, TunnelConfig, TunnelDescriptor, TunnelDiscovery, TunnelManager};

/// Assemble a delivery stage from configuration.
///
/// The site server stops when `cancel` fires.
pub fn stage_from_config(
    config: &DeliveryConfig,
    storage: &StorageConfig,
    workspace: &WorkspaceConfig,
    store: Arc<dyn ArtifactStore>,
    runner: Arc<dyn ProcessRunner>,
    cancel: CancellationToken,
) -> PipelineResult<DeliveryStage> {
    let discovery = NgrokDiscovery::new(&config.tunnel.discovery_url)?;
    let tunnels = TunnelManager::new(
        Arc::clone(&runner),
        Arc::new(discovery),
        Arc::new(TokioClock),
        config.tunnel.clone(),
    );
    let toolchain = Toolchain::new(runner, config.toolchain.clone())?;

    Ok(DeliveryStage::new(
        store,
        toolchain,
        SiteHost::new(config.site_addr, cancel),
        tunnels,
        Scratch::new(workspace.root.join("deliver"))?,
        Scratch::new(config.deploy_root.clone())?,
        storage.bucket.clone(),
    ))
}
