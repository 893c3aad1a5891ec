//! The delivery stage.
//!
//! Downloads `<name>-build.zip`, extracts it into its own deployment
//! directory, publishes it on the site host and makes the site port public.
//! Deliveries run one at a time, so the newest call always owns the site.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use launchpad_core::archive::unpack_archive;
use launchpad_core::{
    ArtifactKey, ArtifactStore, PipelineError, PipelineResult, RepositoryName, Scratch, ScopedPath,
    Toolchain,
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::site::{resolve_serving_root, ServingRoot, SiteHost};
use crate::tunnel::TunnelManager;

/// Result of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Repository delivered.
    pub repository: RepositoryName,
    /// Public address of the site.
    pub public_url: String,
    /// Local address of the site server.
    pub local_addr: SocketAddr,
    /// Directory being served.
    pub serving_root: PathBuf,
    /// Problems that did not stop the delivery.
    pub warnings: Vec<String>,
}

enum Rebuild {
    NotNeeded,
    Built(PathBuf),
    Failed(String),
}

/// Serves build archives and exposes them publicly.
pub struct DeliveryStage {
    store: Arc<dyn ArtifactStore>,
    toolchain: Toolchain,
    site: SiteHost,
    tunnels: TunnelManager,
    downloads: Scratch,
    deployments: Scratch,
    bucket: String,
    serial: Mutex<()>,
}

impl DeliveryStage {
    /// Create the stage.
    ///
    /// Archives are downloaded under `downloads` and extracted under
    /// `deployments`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        toolchain: Toolchain,
        site: SiteHost,
        tunnels: TunnelManager,
        downloads: Scratch,
        deployments: Scratch,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            toolchain,
            site,
            tunnels,
            downloads,
            deployments,
            bucket: bucket.into(),
            serial: Mutex::new(()),
        }
    }

    /// The site host.
    #[must_use]
    pub fn site(&self) -> &SiteHost {
        &self.site
    }

    /// Deliver the stored build of `name`.
    #[instrument(skip(self), fields(repo = %name))]
    pub async fn deliver(&self, name: &RepositoryName) -> PipelineResult<DeliveryOutcome> {
        let _serial = self.serial.lock().await;
        let key = ArtifactKey::build(&self.bucket, name);
        let id = Uuid::new_v4().simple().to_string();
        let mut warnings = Vec::new();

        let download = self.downloads.file(format!("{name}-{id}.zip"))?;
        let unpacked = self
            .unpack_build(&key, download.path(), format!("{name}-{id}"))
            .await;
        download.cleanup().await;
        let deployment = unpacked?;

        let search = match self.rebuild_if_needed(deployment.path()).await {
            Rebuild::NotNeeded => deployment.path().to_path_buf(),
            Rebuild::Built(output) => output,
            Rebuild::Failed(warning) => {
                warnings.push(warning);
                deployment.path().to_path_buf()
            }
        };

        let mut serving = tokio::task::spawn_blocking(move || resolve_serving_root(&search))
            .await
            .map_err(|e| PipelineError::Internal(format!("serving root search failed: {e}")))??;
        serving.tree = deployment.path().to_path_buf();
        if serving.index.is_none() {
            warn!("no entry point found, serving without fallback");
            warnings.push("no index.html found; unmatched paths return 404".to_owned());
        }

        let serving_root = serving.root.clone();
        let (local_addr, previous) = self.site.publish(serving).await?;
        let _ = deployment.persist();
        if let Some(previous) = previous {
            retire(&previous).await;
        }

        let tunnel = self.tunnels.expose(local_addr.port()).await?;

        info!(url = %tunnel.public_url, addr = %local_addr, "site delivered");
        Ok(DeliveryOutcome {
            repository: name.clone(),
            public_url: tunnel.public_url,
            local_addr,
            serving_root,
            warnings,
        })
    }

    /// Download the build archive to `download` and extract it into a fresh
    /// deployment directory.
    async fn unpack_build(
        &self,
        key: &ArtifactKey,
        download: &Path,
        dir: String,
    ) -> PipelineResult<ScopedPath> {
        let size = self.store.get(key, download).await?;
        if size == 0 {
            return Err(PipelineError::transfer(
                key.object.clone(),
                "downloaded build archive is empty",
            ));
        }

        let deployment = self.deployments.fresh_dir(dir).await?;
        match unpack_archive(download, deployment.path()).await {
            Ok(entries) => {
                info!(entries, dir = %deployment.path().display(), "build archive extracted");
                Ok(deployment)
            }
            Err(e) => {
                deployment.cleanup().await;
                Err(e)
            }
        }
    }

    /// Build a deployment that still holds an unbuilt project.
    ///
    /// Failure is reported as a warning and the files are served as they are.
    async fn rebuild_if_needed(&self, tree: &Path) -> Rebuild {
        if !self.toolchain.has_descriptor(tree) || self.toolchain.locate_output(tree).is_some() {
            return Rebuild::NotNeeded;
        }

        info!("deployment holds an unbuilt project, building in place");
        let result = match self.toolchain.compile(tree).await {
            Ok(()) => self.toolchain.require_output(tree),
            Err(e) => Err(e),
        };
        match result {
            Ok(output) => {
                info!(output = %output.display(), "in-place build succeeded");
                Rebuild::Built(output)
            }
            Err(e) => {
                warn!(error = %e, "in-place build failed, serving files as they are");
                Rebuild::Failed(format!("in-place build failed: {e}"))
            }
        }
    }

    /// Stop the site server and any tunnel this stage started.
    pub async fn shutdown(&self) {
        self.tunnels.shutdown().await;
        self.site.shutdown();
    }
}

async fn retire(previous: &ServingRoot) {
    match tokio::fs::remove_dir_all(&previous.tree).await {
        Ok(()) => info!(dir = %previous.tree.display(), "previous deployment removed"),
        Err(e) => warn!(
            dir = %previous.tree.display(),
            error = %e,
            "failed to remove previous deployment"
        ),
    }
}
