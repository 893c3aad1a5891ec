//! The launchpad orchestrator.
//!
//! `deploy(url)` runs the whole pipeline: ingest the repository, build it
//! (scaffolding from a template if needed), then serve it behind a public
//! tunnel. Ingest and build run in this process unless the configuration
//! points them at their own services. Delivery always runs here because the
//! site it serves must outlive the request.

pub mod api;
pub mod config;
pub mod orchestrator;
pub mod remote;
pub mod stages;

use std::sync::Arc;

use launchpad_core::{ArtifactStore, ObjectArtifactStore, PipelineResult, ProcessRunner};
use launchpad_deliver::DeliveryStage;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::LaunchpadConfig;
pub use orchestrator::{DeployResult, Orchestrator};
pub use remote::{RemoteBuild, RemoteIngest};
pub use stages::{BuildService, DeliveryService, EmbeddedBuild, IngestService};

/// An assembled pipeline and the long-lived parts it owns.
pub struct Pipeline {
    /// Sequences the stages.
    pub orchestrator: Arc<Orchestrator>,
    /// The delivery stage, kept for shutdown.
    pub delivery: Arc<DeliveryStage>,
}

impl Pipeline {
    /// Assemble the pipeline described by `config`.
    ///
    /// The site server stops when `cancel` fires; call [`Self::shutdown`] to
    /// stop the tunnel as well.
    pub fn from_config(
        config: &LaunchpadConfig,
        runner: Arc<dyn ProcessRunner>,
        cancel: CancellationToken,
    ) -> PipelineResult<Self> {
        let store: Arc<dyn ArtifactStore> =
            Arc::new(ObjectArtifactStore::new(config.storage.clone()));
        let timeout = config.server.remote_timeout();

        let ingest: Arc<dyn IngestService> = match &config.ingest.url {
            Some(url) => {
                info!(url = %url, "using remote ingest service");
                Arc::new(RemoteIngest::new(url, timeout)?)
            }
            None => Arc::new(launchpad_ingest::stage_from_config(
                &config.ingest.config,
                &config.storage,
                &config.workspace,
                Arc::clone(&store),
                Arc::clone(&runner),
            )?),
        };

        let build: Arc<dyn BuildService> = match &config.build.url {
            Some(url) => {
                info!(url = %url, "using remote build service");
                Arc::new(RemoteBuild::new(url, timeout)?)
            }
            None => {
                let stage = launchpad_build::stage_from_config(
                    &config.build.config,
                    &config.storage,
                    &config.workspace,
                    Arc::clone(&store),
                    Arc::clone(&runner),
                )?;
                Arc::new(EmbeddedBuild::new(
                    Arc::new(stage),
                    config.build.config.default_template,
                ))
            }
        };

        let delivery = Arc::new(launchpad_deliver::stage_from_config(
            &config.deliver,
            &config.storage,
            &config.workspace,
            store,
            runner,
            cancel,
        )?);

        let orchestrator = Orchestrator::new(
            ingest,
            build,
            Arc::clone(&delivery) as Arc<dyn DeliveryService>,
            config.ingest.config.allowed_hosts.clone(),
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            delivery,
        })
    }

    /// Stop the site server and tunnel.
    pub async fn shutdown(&self) {
        self.delivery.shutdown().await;
    }
}
