//! The orchestrator's view of each stage.
//!
//! Every stage can run in this process or behind its own HTTP service. The
//! orchestrator only sees these traits, and stage errors keep their taxonomy
//! kind either way.

use std::sync::Arc;

use async_trait::async_trait;
use launchpad_build::api::bind_job;
use launchpad_build::BuildStage;
use launchpad_core::protocol::{BuildRequest, BuildResponse, IngestResponse};
use launchpad_core::{PipelineResult, RepositoryName, TemplateKind};
use launchpad_deliver::{DeliveryOutcome, DeliveryStage};
use launchpad_ingest::IngestStage;

/// Fetches a repository and stores its source archive.
#[async_trait]
pub trait IngestService: Send + Sync {
    /// Ingest the repository at `url`.
    async fn ingest(&self, url: &str) -> PipelineResult<IngestResponse>;
}

/// Builds a stored repository.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Run the build described by `request`.
    async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResponse>;
}

/// Publishes a stored build.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    /// Serve the build of `name` and return where it is reachable.
    async fn deliver(&self, name: &RepositoryName) -> PipelineResult<DeliveryOutcome>;
}

#[async_trait]
impl IngestService for IngestStage {
    async fn ingest(&self, url: &str) -> PipelineResult<IngestResponse> {
        let receipt = IngestStage::ingest(self, url).await?;
        Ok(IngestResponse::from(&receipt))
    }
}

/// Build stage running in this process.
pub struct EmbeddedBuild {
    stage: Arc<BuildStage>,
    default_template: TemplateKind,
}

impl EmbeddedBuild {
    /// Wrap `stage`, using `default_template` when a request names none.
    #[must_use]
    pub fn new(stage: Arc<BuildStage>, default_template: TemplateKind) -> Self {
        Self {
            stage,
            default_template,
        }
    }
}

#[async_trait]
impl BuildService for EmbeddedBuild {
    async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResponse> {
        let job = bind_job(request, self.default_template)?;
        let outcome = self.stage.build(&job).await?;
        Ok(BuildResponse::from(&outcome))
    }
}

#[async_trait]
impl DeliveryService for DeliveryStage {
    async fn deliver(&self, name: &RepositoryName) -> PipelineResult<DeliveryOutcome> {
        DeliveryStage::deliver(self, name).await
    }
}
