//! End-to-end deploys: ingest, then build with template fallback, then
//! deliver.

use std::sync::Arc;
use std::time::Instant;

use launchpad_core::protocol::{BuildRequest, BuildResponse};
use launchpad_core::{PipelineResult, RepositoryName, SourceUrl};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::stages::{BuildService, DeliveryService, IngestService};

/// Message of a successful deploy.
pub const DEPLOY_MESSAGE: &str = "App deployed successfully";

/// Response to a deploy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResult {
    /// Status message.
    pub message: String,
    /// Repository deployed.
    pub repo: RepositoryName,
    /// Public address of the site.
    pub public_url: String,
    /// Always `"success"`.
    pub status: String,
    /// The build stage's response.
    #[serde(rename = "buildResult")]
    pub build_result: BuildResponse,
    /// Problems that did not stop the deploy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Sequences the three stages.
pub struct Orchestrator {
    ingest: Arc<dyn IngestService>,
    build: Arc<dyn BuildService>,
    deliver: Arc<dyn DeliveryService>,
    allowed_hosts: Vec<String>,
}

impl Orchestrator {
    /// Create an orchestrator. URLs are checked against `allowed_hosts`
    /// before any stage is called.
    #[must_use]
    pub fn new(
        ingest: Arc<dyn IngestService>,
        build: Arc<dyn BuildService>,
        deliver: Arc<dyn DeliveryService>,
        allowed_hosts: Vec<String>,
    ) -> Self {
        Self {
            ingest,
            build,
            deliver,
            allowed_hosts,
        }
    }

    /// Deploy the repository at `url`.
    ///
    /// The repository is always re-ingested. The first failing stage ends
    /// the deploy and its error is returned unchanged.
    #[instrument(skip(self))]
    pub async fn deploy(&self, url: &str) -> PipelineResult<DeployResult> {
        let source = SourceUrl::parse(url, &self.allowed_hosts)?;
        let start = Instant::now();

        let ingested = self.ingest.ingest(source.as_str()).await?;
        info!(repo = %ingested.repo, file = %ingested.file, "ingest finished");

        let request = BuildRequest {
            repo: ingested.repo.to_string(),
            use_template: true,
            template: None,
        };
        let built = self.build.build(&request).await?;
        info!(repo = %built.repo, file = %built.file, "build finished");

        let delivered = self.deliver.deliver(&ingested.repo).await?;
        for warning in &delivered.warnings {
            warn!(repo = %ingested.repo, warning = %warning, "delivery warning");
        }

        info!(
            repo = %ingested.repo,
            url = %delivered.public_url,
            duration_secs = start.elapsed().as_secs_f32(),
            "deploy finished"
        );
        Ok(DeployResult {
            message: DEPLOY_MESSAGE.to_owned(),
            repo: ingested.repo,
            public_url: delivered.public_url,
            status: "success".to_owned(),
            build_result: built,
            warnings: delivered.warnings,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use launchpad_core::protocol::IngestResponse;
    use launchpad_core::{ErrorKind, PipelineError, ToolchainStep};
    use launchpad_deliver::DeliveryOutcome;
    use parking_lot::Mutex;

    use super::*;

    /// Records calls; fails at the named stage.
    #[derive(Default)]
    struct Recorder {
        fail_at: Option<&'static str>,
        calls: Mutex<Vec<String>>,
        build_requests: Mutex<Vec<BuildRequest>>,
    }

    impl Recorder {
        fn failing_at(stage: &'static str) -> Arc<Self> {
            Arc::new(Self {
                fail_at: Some(stage),
                ..Self::default()
            })
        }

        fn enter(&self, stage: &'static str) -> PipelineResult<()> {
            self.calls.lock().push(stage.to_owned());
            match self.fail_at {
                Some("ingest") if stage == "ingest" => Err(PipelineError::Fetch {
                    url: "https://github.com/org/widget".into(),
                    message: "authentication failed".into(),
                }),
                Some("build") if stage == "build" => Err(PipelineError::Toolchain {
                    step: ToolchainStep::Install,
                    exit_code: 1,
                    message: "npm ERR!".into(),
                }),
                Some("deliver") if stage == "deliver" => Err(PipelineError::TunnelTimeout {
                    limit: std::time::Duration::from_secs(30),
                }),
                _ => Ok(()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    fn widget() -> RepositoryName {
        RepositoryName::new("widget").unwrap()
    }

    #[async_trait]
    impl IngestService for Recorder {
        async fn ingest(&self, _url: &str) -> PipelineResult<IngestResponse> {
            self.enter("ingest")?;
            Ok(IngestResponse {
                message: "ok".into(),
                repo: widget(),
                bucket: "bucket".into(),
                file: "widget.zip".into(),
                timestamp: "2024-05-01T12:00:00Z".into(),
            })
        }
    }

    #[async_trait]
    impl BuildService for Recorder {
        async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResponse> {
            self.build_requests.lock().push(request.clone());
            self.enter("build")?;
            Ok(BuildResponse {
                message: "built".into(),
                status: "success".into(),
                created_from: None,
                repo: widget(),
                bucket: "bucket".into(),
                file: "widget-build.zip".into(),
            })
        }
    }

    #[async_trait]
    impl DeliveryService for Recorder {
        async fn deliver(&self, name: &RepositoryName) -> PipelineResult<DeliveryOutcome> {
            self.enter("deliver")?;
            Ok(DeliveryOutcome {
                repository: name.clone(),
                public_url: "https://widget.ngrok.io".into(),
                local_addr: SocketAddr::from(([127, 0, 0, 1], 8181)),
                serving_root: PathBuf::from("/deployed/widget"),
                warnings: vec!["in-place build failed".into()],
            })
        }
    }

    fn orchestrator(recorder: &Arc<Recorder>) -> Orchestrator {
        Orchestrator::new(
            recorder.clone(),
            recorder.clone(),
            recorder.clone(),
            vec!["github.com".into()],
        )
    }

    #[tokio::test]
    async fn runs_all_stages_in_order() {
        let recorder = Arc::new(Recorder::default());

        let result = orchestrator(&recorder)
            .deploy("https://github.com/org/widget")
            .await
            .unwrap();

        assert_eq!(recorder.calls(), vec!["ingest", "build", "deliver"]);
        assert_eq!(result.message, DEPLOY_MESSAGE);
        assert_eq!(result.public_url, "https://widget.ngrok.io");
        assert_eq!(result.build_result.file, "widget-build.zip");
        assert_eq!(result.warnings, vec!["in-place build failed"]);

        let requests = recorder.build_requests.lock().clone();
        assert_eq!(requests[0].repo, "widget");
        assert!(requests[0].use_template);
    }

    #[tokio::test]
    async fn invalid_url_calls_no_stage() {
        let recorder = Arc::new(Recorder::default());

        let err = orchestrator(&recorder)
            .deploy("https://gitlab.com/org/widget")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn first_failure_short_circuits() {
        for (stage, kind, expected_calls) in [
            ("ingest", ErrorKind::Fetch, vec!["ingest"]),
            ("build", ErrorKind::Toolchain, vec!["ingest", "build"]),
            ("deliver", ErrorKind::TunnelTimeout, vec!["ingest", "build", "deliver"]),
        ] {
            let recorder = Recorder::failing_at(stage);
            let err = orchestrator(&recorder)
                .deploy("https://github.com/org/widget")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind, "{stage}");
            assert_eq!(recorder.calls(), expected_calls, "{stage}");
        }
    }

    #[test]
    fn result_uses_wire_field_names() {
        let result = DeployResult {
            message: DEPLOY_MESSAGE.into(),
            repo: widget(),
            public_url: "https://widget.ngrok.io".into(),
            status: "success".into(),
            build_result: BuildResponse {
                message: "built".into(),
                status: "success".into(),
                created_from: None,
                repo: widget(),
                bucket: "bucket".into(),
                file: "widget-build.zip".into(),
            },
            warnings: Vec::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["buildResult"]["file"], "widget-build.zip");
        assert!(json.get("warnings").is_none());
    }
}
