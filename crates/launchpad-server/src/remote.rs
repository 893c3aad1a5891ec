//! HTTP clients for stages running as their own services.

use std::time::Duration;

use async_trait::async_trait;
use launchpad_core::protocol::{BuildRequest, BuildResponse, ErrorBody, IngestRequest, IngestResponse};
use launchpad_core::{ErrorKind, PipelineError, PipelineResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::stages::{BuildService, IngestService};

/// JSON client for one stage service.
#[derive(Debug, Clone)]
struct StageClient {
    client: Client,
    base_url: String,
}

impl StageClient {
    fn new(base_url: &str, timeout: Duration) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> PipelineResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "calling stage service");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| unreachable(&url, &e))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| unreachable(&url, &e));
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(PipelineError::from_body(body)),
            Err(_) => Err(PipelineError::Remote {
                kind: ErrorKind::Internal,
                message: format!("{url} returned {status}: {text}"),
            }),
        }
    }
}

fn unreachable(url: &str, e: &reqwest::Error) -> PipelineError {
    PipelineError::Remote {
        kind: ErrorKind::Internal,
        message: format!("stage service {url} failed: {e}"),
    }
}

/// Ingest stage behind `POST /upload`.
#[derive(Debug, Clone)]
pub struct RemoteIngest {
    client: StageClient,
}

impl RemoteIngest {
    /// Client for the ingest service at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> PipelineResult<Self> {
        Ok(Self {
            client: StageClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl IngestService for RemoteIngest {
    async fn ingest(&self, url: &str) -> PipelineResult<IngestResponse> {
        let request = IngestRequest {
            url: url.to_owned(),
        };
        self.client.post("/upload", &request).await
    }
}

/// Build stage behind `POST /build`.
#[derive(Debug, Clone)]
pub struct RemoteBuild {
    client: StageClient,
}

impl RemoteBuild {
    /// Client for the build service at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> PipelineResult<Self> {
        Ok(Self {
            client: StageClient::new(base_url, timeout)?,
        })
    }
}

#[async_trait]
impl BuildService for RemoteBuild {
    async fn build(&self, request: &BuildRequest) -> PipelineResult<BuildResponse> {
        self.client.post("/build", request).await
    }
}
