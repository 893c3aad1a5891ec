//! JSON bodies exchanged between the services and their clients.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{BuildOutcome, RepositoryName, TemplateKind};

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human readable error message.
    pub error: String,
    /// Taxonomy kind.
    pub kind: ErrorKind,
    /// `not_found` or `error`.
    pub status: String,
    /// Optional hint for the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `POST /upload` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Repository URL to ingest.
    pub url: String,
}

/// `POST /upload` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Status message.
    pub message: String,
    /// Derived repository name.
    pub repo: RepositoryName,
    /// Bucket holding the source archive.
    pub bucket: String,
    /// Object name of the source archive.
    pub file: String,
    /// RFC 3339 timestamp of the upload.
    pub timestamp: String,
}

/// `POST /build` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Repository name to build.
    pub repo: String,
    /// Permit scaffolding when no stored source exists.
    #[serde(default)]
    pub use_template: bool,
    /// Template kind; the service default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Always `"success"` in a build response.
pub const STATUS_SUCCESS: &str = "success";

/// `POST /build` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    /// Status message.
    pub message: String,
    /// Always `"success"`.
    pub status: String,
    /// Template scaffolded from, if any.
    #[serde(default)]
    pub created_from: Option<TemplateKind>,
    /// Repository that was built.
    pub repo: RepositoryName,
    /// Bucket holding the build archive.
    pub bucket: String,
    /// Object name of the build archive.
    pub file: String,
}

impl From<&BuildOutcome> for BuildResponse {
    fn from(outcome: &BuildOutcome) -> Self {
        let message = match outcome.created_from {
            Some(kind) => format!("Build created from template {kind} and uploaded"),
            None => "Build completed from stored source and uploaded".to_owned(),
        };
        Self {
            message,
            status: STATUS_SUCCESS.to_owned(),
            created_from: outcome.created_from,
            repo: outcome.repository.clone(),
            bucket: outcome.artifact.bucket.clone(),
            file: outcome.artifact.object.clone(),
        }
    }
}

/// `POST /deploy` request; `GET /deploy` takes the same field as a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Repository URL to deploy.
    #[serde(default)]
    pub url: Option<String>,
}

/// Health check body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
}

impl HealthResponse {
    /// A healthy response.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_owned(),
        }
    }
}
