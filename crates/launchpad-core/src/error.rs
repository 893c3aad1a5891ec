//! Error taxonomy for the pipeline.
//!
//! Every stage reports failures as a [`PipelineError`]. The coarse
//! [`ErrorKind`] survives HTTP hops between services so the orchestrator can
//! tell a missing artifact from a failed toolchain run no matter where the
//! stage ran.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ErrorBody;

/// Hint returned alongside `not_found` build responses.
pub const TEMPLATE_HINT: &str =
    "Repository not found. Add 'use_template':true to create from template.";

/// Toolchain step for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainStep {
    /// Template scaffolding.
    Scaffold,
    /// Dependency installation.
    Install,
    /// Project build command.
    Build,
}

impl fmt::Display for ToolchainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scaffold => write!(f, "template scaffold"),
            Self::Install => write!(f, "dependency install"),
            Self::Build => write!(f, "build command"),
        }
    }
}

/// Coarse failure category, stable across service boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input, rejected before any I/O.
    Validation,
    /// Requested artifact does not exist.
    NotFound,
    /// The source repository could not be fetched.
    Fetch,
    /// Working tree has no project descriptor.
    NotAProject,
    /// A scaffold, install or build command failed.
    Toolchain,
    /// The build ran but produced no recognised output directory.
    BuildOutputMissing,
    /// Upload or download failed or timed out.
    Transfer,
    /// No public tunnel registered in time.
    TunnelTimeout,
    /// Unsupported or invalid configuration.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Fetch => "fetch",
            Self::NotAProject => "not_a_project",
            Self::Toolchain => "toolchain",
            Self::BuildOutputMissing => "build_output_missing",
            Self::Transfer => "transfer",
            Self::TunnelTimeout => "tunnel_timeout",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// HTTP status used when this kind is returned from an API.
    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::Validation | Self::Configuration => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotAProject | Self::BuildOutputMissing => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Fetch | Self::Transfer => StatusCode::BAD_GATEWAY,
            Self::TunnelTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Toolchain | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ─────────────────────────────────────────────────────────────────────────
    // Validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Repository name is unsafe to use as a path component.
    #[error("invalid repository name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Repository URL failed validation.
    #[error("invalid repository url {url:?}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A derived path would escape its root.
    #[error("path {path:?} escapes {root:?}")]
    PathEscape {
        /// Root the path was resolved against.
        root: String,
        /// The offending relative path.
        path: String,
    },

    /// Request body or query was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Stage errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Object does not exist in the store.
    #[error("{object} not found in bucket {bucket}")]
    NotFound {
        /// Bucket searched.
        bucket: String,
        /// Missing object name.
        object: String,
    },

    /// Repository could not be fetched.
    #[error("failed to fetch {url}: {message}")]
    Fetch {
        /// Repository URL, without credentials.
        url: String,
        /// Fetch tool output.
        message: String,
    },

    /// Working tree lacks a project descriptor.
    #[error("not a buildable project: {descriptor} missing")]
    NotAProject {
        /// Descriptor file that was expected.
        descriptor: String,
    },

    /// A toolchain command exited unsuccessfully.
    #[error("{step} failed (exit code {exit_code}): {message}")]
    Toolchain {
        /// Which step failed.
        step: ToolchainStep,
        /// Process exit code, -1 when killed.
        exit_code: i32,
        /// Tail of the command's stderr.
        message: String,
    },

    /// No candidate output directory exists after a build.
    #[error("build output not found, looked in: {}", candidates.join(", "))]
    BuildOutputMissing {
        /// Directories that were checked, in order.
        candidates: Vec<String>,
    },

    /// Upload or download failed.
    #[error("transfer of {object} failed: {message}")]
    Transfer {
        /// Object being transferred.
        object: String,
        /// Underlying failure.
        message: String,
    },

    /// Upload or download exceeded its deadline.
    #[error("transfer of {object} timed out after {limit:?}")]
    TransferTimeout {
        /// Object being transferred.
        object: String,
        /// Deadline that elapsed.
        limit: Duration,
    },

    /// No tunnel registration appeared in time.
    #[error("no tunnel registered within {limit:?}")]
    TunnelTimeout {
        /// Deadline that elapsed.
        limit: Duration,
    },

    /// Tunnel process or discovery failure other than a timeout.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Archive could not be written or read.
    #[error("archive error: {0}")]
    Archive(String),

    /// Error reported by a stage running in another service.
    #[error("{kind} error from remote stage: {message}")]
    Remote {
        /// The remote error's kind.
        kind: ErrorKind,
        /// The remote error's message.
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Environment errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid configuration or unsupported option.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName { .. }
            | Self::InvalidUrl { .. }
            | Self::PathEscape { .. }
            | Self::InvalidRequest(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::NotAProject { .. } => ErrorKind::NotAProject,
            Self::Toolchain { .. } => ErrorKind::Toolchain,
            Self::BuildOutputMissing { .. } => ErrorKind::BuildOutputMissing,
            Self::Transfer { .. } | Self::TransferTimeout { .. } => ErrorKind::Transfer,
            Self::TunnelTimeout { .. } => ErrorKind::TunnelTimeout,
            Self::Remote { kind, .. } => *kind,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Tunnel(_) | Self::Archive(_) | Self::Io(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Shorthand for a transfer failure on `object`.
    pub fn transfer(object: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transfer {
            object: object.into(),
            message: message.to_string(),
        }
    }

    /// Rebuild an error from a remote service's error body.
    #[must_use]
    pub fn from_body(body: ErrorBody) -> Self {
        Self::Remote {
            kind: body.kind,
            message: body.error,
        }
    }

    /// Wire representation of this error.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let kind = self.kind();
        ErrorBody {
            error: self.to_string(),
            kind,
            status: if kind == ErrorKind::NotFound {
                "not_found".to_owned()
            } else {
                "error".to_owned()
            },
            message: (kind == ErrorKind::NotFound).then(|| TEMPLATE_HINT.to_owned()),
        }
    }
}

impl From<zip::result::ZipError> for PipelineError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = self.to_body();

        // Internal details stay in the logs.
        if matches!(self, Self::Io(_) | Self::Internal(_)) {
            body.error = "internal error".to_owned();
        }

        (status, Json(body)).into_response()
    }
}
