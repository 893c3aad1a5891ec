//! Unified launchpad configuration.
//!
//! One file configures the orchestrator and every stage it runs embedded.
//! Setting `ingest.url` or `build.url` sends that stage to a remote service
//! instead.

use std::net::SocketAddr;
use std::time::Duration;

use launchpad_build::BuildConfig;
use launchpad_core::config::{layered, ConfigError, WorkspaceConfig};
use launchpad_core::StorageConfig;
use launchpad_deliver::DeliveryConfig;
use launchpad_ingest::IngestConfig;
use serde::Deserialize;

/// Unified configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchpadConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerSettings,
    /// Artifact storage.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scratch workspace.
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Ingest stage.
    #[serde(default)]
    pub ingest: IngestSettings,
    /// Build stage.
    #[serde(default)]
    pub build: BuildSettings,
    /// Delivery stage.
    #[serde(default)]
    pub deliver: DeliveryConfig,
}

impl LaunchpadConfig {
    /// Load from `launchpad.toml`, an optional file and `LAUNCHPAD_`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Ok(layered("launchpad.toml", path, "LAUNCHPAD_").extract()?)
    }
}

/// Orchestrator HTTP settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
    /// Origins allowed to call the API from a browser. `*` allows any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Time limit for calls to remote stage services.
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            cors_origins: default_cors_origins(),
            remote_timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl ServerSettings {
    /// Time limit for calls to remote stage services.
    #[must_use]
    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_owned()]
}

const fn default_remote_timeout_secs() -> u64 {
    1800
}

/// Ingest stage settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestSettings {
    /// Remote ingest service. Runs embedded when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Embedded stage configuration.
    #[serde(flatten)]
    pub config: IngestConfig,
}

/// Build stage settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildSettings {
    /// Remote build service. Runs embedded when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Embedded stage configuration.
    #[serde(flatten)]
    pub config: BuildConfig,
}
