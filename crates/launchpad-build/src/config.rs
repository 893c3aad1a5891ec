//! Build service configuration.

use std::net::SocketAddr;

use launchpad_core::config::{layered, ConfigError, WorkspaceConfig};
use launchpad_core::{StorageConfig, TemplateKind, ToolchainConfig};
use serde::Deserialize;

use crate::lock::LockScope;

/// Build stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Template used when a request does not name one.
    #[serde(default)]
    pub default_template: TemplateKind,
    /// Scaffold from a template whenever stored source is missing.
    #[serde(default)]
    pub auto_template: bool,
    /// Whether builds of different repositories may overlap.
    #[serde(default)]
    pub lock_scope: LockScope,
    /// Install and build commands.
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    /// Directory names left out of scaffolded source archives.
    #[serde(default = "default_scaffold_exclude")]
    pub scaffold_exclude: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            default_template: TemplateKind::default(),
            auto_template: false,
            lock_scope: LockScope::default(),
            toolchain: ToolchainConfig::default(),
            scaffold_exclude: default_scaffold_exclude(),
        }
    }
}

fn default_scaffold_exclude() -> Vec<String> {
    vec![".git".to_owned(), "node_modules".to_owned()]
}

/// Configuration for the standalone build service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,
    /// Artifact storage.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scratch workspace.
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    /// Build behaviour.
    #[serde(default)]
    pub build: BuildConfig,
}

impl ServiceConfig {
    /// Load from `build.toml` and `BUILD_` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Ok(layered("build.toml", path, "BUILD_").extract()?)
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8082))
}
