//! Ingest service configuration.

use std::net::SocketAddr;
use std::time::Duration;

use launchpad_core::config::{deserialize_secret, layered, ConfigError, WorkspaceConfig};
use launchpad_core::StorageConfig;
use secrecy::SecretString;
use serde::Deserialize;

/// Ingest stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Hosts repository URLs may point at. Empty allows any host.
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    /// Access token for private repositories.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub token: Option<SecretString>,
    /// Git executable.
    #[serde(default = "default_git_program")]
    pub git_program: String,
    /// Clone time limit.
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,
    /// Directory names left out of source archives.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: default_allowed_hosts(),
            token: None,
            git_program: default_git_program(),
            clone_timeout_secs: default_clone_timeout_secs(),
            exclude: default_exclude(),
        }
    }
}

impl IngestConfig {
    /// Clone time limit.
    #[must_use]
    pub const fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }
}

fn default_allowed_hosts() -> Vec<String> {
    vec!["github.com".to_owned()]
}

fn default_git_program() -> String {
    "git".to_owned()
}

const fn default_clone_timeout_secs() -> u64 {
    300
}

fn default_exclude() -> Vec<String> {
    vec![".git".to_owned()]
}

/// Configuration for the standalone ingest service.
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
    /// Ingest behaviour.
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl ServiceConfig {
    /// Load from `ingest.toml` and `INGEST_` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Ok(layered("ingest.toml", path, "INGEST_").extract()?)
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
    SocketAddr::from(([0, 0, 0, 0], 8081))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.listen.port(), 8081);
        assert_eq!(config.ingest.allowed_hosts, vec!["github.com"]);
        assert_eq!(config.ingest.exclude, vec![".git"]);
        assert_eq!(config.ingest.clone_timeout(), Duration::from_secs(300));
        assert!(config.ingest.token.is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"ingest":{"allowed_hosts":[]},"storage":{"bucket":"b"}}"#)
                .unwrap();
        assert!(config.ingest.allowed_hosts.is_empty());
        assert_eq!(config.ingest.git_program, "git");
        assert_eq!(config.storage.bucket, "b");
    }
}
