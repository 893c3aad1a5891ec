//! Configuration loading shared by the service binaries.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("Configuration error: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Build the layered figment every service uses.
///
/// Sources in order, later overriding earlier:
/// 1. Serde defaults
/// 2. `default_file` in the current directory (if present)
/// 3. `path` (if provided)
/// 4. Environment variables with `env_prefix`, nested keys split on `__`
#[must_use]
pub fn layered(default_file: &str, path: Option<&str>, env_prefix: &str) -> Figment {
    let mut figment = Figment::new().merge(Toml::file(default_file));
    if let Some(p) = path {
        figment = figment.merge(Toml::file(p));
    }
    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Deserialise an optional secret string. Empty strings count as absent.
pub fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .filter(|v| !v.is_empty())
        .map(SecretString::from))
}

/// Scratch workspace configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    /// Root for per-stage scratch directories.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./tmp")
}
