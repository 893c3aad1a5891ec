//! Delivery configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use launchpad_core::ToolchainConfig;
use serde::Deserialize;

use crate::tunnel::TunnelConfig;

/// Delivery stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Address the static site listens on.
    #[serde(default = "default_site_addr")]
    pub site_addr: SocketAddr,
    /// Directory deployments are extracted under.
    #[serde(default = "default_deploy_root")]
    pub deploy_root: PathBuf,
    /// Tunnel agent.
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Commands for the in-place build of unbuilt deployments.
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            site_addr: default_site_addr(),
            deploy_root: default_deploy_root(),
            tunnel: TunnelConfig::default(),
            toolchain: ToolchainConfig::default(),
        }
    }
}

fn default_site_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8181))
}

fn default_deploy_root() -> PathBuf {
    PathBuf::from("./deployed")
}
