//! Public tunnel management.
//!
//! A tunnel is a provider-managed reverse proxy for a local port. The
//! provider's agent runs as a child process and reports its registrations
//! through a local control API, which is polled until the tunnel appears:
//!
//! ```text
//! Starting ──▶ Polling ──▶ Registered
//!                 │  ▲
//!                 └──┘ (poll interval)
//!                 │
//!                 └──────▶ TimedOut (process terminated)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use launchpad_core::config::deserialize_secret;
use launchpad_core::{CommandSpec, PipelineError, PipelineResult, ProcessHandle, ProcessRunner};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;

/// A registered tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    /// Public address of the tunnel.
    pub public_url: String,
    /// Transport protocol, e.g. `https`.
    pub protocol: String,
    /// Local port the tunnel forwards to, when the provider reports it.
    pub local_port: Option<u16>,
}

impl TunnelDescriptor {
    /// Whether the public side uses an encrypted transport.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.protocol == "https" || self.public_url.starts_with("https://")
    }

    fn forwards_to(&self, port: u16) -> bool {
        self.local_port.map_or(true, |p| p == port)
    }
}

/// Pick the tunnel for `port`, preferring a secure one.
#[must_use]
pub fn select_tunnel(tunnels: &[TunnelDescriptor], port: u16) -> Option<TunnelDescriptor> {
    let mut matching = tunnels.iter().filter(|t| t.forwards_to(port));
    let first = matching.clone().next()?;
    Some(matching.find(|t| t.is_secure()).unwrap_or(first).clone())
}

/// Lists active tunnels.
#[async_trait]
pub trait TunnelDiscovery: Send + Sync {
    /// Tunnels currently registered with the local agent.
    async fn list(&self) -> PipelineResult<Vec<TunnelDescriptor>>;
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<RawTunnel>,
}

#[derive(Debug, Deserialize)]
struct RawTunnel {
    public_url: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    config: Option<RawTunnelConfig>,
}

#[derive(Debug, Deserialize)]
struct RawTunnelConfig {
    #[serde(default)]
    addr: Option<String>,
}

impl From<RawTunnel> for TunnelDescriptor {
    fn from(raw: RawTunnel) -> Self {
        let local_port = raw
            .config
            .and_then(|c| c.addr)
            .and_then(|addr| parse_port(&addr));
        Self {
            public_url: raw.public_url,
            protocol: raw.proto,
            local_port,
        }
    }
}

/// Port from an agent address such as `http://localhost:8181`, `localhost:8181`
/// or `8181`.
fn parse_port(addr: &str) -> Option<u16> {
    let rest = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let rest = rest.trim_end_matches('/');
    match rest.rsplit_once(':') {
        Some((_, port)) => port.parse().ok(),
        None => rest.parse().ok(),
    }
}

/// Discovery through the ngrok agent's local API.
#[derive(Debug, Clone)]
pub struct NgrokDiscovery {
    client: Client,
    url: String,
}

impl NgrokDiscovery {
    /// Query the agent API at `url`.
    pub fn new(url: impl Into<String>) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| PipelineError::Tunnel(format!("failed to build discovery client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TunnelDiscovery for NgrokDiscovery {
    async fn list(&self) -> PipelineResult<Vec<TunnelDescriptor>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PipelineError::Tunnel(format!("discovery request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::Tunnel(format!(
                "discovery returned {}",
                response.status()
            )));
        }

        let list: TunnelList = response
            .json()
            .await
            .map_err(|e| PipelineError::Tunnel(format!("invalid discovery response: {e}")))?;
        Ok(list.tunnels.into_iter().map(TunnelDescriptor::from).collect())
    }
}

/// Tunnel agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Agent executable.
    #[serde(default = "default_program")]
    pub program: String,
    /// Agent auth token.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub authtoken: Option<SecretString>,
    /// Local API listing active tunnels.
    #[serde(default = "default_discovery_url")]
    pub discovery_url: String,
    /// How long to wait for a registration.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay between discovery polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            authtoken: None,
            discovery_url: default_discovery_url(),
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TunnelConfig {
    /// Registration deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay between polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_program() -> String {
    "ngrok".to_owned()
}

fn default_discovery_url() -> String {
    "http://127.0.0.1:4040/api/tunnels".to_owned()
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_poll_interval_ms() -> u64 {
    500
}

/// Progress of a tunnel start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// Agent process spawned.
    Starting,
    /// Waiting for a registration.
    Polling {
        /// Discovery requests made so far.
        attempts: u32,
    },
    /// The tunnel is up.
    Registered(TunnelDescriptor),
    /// The deadline elapsed.
    TimedOut,
}

struct ActiveTunnel {
    port: u16,
    descriptor: TunnelDescriptor,
    /// `None` when the tunnel was started outside this process.
    handle: Option<Box<dyn ProcessHandle>>,
}

/// Starts, reuses and stops the tunnel for the site port.
pub struct TunnelManager {
    runner: Arc<dyn ProcessRunner>,
    discovery: Arc<dyn TunnelDiscovery>,
    clock: Arc<dyn Clock>,
    config: TunnelConfig,
    active: Mutex<Option<ActiveTunnel>>,
}

impl TunnelManager {
    /// Create a manager. No process is started until [`Self::expose`].
    #[must_use]
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        discovery: Arc<dyn TunnelDiscovery>,
        clock: Arc<dyn Clock>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            runner,
            discovery,
            clock,
            config,
            active: Mutex::new(None),
        }
    }

    fn command(&self, port: u16) -> CommandSpec {
        let mut command = CommandSpec::new(&self.config.program)
            .args(["http".to_owned(), port.to_string()])
            .args(["--log", "stdout"]);
        if let Some(token) = &self.config.authtoken {
            command = command
                .args(["--authtoken", token.expose_secret()])
                .sensitive();
        }
        command
    }

    /// Make `port` publicly reachable and return the tunnel.
    ///
    /// A tunnel already forwarding to `port` is reused, whether this manager
    /// started it or not. One started elsewhere is looked up through
    /// discovery again on every call, since its agent may have gone away.
    #[instrument(skip(self))]
    pub async fn expose(&self, port: u16) -> PipelineResult<TunnelDescriptor> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_mut() {
            let alive = current.handle.as_mut().is_some_and(|h| h.is_running());
            if current.port == port && alive {
                debug!(url = %current.descriptor.public_url, "tunnel already active");
                return Ok(current.descriptor.clone());
            }
        }
        if let Some(previous) = active.take() {
            stop(previous).await;
        }

        match self.discovery.list().await {
            Ok(existing) => {
                if let Some(descriptor) = select_tunnel(&existing, port) {
                    info!(url = %descriptor.public_url, "reusing existing tunnel");
                    *active = Some(ActiveTunnel {
                        port,
                        descriptor: descriptor.clone(),
                        handle: None,
                    });
                    return Ok(descriptor);
                }
            }
            Err(e) => debug!(error = %e, "no tunnel agent answering yet"),
        }

        let command = self.command(port);
        info!(command = %command.display(), "starting tunnel");
        let handle = self
            .runner
            .spawn(&command)
            .await
            .map_err(|e| PipelineError::Tunnel(e.to_string()))?;

        let (descriptor, handle) = self.await_registration(port, handle).await?;
        *active = Some(ActiveTunnel {
            port,
            descriptor: descriptor.clone(),
            handle: Some(handle),
        });
        Ok(descriptor)
    }

    async fn await_registration(
        &self,
        port: u16,
        mut handle: Box<dyn ProcessHandle>,
    ) -> PipelineResult<(TunnelDescriptor, Box<dyn ProcessHandle>)> {
        let limit = self.config.timeout();
        let deadline = self.clock.now() + limit;
        let mut state = TunnelState::Starting;

        loop {
            debug!(state = ?state, "tunnel state");
            state = match state {
                TunnelState::Starting => TunnelState::Polling { attempts: 0 },
                TunnelState::Polling { attempts } => {
                    if !handle.is_running() {
                        return Err(PipelineError::Tunnel(
                            "tunnel process exited before registering".to_owned(),
                        ));
                    }
                    let found = match self.discovery.list().await {
                        Ok(tunnels) => select_tunnel(&tunnels, port),
                        Err(e) => {
                            debug!(attempts, error = %e, "discovery not ready");
                            None
                        }
                    };
                    match found {
                        Some(descriptor) => TunnelState::Registered(descriptor),
                        None if self.clock.now() >= deadline => TunnelState::TimedOut,
                        None => {
                            self.clock.sleep(self.config.poll_interval()).await;
                            TunnelState::Polling {
                                attempts: attempts + 1,
                            }
                        }
                    }
                }
                TunnelState::Registered(descriptor) => {
                    info!(url = %descriptor.public_url, secure = descriptor.is_secure(), "tunnel registered");
                    return Ok((descriptor, handle));
                }
                TunnelState::TimedOut => {
                    warn!(?limit, "tunnel did not register, terminating agent");
                    if let Err(e) = handle.terminate().await {
                        warn!(error = %e, "failed to terminate tunnel process");
                    }
                    return Err(PipelineError::TunnelTimeout { limit });
                }
            };
        }
    }

    /// Stop the tunnel this manager started, if any.
    pub async fn shutdown(&self) {
        if let Some(active) = self.active.lock().await.take() {
            stop(active).await;
        }
    }
}

async fn stop(active: ActiveTunnel) {
    if let Some(mut handle) = active.handle {
        info!(url = %active.descriptor.public_url, "stopping tunnel");
        if let Err(e) = handle.terminate().await {
            warn!(error = %e, "failed to terminate tunnel process");
        }
    }
}
