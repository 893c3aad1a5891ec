//! Shared fixtures for pipeline tests: every external process is scripted,
//! storage is in memory and the tunnel API is faked.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use launchpad_build::{BuildLocks, BuildSettings, BuildStage, LockScope};
use launchpad_core::process::ProcessError;
use launchpad_core::testing::{memory_store, ScriptedRunner};
use launchpad_core::{
    CommandOutput, CommandSpec, ObjectArtifactStore, Scratch, TemplateKind, Toolchain,
    ToolchainConfig,
};
use launchpad_deliver::testing::{ManualClock, ScriptedDiscovery};
use launchpad_deliver::{DeliveryStage, SiteHost, TunnelConfig, TunnelDescriptor, TunnelManager};
use launchpad_ingest::{GitFetcher, IngestSettings, IngestStage};
use launchpad_server::api::{self, AppState};
use launchpad_server::{EmbeddedBuild, Orchestrator};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "sites";

/// How the scripted toolchain behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolbox {
    /// Clone, install and build all succeed.
    Healthy,
    /// `git clone` is rejected.
    CloneRejected,
    /// `npm install` fails.
    InstallFails,
}

/// Stand-in for git, npm and npx.
pub fn script(
    toolbox: Toolbox,
) -> impl Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static {
    move |cmd| {
        let first = cmd.args.first().map(String::as_str);
        match (cmd.program.as_str(), first) {
            ("git", Some("clone")) => {
                if toolbox == Toolbox::CloneRejected {
                    return Ok(CommandOutput::failure(128, "fatal: Authentication failed"));
                }
                let dest = PathBuf::from(cmd.args.last().unwrap());
                std::fs::create_dir_all(dest.join("src")).unwrap();
                std::fs::create_dir_all(dest.join(".git")).unwrap();
                std::fs::write(dest.join("package.json"), r#"{"name":"widget"}"#).unwrap();
                std::fs::write(dest.join("src/index.js"), "render()").unwrap();
                std::fs::write(dest.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
            }
            ("npx", _) => {
                let dir = cmd.cwd.clone().unwrap().join(&cmd.args[1]);
                std::fs::create_dir_all(&dir).unwrap();
                std::fs::write(dir.join("package.json"), "{}").unwrap();
            }
            ("npm", Some("install")) if toolbox == Toolbox::InstallFails => {
                return Ok(CommandOutput::failure(1, "npm ERR! code E404"));
            }
            ("npm", Some("run")) => {
                let out = cmd.cwd.clone().unwrap().join("build");
                std::fs::create_dir_all(out.join("static")).unwrap();
                std::fs::write(out.join("index.html"), "<h1>widget</h1>").unwrap();
                std::fs::write(out.join("static/app.js"), "app()").unwrap();
            }
            _ => {}
        }
        Ok(CommandOutput::success(""))
    }
}

pub fn https_tunnel() -> TunnelDescriptor {
    TunnelDescriptor {
        public_url: "https://widget.ngrok.io".into(),
        protocol: "https".into(),
        local_port: None,
    }
}

/// A fully embedded pipeline.
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<ObjectArtifactStore>,
    pub runner: Arc<ScriptedRunner>,
    pub ingest: Arc<IngestStage>,
    pub build: Arc<BuildStage>,
    pub delivery: Arc<DeliveryStage>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(toolbox: Toolbox, discovery: ScriptedDiscovery) -> Self {
        let temp = TempDir::new().unwrap();
        let store = memory_store(BUCKET);
        let runner = Arc::new(ScriptedRunner::new(script(toolbox)));
        let toolchain = Toolchain::new(runner.clone(), ToolchainConfig::default()).unwrap();
        let work = temp.path().join("work");

        let ingest = Arc::new(IngestStage::new(
            Arc::new(GitFetcher::new(runner.clone())),
            store.clone(),
            Scratch::new(work.join("ingest")).unwrap(),
            IngestSettings {
                bucket: BUCKET.into(),
                allowed_hosts: vec!["github.com".into()],
                exclude: vec![".git".into()],
            },
        ));

        let build = Arc::new(BuildStage::new(
            store.clone(),
            toolchain.clone(),
            BuildLocks::new(LockScope::PerRepository),
            Scratch::new(work.join("build")).unwrap(),
            BuildSettings {
                bucket: BUCKET.into(),
                auto_template: false,
                scaffold_exclude: vec![".git".into(), "node_modules".into()],
            },
        ));

        let delivery = Arc::new(DeliveryStage::new(
            store.clone(),
            toolchain,
            SiteHost::new(SocketAddr::from(([127, 0, 0, 1], 0)), CancellationToken::new()),
            TunnelManager::new(
                runner.clone(),
                Arc::new(discovery),
                Arc::new(ManualClock::new()),
                TunnelConfig::default(),
            ),
            Scratch::new(work.join("deliver")).unwrap(),
            Scratch::new(temp.path().join("deployed")).unwrap(),
            BUCKET,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            ingest.clone(),
            Arc::new(EmbeddedBuild::new(build.clone(), TemplateKind::CreateReactApp)),
            delivery.clone(),
            vec!["github.com".into()],
        ));

        Self {
            temp,
            store,
            runner,
            ingest,
            build,
            delivery,
            orchestrator,
        }
    }

    pub fn healthy() -> Self {
        Self::new(Toolbox::Healthy, ScriptedDiscovery::always(https_tunnel()))
    }

    /// The orchestrator API.
    pub fn router(&self) -> Router {
        api::router(
            Arc::new(AppState {
                orchestrator: self.orchestrator.clone(),
            }),
            &["*".to_owned()],
        )
    }

    pub async fn objects(&self) -> Vec<String> {
        self.store.list(BUCKET).await.unwrap()
    }
}

/// Serve `app` on an ephemeral local port.
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
