//! Front-end project toolchain.
//!
//! A project is recognised by its descriptor file. Compiling it means
//! installing dependencies and then running the build script, both through
//! the injected [`ProcessRunner`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::error::{PipelineError, PipelineResult, ToolchainStep};
use crate::process::{CommandOutput, CommandSpec, ProcessError, ProcessRunner};

/// Toolchain configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolchainConfig {
    /// File that marks a directory as a buildable project.
    #[serde(default = "default_descriptor")]
    pub descriptor: String,
    /// Dependency install command.
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    /// Build command.
    #[serde(default = "default_build")]
    pub build: Vec<String>,
    /// Output directory the build script declares.
    #[serde(default = "default_primary_output")]
    pub primary_output: String,
    /// Alternate output directories, checked in order.
    #[serde(default = "default_alternate_outputs")]
    pub alternate_outputs: Vec<String>,
    /// Time limit for each command.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_descriptor() -> String {
    "package.json".to_owned()
}

fn default_install() -> Vec<String> {
    vec!["npm".to_owned(), "install".to_owned()]
}

fn default_build() -> Vec<String> {
    vec!["npm".to_owned(), "run".to_owned(), "build".to_owned()]
}

fn default_primary_output() -> String {
    "build".to_owned()
}

fn default_alternate_outputs() -> Vec<String> {
    vec!["dist".to_owned(), "out".to_owned(), ".next".to_owned()]
}

const fn default_timeout_secs() -> u64 {
    900
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            descriptor: default_descriptor(),
            install: default_install(),
            build: default_build(),
            primary_output: default_primary_output(),
            alternate_outputs: default_alternate_outputs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ToolchainConfig {
    /// Per-command time limit.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Installs and builds projects.
#[derive(Clone)]
pub struct Toolchain {
    runner: Arc<dyn ProcessRunner>,
    config: ToolchainConfig,
}

impl std::fmt::Debug for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toolchain").field("config", &self.config).finish()
    }
}

impl Toolchain {
    /// Create a toolchain, validating the configured commands.
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ToolchainConfig) -> PipelineResult<Self> {
        if config.install.is_empty() || config.build.is_empty() {
            return Err(PipelineError::Config(
                "toolchain install and build commands must not be empty".to_owned(),
            ));
        }
        Ok(Self { runner, config })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// The process runner in use.
    #[must_use]
    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    /// Whether `dir` contains the project descriptor.
    #[must_use]
    pub fn has_descriptor(&self, dir: &Path) -> bool {
        dir.join(&self.config.descriptor).is_file()
    }

    /// Install dependencies and run the build script in `dir`.
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub async fn compile(&self, dir: &Path) -> PipelineResult<()> {
        if !self.has_descriptor(dir) {
            return Err(PipelineError::NotAProject {
                descriptor: self.config.descriptor.clone(),
            });
        }

        self.run_step(ToolchainStep::Install, self.argv(&self.config.install)?.current_dir(dir))
            .await?;
        self.run_step(ToolchainStep::Build, self.argv(&self.config.build)?.current_dir(dir))
            .await?;
        Ok(())
    }

    /// Output directories in search order.
    #[must_use]
    pub fn output_candidates(&self) -> Vec<String> {
        std::iter::once(self.config.primary_output.clone())
            .chain(self.config.alternate_outputs.iter().cloned())
            .collect()
    }

    /// First existing output directory under `dir`.
    #[must_use]
    pub fn locate_output(&self, dir: &Path) -> Option<PathBuf> {
        self.output_candidates()
            .into_iter()
            .map(|candidate| dir.join(candidate))
            .find(|path| path.is_dir())
    }

    /// Like [`Self::locate_output`], with a typed error when nothing exists.
    pub fn require_output(&self, dir: &Path) -> PipelineResult<PathBuf> {
        self.locate_output(dir)
            .ok_or_else(|| PipelineError::BuildOutputMissing {
                candidates: self.output_candidates(),
            })
    }

    /// Run one toolchain command, mapping failure to a toolchain error.
    pub async fn run_step(
        &self,
        step: ToolchainStep,
        command: CommandSpec,
    ) -> PipelineResult<CommandOutput> {
        let command = command.timeout(self.config.timeout());
        info!(step = %step, command = %command.display(), "running toolchain step");

        let output = self.runner.run(&command).await.map_err(|e| match e {
            ProcessError::Timeout { limit, .. } => PipelineError::Toolchain {
                step,
                exit_code: -1,
                message: format!("timed out after {limit:?}"),
            },
            other => PipelineError::Toolchain {
                step,
                exit_code: -1,
                message: other.to_string(),
            },
        })?;

        if !output.succeeded() {
            return Err(PipelineError::Toolchain {
                step,
                exit_code: output.exit_code.unwrap_or(-1),
                message: output.diagnostic_tail(),
            });
        }

        info!(
            step = %step,
            duration_secs = output.duration.as_secs_f32(),
            "toolchain step completed"
        );
        Ok(output)
    }

    fn argv(&self, argv: &[String]) -> PipelineResult<CommandSpec> {
        CommandSpec::from_argv(argv)
            .ok_or_else(|| PipelineError::Config("empty toolchain command".to_owned()))
    }
}
