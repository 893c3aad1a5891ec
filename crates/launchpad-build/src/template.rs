//! Starter-template scaffolding.
//!
//! Used when a build is requested for a repository with no stored source.

use std::path::Path;

use launchpad_core::error::ToolchainStep;
use launchpad_core::{CommandSpec, PipelineError, PipelineResult, TemplateKind, Toolchain};
use tracing::{info, instrument};

/// Creates new projects from starter templates.
#[derive(Debug, Clone)]
pub struct Scaffolder {
    toolchain: Toolchain,
}

impl Scaffolder {
    /// Create a scaffolder that runs its generators through `toolchain`.
    #[must_use]
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    /// The generator command for `kind`, creating the project at `dir`.
    ///
    /// `create-react-app` and `create-next-app` take the target directory as
    /// an argument and run from its parent. The Vite generator writes into
    /// its working directory.
    pub fn command(kind: TemplateKind, dir: &Path) -> PipelineResult<CommandSpec> {
        let parent = dir.parent().ok_or_else(|| {
            PipelineError::Internal(format!("{} has no parent directory", dir.display()))
        })?;
        let target = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::Internal(format!("invalid target {}", dir.display())))?;

        let command = match kind {
            TemplateKind::CreateReactApp => CommandSpec::new("npx")
                .args(["create-react-app", target])
                .current_dir(parent),
            TemplateKind::Next => CommandSpec::new("npx")
                .args(["create-next-app@latest", target, "--use-npm", "--yes"])
                .current_dir(parent),
            TemplateKind::Vite => CommandSpec::new("npm")
                .args(["init", "vite@latest", ".", "--", "--template", "react"])
                .current_dir(dir),
        };
        Ok(command.env("CI", "true"))
    }

    /// Scaffold a `kind` project into `dir`.
    ///
    /// `dir` is created fresh; anything already there is removed first.
    #[instrument(skip(self), fields(template = %kind, dir = %dir.display()))]
    pub async fn scaffold(&self, kind: TemplateKind, dir: &Path) -> PipelineResult<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if kind == TemplateKind::Vite {
            tokio::fs::create_dir_all(dir).await?;
        } else if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let command = Self::command(kind, dir)?;
        self.toolchain.run_step(ToolchainStep::Scaffold, command).await?;

        if !dir.is_dir() {
            return Err(PipelineError::Toolchain {
                step: ToolchainStep::Scaffold,
                exit_code: 0,
                message: format!("generator did not create {}", dir.display()),
            });
        }

        info!("project scaffolded from template");
        Ok(())
    }
}
