//! Source fetching.
//!
//! Clones a repository into a local directory through the process runner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use launchpad_core::process::ProcessError;
use launchpad_core::{CommandSpec, PipelineError, PipelineResult, ProcessRunner, SourceUrl};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument};

/// Fetches a repository's working tree.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `url` into `dest`, which exists and is empty.
    async fn fetch(&self, url: &SourceUrl, dest: &Path) -> PipelineResult<()>;
}

/// Shallow `git clone` through a [`ProcessRunner`].
pub struct GitFetcher {
    runner: Arc<dyn ProcessRunner>,
    program: String,
    token: Option<SecretString>,
    timeout: Duration,
}

impl GitFetcher {
    /// Create a fetcher using `git` with a five minute limit.
    #[must_use]
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            program: "git".to_owned(),
            token: None,
            timeout: Duration::from_secs(300),
        }
    }

    /// Use a different git executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Authenticate with an access token.
    #[must_use]
    pub fn with_token(mut self, token: Option<SecretString>) -> Self {
        self.token = token;
        self
    }

    /// Set the clone time limit.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn scrub(&self, text: &str) -> String {
        match &self.token {
            Some(token) if !token.expose_secret().is_empty() => {
                text.replace(token.expose_secret(), "***")
            }
            _ => text.to_owned(),
        }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    #[instrument(skip(self, url, dest), fields(repo = %url.repository()))]
    async fn fetch(&self, url: &SourceUrl, dest: &Path) -> PipelineResult<()> {
        let token = self.token.as_ref().map(|t| t.expose_secret());
        let mut command = CommandSpec::new(&self.program)
            .args(["clone", "--depth", "1"])
            .arg(url.clone_url(token))
            .arg(dest.display().to_string())
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout);
        if token.is_some() {
            command = command.sensitive();
        }

        let fetch_error = |message: String| PipelineError::Fetch {
            url: url.to_string(),
            message: self.scrub(&message),
        };

        let output = self.runner.run(&command).await.map_err(|e| match e {
            ProcessError::Timeout { limit, .. } => {
                fetch_error(format!("clone timed out after {limit:?}"))
            }
            other => fetch_error(other.to_string()),
        })?;

        if !output.succeeded() {
            return Err(fetch_error(output.diagnostic_tail()));
        }

        info!(
            duration_secs = output.duration.as_secs_f32(),
            "repository cloned"
        );
        Ok(())
    }
}
