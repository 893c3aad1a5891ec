//! External process execution.
//!
//! Stages never spawn processes directly. They describe a command as a
//! [`CommandSpec`] and hand it to a [`ProcessRunner`], which lets tests
//! substitute scripted behaviour for git, npm and the tunnel agent.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Lines of stderr kept for error messages.
pub const STDERR_TAIL_LINES: usize = 20;

/// Errors from running a process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The process exceeded its time limit and was killed.
    #[error("{program} timed out after {limit:?}")]
    Timeout {
        /// Program name.
        program: String,
        /// Limit that elapsed.
        limit: Duration,
    },

    /// Waiting on the process failed.
    #[error("process error: {0}")]
    Io(#[from] std::io::Error),
}

/// Description of a command to run.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Time limit for [`ProcessRunner::run`].
    pub timeout: Duration,
    /// Arguments contain credentials and must not be logged.
    pub sensitive: bool,
}

impl CommandSpec {
    /// Create a command with a five minute time limit.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(300),
            sensitive: false,
        }
    }

    /// Build a command from a program-plus-arguments list.
    ///
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the time limit.
    #[must_use]
    pub const fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    /// Mark the arguments as containing credentials.
    #[must_use]
    pub const fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Loggable form of the command line.
    #[must_use]
    pub fn display(&self) -> String {
        if self.sensitive {
            format!("{} <redacted>", self.program)
        } else {
            std::iter::once(self.program.as_str())
                .chain(self.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    fn to_command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.display())
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Output of a completed process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr.
    #[must_use]
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Whether the process exited with status zero.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// The last lines of stderr, or stdout when stderr is empty.
    #[must_use]
    pub fn diagnostic_tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail_lines(source, STDERR_TAIL_LINES)
    }
}

/// Keep the last `n` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Handle to a long-lived child process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Whether the process is still running.
    fn is_running(&mut self) -> bool;

    /// Kill the process and wait for it to exit.
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// Runs external commands.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion under its time limit.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError>;

    /// Start a long-lived command and return a handle to it.
    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    /// Create a runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn spawn_line_reader<R>(stream: Option<R>, program: String, label: &'static str) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = Vec::new();
        if let Some(stream) = stream {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(program = %program, stream = label, "{line}");
                lines.push(line);
            }
        }
        lines
    })
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        debug!(command = %command.display(), cwd = ?command.cwd, "spawning process");
        let start = Instant::now();

        let mut child = command
            .to_command()
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let mut stdout_task =
            spawn_line_reader(child.stdout.take(), command.program.clone(), "stdout");
        let mut stderr_task =
            spawn_line_reader(child.stderr.take(), command.program.clone(), "stderr");

        // The limit covers the readers too. A background process that inherits
        // the pipes keeps them open after the child itself has exited.
        let collect = async {
            let status = child.wait().await?;
            let stdout = (&mut stdout_task).await.unwrap_or_default().join("\n");
            let stderr = (&mut stderr_task).await.unwrap_or_default().join("\n");
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };
        let outcome = timeout(command.timeout, collect).await;

        let (status, stdout, stderr) = match outcome {
            Ok(collected) => collected?,
            Err(_) => {
                warn!(command = %command.display(), limit = ?command.timeout, "process timed out");
                stdout_task.abort();
                stderr_task.abort();
                child.kill().await.ok();
                return Err(ProcessError::Timeout {
                    program: command.program.clone(),
                    limit: command.timeout,
                });
            }
        };

        let duration = start.elapsed();

        debug!(
            command = %command.display(),
            exit_code = ?status.code(),
            duration_secs = duration.as_secs_f32(),
            "process exited"
        );

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration,
        })
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let mut child = command
            .to_command()
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        // Drain output so the child never blocks on a full pipe.
        let _ = spawn_line_reader(child.stdout.take(), command.program.clone(), "stdout");
        let _ = spawn_line_reader(child.stderr.take(), command.program.clone(), "stderr");

        info!(command = %command.display(), pid = ?child.id(), "process started");
        Ok(Box::new(TokioProcessHandle { child }))
    }
}

struct TokioProcessHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            self.child.kill().await?;
        }
        Ok(())
    }
}
