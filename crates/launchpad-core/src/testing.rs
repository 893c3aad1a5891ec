//! Test doubles for the pipeline's external seams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::process::{CommandOutput, CommandSpec, ProcessError, ProcessHandle, ProcessRunner};
use crate::storage::{ObjectArtifactStore, StorageConfig};

type Script = dyn Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync;

/// A [`ProcessRunner`] that answers from a closure and records every call.
///
/// The closure runs synchronously and may touch the filesystem, which is how
/// tests stand in for `git clone` or `npm run build` producing files.
pub struct ScriptedRunner {
    script: Box<Script>,
    calls: Mutex<Vec<CommandSpec>>,
    spawned: Mutex<Vec<SpawnedProcess>>,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedRunner {
    /// Runner answering with `script`.
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Runner where every command succeeds with no output.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::new(|_| Ok(CommandOutput::success("")))
    }

    /// Commands passed to `run`, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Programs passed to `run`, in order.
    #[must_use]
    pub fn programs(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.program.clone()).collect()
    }

    /// Processes started through `spawn`.
    #[must_use]
    pub fn spawned(&self) -> Vec<SpawnedProcess> {
        self.spawned.lock().clone()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.calls.lock().push(command.clone());
        (self.script)(command)
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let process = SpawnedProcess {
            command: command.clone(),
            running: Arc::new(AtomicBool::new(true)),
        };
        self.spawned.lock().push(process.clone());
        Ok(Box::new(FakeHandle {
            running: process.running,
        }))
    }
}

/// A process started by [`ScriptedRunner::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnedProcess {
    /// The command that was spawned.
    pub command: CommandSpec,
    running: Arc<AtomicBool>,
}

impl SpawnedProcess {
    /// Whether the handle has not been terminated.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct FakeHandle {
    running: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Artifact store on the in-memory backend.
#[must_use]
pub fn memory_store(bucket: &str) -> Arc<ObjectArtifactStore> {
    Arc::new(ObjectArtifactStore::new(StorageConfig::memory(bucket)))
}
