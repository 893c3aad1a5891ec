//! Scratch directory ownership and path confinement.
//!
//! Each stage owns the paths it creates under the workspace root. It removes
//! them with [`ScopedPath::cleanup`], or when the guard is dropped.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

/// Join `relative` onto `root`, refusing anything that leaves `root`.
///
/// Only plain path components are accepted. When the joined path already
/// exists its canonical form must still be under the canonical root, which
/// catches escapes through symlinks.
pub fn resolve_within(root: &Path, relative: impl AsRef<Path>) -> PipelineResult<PathBuf> {
    let relative = relative.as_ref();
    let escape = || PipelineError::PathEscape {
        root: root.display().to_string(),
        path: relative.display().to_string(),
    };

    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape())
            }
        }
    }

    if joined.exists() {
        let canonical_root = root.canonicalize()?;
        let canonical = joined.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(escape());
        }
    }
    Ok(joined)
}

/// A stage's scratch area under the workspace root.
#[derive(Debug, Clone)]
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    /// Scratch area rooted at `root`, which is created if missing.
    pub fn new(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The scratch root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A nested scratch area.
    pub fn child(&self, relative: impl AsRef<Path>) -> PipelineResult<Self> {
        Self::new(resolve_within(&self.root, relative)?)
    }

    /// Create an empty directory, replacing anything left at that path.
    pub async fn fresh_dir(&self, relative: impl AsRef<Path>) -> PipelineResult<ScopedPath> {
        let path = resolve_within(&self.root, relative)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale scratch directory"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(ScopedPath::new(path, PathKind::Dir))
    }

    /// Reserve a file path. The file itself is not created.
    pub fn file(&self, relative: impl AsRef<Path>) -> PipelineResult<ScopedPath> {
        let path = resolve_within(&self.root, relative)?;
        Ok(ScopedPath::new(path, PathKind::File))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    File,
    Dir,
}

/// A path that is deleted when the guard is dropped.
#[derive(Debug)]
pub struct ScopedPath {
    path: PathBuf,
    kind: PathKind,
    armed: bool,
}

impl ScopedPath {
    fn new(path: PathBuf, kind: PathKind) -> Self {
        Self {
            path,
            kind,
            armed: true,
        }
    }

    /// Take ownership of a directory created elsewhere.
    #[must_use]
    pub fn adopt_dir(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), PathKind::Dir)
    }

    /// The guarded path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the path on disk and release the guard.
    #[must_use]
    pub fn persist(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Remove the path now, off the async worker threads.
    pub async fn cleanup(mut self) {
        self.armed = false;
        let path = std::mem::take(&mut self.path);
        let result = match self.kind {
            PathKind::Dir => tokio::fs::remove_dir_all(&path).await,
            PathKind::File => tokio::fs::remove_file(&path).await,
        };
        report_removal(&path, result);
    }
}

fn remove_blocking(path: &Path, kind: PathKind) {
    let result = match kind {
        PathKind::Dir => std::fs::remove_dir_all(path),
        PathKind::File => std::fs::remove_file(path),
    };
    report_removal(path, result);
}

fn report_removal(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %path.display(), "cleaned up scratch path"),
        Err(e) if e.kind() == IoErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to clean up scratch path"),
    }
}

impl AsRef<Path> for ScopedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedPath {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let kind = self.kind;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || remove_blocking(&path, kind));
            }
            Err(_) => remove_blocking(&path, kind),
        }
    }
}
