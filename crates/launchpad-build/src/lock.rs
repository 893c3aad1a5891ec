//! Per-repository build serialisation.
//!
//! Builds of one repository name never overlap, because they share a working
//! directory and a destination object. Builds of different names run
//! concurrently unless the lock scope is set to [`LockScope::Global`].

use std::sync::Arc;

use dashmap::DashMap;
use launchpad_core::RepositoryName;
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// How widely build locks are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// One lock per repository name.
    #[default]
    PerRepository,
    /// One lock for every build.
    Global,
}

const GLOBAL_KEY: &str = "*";

/// Table of per-key async mutexes.
#[derive(Debug)]
pub struct BuildLocks {
    scope: LockScope,
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl BuildLocks {
    /// Create an empty table.
    #[must_use]
    pub fn new(scope: LockScope) -> Self {
        Self {
            scope,
            table: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive use of `name`.
    pub async fn acquire(&self, name: &RepositoryName) -> BuildPermit {
        let key = match self.scope {
            LockScope::PerRepository => name.as_str().to_owned(),
            LockScope::Global => GLOBAL_KEY.to_owned(),
        };
        let mutex = Arc::clone(self.table.entry(key.clone()).or_default().value());

        debug!(key = %key, "waiting for build lock");
        let guard = mutex.lock_owned().await;
        debug!(key = %key, "build lock acquired");

        BuildPermit {
            key,
            table: Arc::clone(&self.table),
            _guard: guard,
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Exclusive use of one key, released on drop.
#[derive(Debug)]
pub struct BuildPermit {
    key: String,
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for BuildPermit {
    fn drop(&mut self) {
        // Two references remain when nobody else waits: the table's and the
        // guard's. Waiters hold a third.
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}
