//! Test doubles for delivery: a manual clock and scripted tunnel discovery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use launchpad_core::PipelineResult;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::tunnel::{TunnelDescriptor, TunnelDiscovery};

/// A clock that only moves when slept on or advanced.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Clock starting at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time slept or advanced.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Discovery answering from a script.
///
/// Each call pops the next answer; once the script runs out the last answer
/// repeats (an empty list if there never was one).
#[derive(Debug, Default)]
pub struct ScriptedDiscovery {
    script: Mutex<VecDeque<Vec<TunnelDescriptor>>>,
    last: Mutex<Vec<TunnelDescriptor>>,
    calls: AtomicUsize,
}

impl ScriptedDiscovery {
    /// Discovery answering with `answers` in order.
    #[must_use]
    pub fn new(answers: Vec<Vec<TunnelDescriptor>>) -> Self {
        Self {
            script: Mutex::new(answers.into()),
            last: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Discovery that always reports `tunnel`.
    #[must_use]
    pub fn always(tunnel: TunnelDescriptor) -> Self {
        Self::new(vec![vec![tunnel]])
    }

    /// Number of `list` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelDiscovery for ScriptedDiscovery {
    async fn list(&self) -> PipelineResult<Vec<TunnelDescriptor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(answer) = next {
            *last = answer;
        }
        Ok(last.clone())
    }
}
