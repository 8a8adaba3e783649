//! Live resource accounting and the periodic reporter.
//!
//! Every open connection and upload session registers here through a guard
//! that unregisters on drop. The counters are observational only; nothing in
//! the upload path reads them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct LiveRegistry {
    readers: AtomicUsize,
    writers: AtomicUsize,
    sessions: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_stored: AtomicU64,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveCounts {
    pub readers: usize,
    pub writers: usize,
    pub sessions: usize,
    pub completed: u64,
    pub failed: u64,
    pub bytes_stored: u64,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register both halves of a connection for as long as the guard lives.
    pub fn connection(self: &Arc<Self>) -> ConnectionGuard {
        self.readers.fetch_add(1, Ordering::Relaxed);
        self.writers.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            registry: Arc::clone(self),
        }
    }

    /// Register an upload session for as long as the guard lives.
    pub fn session(self: &Arc<Self>) -> SessionGuard {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            registry: Arc::clone(self),
        }
    }

    pub fn record_stored(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LiveCounts {
        LiveCounts {
            readers: self.readers.load(Ordering::Relaxed),
            writers: self.writers.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<LiveRegistry>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.readers.fetch_sub(1, Ordering::Relaxed);
        self.registry.writers.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<LiveRegistry>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Log a snapshot every `interval` until the returned task is aborted.
pub fn spawn_reporter(registry: Arc<LiveRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let c = registry.snapshot();
            tracing::info!(
                readers = c.readers,
                writers = c.writers,
                sessions = c.sessions,
                completed = c.completed,
                failed = c.failed,
                bytes_stored = c.bytes_stored,
                "live resources"
            );
        }
    })
}
