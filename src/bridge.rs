//! Calls from a blocking worker thread into the async runtime.
//!
//! The persistence worker runs on tokio's blocking pool and must never poll
//! the session queues itself. Each queue operation is instead spawned onto the
//! runtime that owns the connection, and the worker thread parks until the
//! result comes back over a rendezvous channel or the deadline passes.

use crate::error::{IngestResult, UploadError};
use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Debug, Clone)]
pub struct Bridge {
    handle: Handle,
    timeout: Duration,
}

impl Bridge {
    pub fn new(handle: Handle, timeout: Duration) -> Self {
        Self { handle, timeout }
    }

    /// Bridge onto the runtime the caller is currently running in.
    pub fn current(timeout: Duration) -> Self {
        Self::new(Handle::current(), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` on the runtime and block this thread until it finishes.
    ///
    /// Must be called from a thread that is not driving the runtime
    /// (`spawn_blocking` or a plain OS thread). On timeout the spawned task is
    /// aborted and `BridgeTimeout` is returned.
    pub fn call<F, T>(&self, op: F) -> IngestResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<T>(1);
        let task = self.handle.spawn(async move {
            let _ = tx.send(op.await);
        });
        match rx.recv_timeout(self.timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                task.abort();
                Err(UploadError::BridgeTimeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(UploadError::Internal(
                "bridged task dropped before completing".into(),
            )),
        }
    }
}
