//! Persistence worker: drains a session's inbound queue to disk.
//!
//! The worker runs on the blocking pool. It talks to the session queues only
//! through the [`Bridge`], hashes every data chunk, and leaves exactly one
//! [`Outcome`] on the outbound queue, whatever happens.

use crate::bridge::Bridge;
use crate::channel::{Chunk, ChunkChannel, Outcome};
use crate::config::EmptyBodyPolicy;
use crate::error::{IngestResult, UploadError};
use crate::storage::ContentStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Persist one upload session.
///
/// Returns once an outcome has been queued on `channel.outbound`. Failures of
/// the blocking worker, including panics, are turned into
/// `Outcome::Failed` here rather than being lost with the thread.
pub async fn persist(
    channel: Arc<ChunkChannel>,
    store: ContentStore,
    bridge: Bridge,
    empty_body: EmptyBodyPolicy,
) {
    let span = tracing::Span::current();
    let idle = bridge.timeout();
    let worker_channel = Arc::clone(&channel);
    let joined = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        write_stream(&worker_channel, &store, &bridge, empty_body)
    })
    .await;

    let failure = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(join_err) => UploadError::Internal(format!("persistence worker died: {}", join_err)),
    };
    tracing::warn!(error = %failure, "persistence failed");
    // The reader may still be mid-body; it must not block on a full queue
    let stream_open = matches!(
        failure,
        UploadError::Persistence(_) | UploadError::Io(_) | UploadError::Internal(_)
    );
    if let Err(e) = channel.outbound.put(Outcome::Failed(failure)).await {
        tracing::error!(error = %e, "could not report persistence failure");
    }
    if stream_open {
        discard_rest(&channel, idle).await;
    }
}

/// Drop chunks until the stream ends or goes quiet for `idle`.
async fn discard_rest(channel: &ChunkChannel, idle: Duration) {
    let mut dropped = 0usize;
    while let Ok(Ok(Chunk::Data(data))) = tokio::time::timeout(idle, channel.inbound.get()).await {
        dropped += data.len();
    }
    tracing::debug!(dropped, "discarded unpersisted body");
}

/// Blocking body of the worker.
fn write_stream(
    channel: &Arc<ChunkChannel>,
    store: &ContentStore,
    bridge: &Bridge,
    empty_body: EmptyBodyPolicy,
) -> IngestResult<()> {
    let first = match next_chunk(channel, bridge)? {
        Chunk::Data(data) => data,
        Chunk::EndOfStream => match empty_body {
            EmptyBodyPolicy::Reject => return Err(UploadError::EmptyBody),
            EmptyBodyPolicy::Store => Bytes::new(),
        },
        Chunk::Error(reason) => return Err(UploadError::Aborted(reason)),
    };

    let mut object = store.begin(&first)?;
    tracing::debug!(path = %object.path().display(), "object opened");

    loop {
        match next_chunk(channel, bridge)? {
            Chunk::Data(data) => object.append(&data)?,
            Chunk::EndOfStream => break,
            Chunk::Error(reason) => return Err(UploadError::Aborted(reason)),
        }
    }

    let bytes = object.bytes_written();
    let result = object.finish()?;
    tracing::debug!(path = %result.path, bytes, "object written");

    let ch = Arc::clone(channel);
    bridge.call(async move { ch.outbound.put(Outcome::Stored(result)).await })?
}

fn next_chunk(channel: &Arc<ChunkChannel>, bridge: &Bridge) -> IngestResult<Chunk> {
    let ch = Arc::clone(channel);
    bridge.call(async move { ch.inbound.get().await })?
}
