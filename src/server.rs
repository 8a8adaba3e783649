//! Upload daemon: accept loop and per-connection handling.
//!
//! Each connection is one task that walks
//! `AwaitingHeaders → Routing → StreamingBody → AwaitingPersistResult →
//! Responding → Closed`. Body chunks go to a persistence worker on the
//! blocking pool through the session's [`ChunkChannel`]; the stream itself is
//! owned by the task and dropped exactly once when it returns.

use crate::bridge::Bridge;
use crate::channel::{Chunk, ChunkChannel, Outcome};
use crate::config::ServerConfig;
use crate::error::{ErrorClass, IngestResult, UploadError};
use crate::protocol::UPLOAD_METHOD;
use crate::request::{read_raw_headers, ParsedRequest};
use crate::response::Response;
use crate::stats::{self, LiveRegistry, SessionGuard};
use crate::storage::{ContentStore, UploadResult};
use crate::worker;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AwaitingHeaders,
    Routing,
    StreamingBody,
    AwaitingPersistResult,
    Responding,
    Closed,
}

/// Shared state for every connection of one server.
#[derive(Debug)]
pub struct ServerContext {
    config: ServerConfig,
    store: ContentStore,
    registry: Arc<LiveRegistry>,
}

impl ServerContext {
    /// Opens (and creates if needed) the storage root.
    pub fn new(config: ServerConfig) -> IngestResult<Self> {
        let store = ContentStore::open(&config.root)?;
        Ok(Self {
            config,
            store,
            registry: Arc::new(LiveRegistry::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<LiveRegistry> {
        &self.registry
    }
}

/// Bind `config.bind` and serve until `shutdown` resolves.
pub async fn serve<F>(ctx: Arc<ServerContext>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let bind = ctx.config.bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {}", bind))?;
    serve_listener(listener, ctx, shutdown).await
}

/// Serve connections from an already bound listener until `shutdown`
/// resolves. Connections in flight keep running on their own tasks.
pub async fn serve_listener<F>(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let local = listener.local_addr().context("listener address")?;
    tracing::info!(
        addr = %local,
        root = %ctx.store.root().display(),
        "upload daemon listening"
    );
    let reporter = ctx
        .config
        .stats_interval
        .map(|every| stats::spawn_reporter(Arc::clone(&ctx.registry), every));

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, %peer, "could not set TCP_NODELAY");
                }
                let ctx = Arc::clone(&ctx);
                let span = tracing::info_span!("conn", %peer);
                tokio::spawn(async move { handle_connection(stream, &ctx).await }.instrument(span));
            }
        }
    }

    if let Some(task) = reporter {
        task.abort();
    }
    tracing::info!(addr = %local, "upload daemon stopped");
    Ok(())
}

/// Run one connection to completion and close it.
pub async fn handle_connection<S>(stream: S, ctx: &ServerContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _live = ctx.registry.connection();
    let mut conn = BufReader::with_capacity(ctx.config.chunk_size, stream);
    let mut phase = Phase::AwaitingHeaders;

    let response = match process(&mut conn, ctx, &mut phase).await {
        Ok((result, bytes)) => {
            ctx.registry.record_stored(bytes);
            tracing::info!(path = %result.path, digest = %result.file_hash_md5, bytes, "upload stored");
            Response::stored(&result).unwrap_or_else(|e| {
                tracing::error!(error = %e, "could not encode result");
                Response::internal_error()
            })
        }
        Err(err) => {
            if phase >= Phase::StreamingBody {
                ctx.registry.record_failed();
            }
            log_failure(&err, phase);
            match Response::for_error(&err) {
                Some(r) => r,
                None => {
                    tracing::debug!(phase = ?Phase::Closed, "closed without response");
                    return;
                }
            }
        }
    };

    phase = Phase::Responding;
    if let Err(e) = response.send(conn.get_mut(), ctx.config.drain_timeout).await {
        tracing::warn!(error = %e, status = response.status(), "response not delivered");
    }
    let _ = conn.get_mut().shutdown().await;
    tracing::debug!(from = ?phase, phase = ?Phase::Closed, "connection closed");
}

fn log_failure(err: &UploadError, phase: Phase) {
    match err.class() {
        ErrorClass::Protocol | ErrorClass::UnsupportedFeature => {
            tracing::info!(error = %err, ?phase, "request rejected")
        }
        ErrorClass::Timeout => tracing::warn!(error = %err, ?phase, "request timed out"),
        ErrorClass::Persistence | ErrorClass::Internal => {
            tracing::error!(error = %err, ?phase, "request failed")
        }
    }
}

async fn process<S>(
    conn: &mut BufReader<S>,
    ctx: &ServerContext,
    phase: &mut Phase,
) -> IngestResult<(UploadResult, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let raw = read_raw_headers(conn, ctx.config.header_timeout, ctx.config.max_header_bytes).await?;
    let request = ParsedRequest::parse(&raw)?;

    *phase = Phase::Routing;
    tracing::debug!(method = request.method(), target = request.target(), "request received");
    route(&request)?;
    let declared = request.content_length()?;

    *phase = Phase::StreamingBody;
    stream_body(conn, declared, ctx, phase).await
}

/// Only raw-body POSTs reach the streaming path.
fn route(request: &ParsedRequest) -> IngestResult<()> {
    if request.method() != UPLOAD_METHOD {
        return Err(UploadError::UnsupportedMethod(request.method().to_string()));
    }
    match request.multipart_subtype() {
        Ok(Some(subtype)) => Err(UploadError::Unsupported(format!(
            "multipart/{} request bodies",
            subtype
        ))),
        // No Content-Type: treat the body as opaque bytes
        Ok(None) | Err(UploadError::MissingContentType) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reading-side half of one upload.
struct StreamSession {
    id: Uuid,
    channel: Arc<ChunkChannel>,
    received: u64,
    put_deadline: Duration,
    _live: SessionGuard,
}

impl StreamSession {
    fn open(ctx: &ServerContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: Arc::new(ChunkChannel::new(ctx.config.queue_capacity)),
            received: 0,
            put_deadline: ctx.config.bridge_timeout,
            _live: ctx.registry.session(),
        }
    }

    /// Queue a chunk for the worker. Bounded so that a dead worker can not
    /// leave the reader waiting on a full queue forever.
    async fn push(&self, chunk: Chunk) -> IngestResult<()> {
        match timeout(self.put_deadline, self.channel.inbound.put(chunk)).await {
            Ok(res) => res,
            Err(_) => Err(UploadError::BridgeTimeout(self.put_deadline)),
        }
    }
}

async fn stream_body<R>(
    reader: &mut R,
    declared: u64,
    ctx: &ServerContext,
    phase: &mut Phase,
) -> IngestResult<(UploadResult, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut session = StreamSession::open(ctx);
    let span = tracing::info_span!("session", id = %session.id, declared);
    let worker = tokio::spawn(
        worker::persist(
            Arc::clone(&session.channel),
            ctx.store.clone(),
            Bridge::current(ctx.config.bridge_timeout),
            ctx.config.empty_body,
        )
        .instrument(span.clone()),
    );

    let pumped = pump_body(reader, &mut session, declared, ctx.config.chunk_size)
        .instrument(span)
        .await;
    if let Err(e) = &pumped {
        // Stop the worker; its Aborted report is superseded by `e`
        if let Err(push_err) = session.push(Chunk::Error(Some(e.to_string()))).await {
            tracing::warn!(error = %push_err, "could not cancel persistence worker");
        }
    }

    *phase = Phase::AwaitingPersistResult;
    let outcome = session.channel.outbound.get().await;
    if let Err(join_err) = worker.await {
        return Err(UploadError::Internal(format!("persistence task: {}", join_err)));
    }
    pumped?;

    match outcome? {
        Outcome::Stored(result) => Ok((result, session.received)),
        Outcome::Failed(e) => Err(e),
    }
}

/// Move up to `declared` body bytes into the session, then end the stream.
/// A peer that sends nothing for the session's put deadline fails the read.
async fn pump_body<R>(
    reader: &mut R,
    session: &mut StreamSession,
    declared: u64,
    chunk_size: usize,
) -> IngestResult<()>
where
    R: AsyncRead + Unpin,
{
    while session.received < declared {
        let want = (declared - session.received).min(chunk_size as u64) as usize;
        let chunk = read_chunk(reader, want, session.put_deadline).await?;
        if chunk.is_empty() {
            tracing::warn!(
                received = session.received,
                declared,
                "peer closed before declared length"
            );
            break;
        }
        session.received += chunk.len() as u64;
        session.push(Chunk::Data(chunk)).await?;
    }
    session.push(Chunk::EndOfStream).await
}

/// Read exactly `want` bytes unless the peer closes first. Each read must
/// make progress within `idle`.
async fn read_chunk<R>(reader: &mut R, want: usize, idle: Duration) -> IngestResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = match timeout(idle, reader.read(&mut buf[filled..])).await {
            Ok(read) => read?,
            Err(_) => return Err(UploadError::BodyReadTimeout(idle)),
        };
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}
