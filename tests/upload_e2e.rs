use anyhow::Result;
use hashsink::{serve_listener, EmptyBodyPolicy, ServerConfig, ServerContext};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Deterministic body of `size` bytes.
fn pattern(size: usize) -> Vec<u8> {
    let mut val: u8 = 0;
    (0..size)
        .map(|_| {
            let b = val;
            val = val.wrapping_add(7);
            b
        })
        .collect()
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn test_config(root: &Path) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        root: root.to_path_buf(),
        header_timeout: Duration::from_millis(500),
        bridge_timeout: Duration::from_secs(5),
        stats_interval: None,
        ..ServerConfig::default()
    }
}

async fn start(root: &Path, empty_body: EmptyBodyPolicy) -> Result<TestServer> {
    start_with(ServerConfig {
        empty_body,
        ..test_config(root)
    })
    .await
}

async fn start_with(config: ServerConfig) -> Result<TestServer> {
    let ctx = Arc::new(ServerContext::new(config)?);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_ctx = Arc::clone(&ctx);
    let task = tokio::spawn(async move {
        let _ = serve_listener(listener, server_ctx, std::future::pending()).await;
    });
    Ok(TestServer { addr, ctx, task })
}

/// Send `request` in one go and read the response until the server closes.
async fn send_raw(addr: SocketAddr, request: &[u8]) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request).await?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    let text = String::from_utf8(out)?;
    let status = text
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn post(body: &[u8]) -> Vec<u8> {
    let mut req = format!(
        "POST /upload HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(body);
    req
}

fn stored_files(root: &Path) -> usize {
    std::fs::read_dir(root).map(|rd| rd.count()).unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_is_stored_under_its_digest() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    let (status, body) =
        send_raw(srv.addr, b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await?;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(json["file_hash_md5"], "5d41402abc4b2a76b9719d911017c592");
    let path = json["path"].as_str().unwrap_or_default();
    assert!(path.ends_with("/5d41402abc4b2a76b9719d911017c592"));
    assert_eq!(std::fs::read(path)?, b"hello");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn path_follows_first_chunk_digest_follows_whole_body() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    for size in [1usize, 16383, 16384, 16385, 3 * 16384, 1_100_000] {
        let data = pattern(size);
        let (status, body) = send_raw(srv.addr, &post(&data)).await?;
        assert_eq!(status, 200, "size {size}");
        let json: serde_json::Value = serde_json::from_str(&body)?;
        assert_eq!(json["file_hash_md5"], md5_hex(&data), "size {size}");
        let key = md5_hex(&data[..size.min(16384)]);
        let path = json["path"].as_str().unwrap_or_default().to_string();
        assert!(path.ends_with(&key), "size {size}");
        assert_eq!(std::fs::read(&path)?.len(), size, "size {size}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_content_twice_gives_same_answer() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;
    let data = pattern(50_000);

    let (_, first) = send_raw(srv.addr, &post(&data)).await?;
    let (_, second) = send_raw(srv.addr, &post(&data)).await?;
    assert_eq!(first, second);
    assert_eq!(stored_files(tmp.path()), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_uploads_are_independent() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    let mut tasks = Vec::new();
    for i in 0..8usize {
        let addr = srv.addr;
        tasks.push(tokio::spawn(async move {
            let mut data = pattern(20_000 + i * 1000);
            data[0] = i as u8;
            let (status, body) = send_raw(addr, &post(&data)).await?;
            Ok::<_, anyhow::Error>((status, body, md5_hex(&data)))
        }));
    }
    for t in tasks {
        let (status, body, expected) = t.await??;
        assert_eq!(status, 200);
        assert!(body.contains(&expected));
    }
    assert_eq!(stored_files(tmp.path()), 8);

    let counts = srv.ctx.registry().snapshot();
    assert_eq!(counts.completed, 8);
    assert_eq!(counts.sessions, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_post_methods_are_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    for method in ["GET", "PUT", "DELETE", "post"] {
        let req = format!("{method} /upload HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        let (status, body) = send_raw(srv.addr, req.as_bytes()).await?;
        assert_eq!(status, 400, "{method}");
        assert_eq!(body, "400 Bad Request");
    }
    assert_eq!(stored_files(tmp.path()), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_request_line_is_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    let (status, _) = send_raw(srv.addr, b"GET/\r\n\r\n").await?;
    assert_eq!(status, 400);
    assert_eq!(stored_files(tmp.path()), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_content_length_is_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    let (status, _) = send_raw(srv.addr, b"POST / HTTP/1.1\r\n\r\n").await?;
    assert_eq!(status, 400);
    let (status, _) =
        send_raw(srv.addr, b"POST / HTTP/1.1\r\nContent-Length: five\r\n\r\n").await?;
    assert_eq!(status, 400);
    assert_eq!(stored_files(tmp.path()), 0);
    assert_eq!(srv.ctx.registry().snapshot().sessions, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_body_policies() -> Result<()> {
    let rejecting = tempfile::tempdir()?;
    let srv = start(rejecting.path(), EmptyBodyPolicy::Reject).await?;
    let (status, _) = send_raw(srv.addr, &post(b"")).await?;
    assert_eq!(status, 400);
    assert_eq!(stored_files(rejecting.path()), 0);

    let storing = tempfile::tempdir()?;
    let srv = start(storing.path(), EmptyBodyPolicy::Store).await?;
    let (status, body) = send_raw(srv.addr, &post(b"")).await?;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(json["file_hash_md5"], "d41d8cd98f00b204e9800998ecf8427e");
    assert!(storing.path().join("d41d8cd98f00b204e9800998ecf8427e").is_file());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_closing_early_stores_what_arrived() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    let mut stream = TcpStream::connect(srv.addr).await?;
    stream
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nonly ten b")
        .await?;
    stream.shutdown().await?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    let text = String::from_utf8(out)?;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains(&md5_hex(b"only ten b")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incomplete_headers_close_without_response() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;

    let mut stream = TcpStream::connect(srv.addr).await?;
    stream.write_all(b"POST / HTTP/1.1\r\nContent-Len").await?;
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut out)).await??;
    assert!(out.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_body_is_streamed_in_pieces() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start(tmp.path(), EmptyBodyPolicy::Reject).await?;
    let data = pattern(40_000);

    let mut stream = TcpStream::connect(srv.addr).await?;
    let head = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", data.len());
    stream.write_all(head.as_bytes()).await?;
    for piece in data.chunks(5000) {
        stream.write_all(piece).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    let text = String::from_utf8(out)?;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains(&md5_hex(&data)));
    assert!(tmp.path().join(md5_hex(&data[..16384])).is_file());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn vanished_storage_root_answers_internal_error() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("objects");
    let srv = start_with(test_config(&root)).await?;
    std::fs::remove_dir(&root)?;

    let data = pattern(200_000);
    let mut stream = TcpStream::connect(srv.addr).await?;
    stream.write_all(&post(&data)).await?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    let text = String::from_utf8(out)?;
    assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
    assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
    assert!(text.ends_with("\r\n\r\nInternal Server Error"));

    let counts = srv.ctx.registry().snapshot();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.completed, 0);
    assert!(!root.exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_peer_mid_body_is_answered_and_closed() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let srv = start_with(ServerConfig {
        bridge_timeout: Duration::from_millis(300),
        ..test_config(tmp.path())
    })
    .await?;

    let mut stream = TcpStream::connect(srv.addr).await?;
    stream
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\nabc")
        .await?;
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await??;
    let text = String::from_utf8(out)?;
    assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
    assert!(text.ends_with("Internal Server Error"));

    let counts = srv.ctx.registry().snapshot();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.sessions, 0);
    Ok(())
}
