//! The three responses the daemon ever writes.

use crate::error::{IngestResult, UploadError};
use crate::protocol::RESPONSE_PROTOCOL;
use crate::storage::UploadResult;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const JSON: &str = "application/json; charset=utf-8";
const TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    pub fn stored(result: &UploadResult) -> IngestResult<Self> {
        let body = serde_json::to_vec(result)
            .map_err(|e| UploadError::Internal(format!("encode result: {}", e)))?;
        Ok(Self {
            status: 200,
            content_type: JSON,
            body,
        })
    }

    pub fn bad_request() -> Self {
        Self {
            status: 400,
            content_type: TEXT,
            body: b"400 Bad Request".to_vec(),
        }
    }

    pub fn internal_error() -> Self {
        Self {
            status: 500,
            content_type: TEXT,
            body: b"Internal Server Error".to_vec(),
        }
    }

    /// Response for a failed request; `None` when the connection should be
    /// closed without one.
    pub fn for_error(err: &UploadError) -> Option<Self> {
        if err.closes_silently() {
            return None;
        }
        match err.status_code() {
            400 => Some(Self::bad_request()),
            _ => Some(Self::internal_error()),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            _ => "Internal Server Error",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "{} {} {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
            RESPONSE_PROTOCOL,
            self.status,
            self.reason(),
            self.content_type
        );
        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Write and flush the response within `deadline`.
    pub async fn send<W>(&self, writer: &mut W, deadline: Duration) -> IngestResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.to_bytes();
        match timeout(deadline, async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(UploadError::DrainTimeout(deadline)),
        }
    }
}
