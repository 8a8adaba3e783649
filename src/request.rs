//! Request line and header block parsing.
//!
//! Only the subset of HTTP/1.x framing needed by the upload path is
//! understood: one request line, a header block terminated by an empty line,
//! and a body whose size is given by `Content-Length`.

use crate::error::{IngestResult, UploadError};
use crate::protocol::{header, HEADER_DELIMITER, LINE_TERMINATOR};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::time::timeout;

/// Read from `reader` until the blank line that ends the header block.
///
/// Bytes after the delimiter stay buffered in `reader` and are the start of
/// the body. Fails with `HeaderReadTimeout` when the whole block does not
/// arrive within `deadline`.
pub async fn read_raw_headers<R>(
    reader: &mut R,
    deadline: Duration,
    max_bytes: usize,
) -> IngestResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    match timeout(deadline, read_until_delimiter(reader, max_bytes)).await {
        Ok(res) => res,
        Err(_) => Err(UploadError::HeaderReadTimeout(deadline)),
    }
}

async fn read_until_delimiter<R>(reader: &mut R, max_bytes: usize) -> IngestResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(1024);
    loop {
        // One byte past the cap is enough to know the block is too large
        let budget = (max_bytes.saturating_sub(raw.len()) + 1) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(UploadError::IncompleteHeaders);
        }
        if raw.ends_with(HEADER_DELIMITER) {
            return Ok(raw);
        }
        if raw.len() > max_bytes {
            return Err(UploadError::HeaderTooLarge { limit: max_bytes });
        }
    }
}

/// A request line plus header fields.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    raw: Vec<u8>,
    method: String,
    target: String,
    protocol: String,
    headers: HashMap<String, String>,
}

impl ParsedRequest {
    /// Parse a buffer holding a complete request line and header block.
    pub fn parse(raw: &[u8]) -> IngestResult<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            UploadError::MalformedRequestLine(String::from_utf8_lossy(raw).into_owned())
        })?;
        let block = text
            .strip_suffix(LINE_TERMINATOR)
            .filter(|b| b.ends_with(LINE_TERMINATOR))
            .ok_or_else(|| UploadError::MalformedHeader("header block not terminated".into()))?;

        let (request_line, header_block) = match block.split_once(LINE_TERMINATOR) {
            Some(parts) => parts,
            None => (block, ""),
        };
        let (method, target, protocol) = split_request_line(request_line)?;
        let headers = parse_header_block(header_block)?;

        Ok(Self {
            raw: raw.to_vec(),
            method: method.to_string(),
            target: target.to_string(),
            protocol: protocol.to_string(),
            headers,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn raw_headers(&self) -> &[u8] {
        &self.raw
    }

    /// All header fields keyed by lower-cased name.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Declared body length. Only plain decimal digits are accepted.
    pub fn content_length(&self) -> IngestResult<u64> {
        let value = self
            .header(header::CONTENT_LENGTH)
            .ok_or(UploadError::InvalidContentLength(None))?;
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(UploadError::InvalidContentLength(Some(value.to_string())));
        }
        value
            .parse::<u64>()
            .map_err(|_| UploadError::InvalidContentLength(Some(value.to_string())))
    }

    /// Whether `Content-Type` names a `multipart/*` media type.
    pub fn is_multipart(&self) -> IngestResult<bool> {
        Ok(self.multipart_subtype()?.is_some())
    }

    /// The subtype of a `multipart/*` body (`form-data`, `mixed`, ...).
    pub fn multipart_subtype(&self) -> IngestResult<Option<String>> {
        let content_type = self
            .header(header::CONTENT_TYPE)
            .ok_or(UploadError::MissingContentType)?;
        let media = content_type.split(';').next().unwrap_or("").trim();
        match media.split_once('/') {
            Some((top, sub)) if top.trim().eq_ignore_ascii_case("multipart") => {
                Ok(Some(sub.trim().to_ascii_lowercase()))
            }
            _ => Ok(None),
        }
    }
}

fn split_request_line(line: &str) -> IngestResult<(&str, &str, &str)> {
    let parts: Vec<&str> = line.split(' ').collect();
    match parts.as_slice() {
        [method, target, protocol]
            if !method.is_empty() && !target.is_empty() && !protocol.is_empty() =>
        {
            Ok((method, target, protocol))
        }
        _ => Err(UploadError::MalformedRequestLine(line.to_string())),
    }
}

fn parse_header_block(block: &str) -> IngestResult<HashMap<String, String>> {
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut last: Option<String> = None;

    for line in block.split(LINE_TERMINATOR) {
        if line.is_empty() {
            continue;
        }
        // Obsolete line folding: continuation of the previous value
        if line.starts_with(' ') || line.starts_with('\t') {
            let key = last
                .as_ref()
                .ok_or_else(|| UploadError::MalformedHeader(line.to_string()))?;
            if let Some(value) = headers.get_mut(key) {
                let more = line.trim();
                if !more.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(more);
                }
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| UploadError::MalformedHeader(line.to_string()))?;
        let name = name.trim_end();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(UploadError::MalformedHeader(line.to_string()));
        }
        let key = name.to_ascii_lowercase();
        headers.insert(key.clone(), value.trim().to_string());
        last = Some(key);
    }
    Ok(headers)
}
