//! Upload error taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Every way an upload connection can fail.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("connection closed before the header block was complete")]
    IncompleteHeaders,

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("missing Content-Type header")]
    MissingContentType,

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(Option<String>),

    #[error("request body is empty")]
    EmptyBody,

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("header read timeout ({} ms)", .0.as_millis())]
    HeaderReadTimeout(Duration),

    #[error("body read timeout ({} ms)", .0.as_millis())]
    BodyReadTimeout(Duration),

    #[error("bridge call timeout ({} ms)", .0.as_millis())]
    BridgeTimeout(Duration),

    #[error("response drain timeout ({} ms)", .0.as_millis())]
    DrainTimeout(Duration),

    #[error("upload aborted: {}", .0.as_deref().unwrap_or("no reason given"))]
    Aborted(Option<String>),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    UnsupportedFeature,
    Persistence,
    Timeout,
    Internal,
}

impl UploadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MalformedRequestLine(_)
            | Self::MalformedHeader(_)
            | Self::HeaderTooLarge { .. }
            | Self::IncompleteHeaders
            | Self::UnsupportedMethod(_)
            | Self::MissingContentType
            | Self::InvalidContentLength(_)
            | Self::EmptyBody => ErrorClass::Protocol,
            Self::Unsupported(_) => ErrorClass::UnsupportedFeature,
            Self::HeaderReadTimeout(_)
            | Self::BodyReadTimeout(_)
            | Self::BridgeTimeout(_)
            | Self::DrainTimeout(_) => ErrorClass::Timeout,
            Self::Aborted(_) | Self::Persistence(_) | Self::Io(_) => ErrorClass::Persistence,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// True when the peer never finished sending headers; such connections
    /// are closed without writing a response.
    pub fn closes_silently(&self) -> bool {
        matches!(self, Self::HeaderReadTimeout(_) | Self::IncompleteHeaders)
    }

    /// Status code for the response rendered for this error.
    pub fn status_code(&self) -> u16 {
        match self.class() {
            ErrorClass::Protocol | ErrorClass::UnsupportedFeature => 400,
            ErrorClass::Persistence | ErrorClass::Timeout | ErrorClass::Internal => 500,
        }
    }
}

/// Result type for upload operations.
pub type IngestResult<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_bad_request() {
        assert_eq!(UploadError::MalformedRequestLine("GET/".into()).status_code(), 400);
        assert_eq!(UploadError::InvalidContentLength(None).status_code(), 400);
        assert_eq!(UploadError::UnsupportedMethod("GET".into()).status_code(), 400);
        assert_eq!(UploadError::Unsupported("multipart/form-data".into()).status_code(), 400);
        assert_eq!(UploadError::EmptyBody.status_code(), 400);
    }

    #[test]
    fn failures_map_to_internal_error() {
        assert_eq!(UploadError::Persistence("disk full".into()).status_code(), 500);
        assert_eq!(UploadError::BridgeTimeout(Duration::from_secs(20)).status_code(), 500);
        assert_eq!(UploadError::BodyReadTimeout(Duration::from_secs(20)).status_code(), 500);
        assert_eq!(UploadError::Aborted(None).status_code(), 500);
        assert_eq!(UploadError::Internal("join".into()).status_code(), 500);
    }

    #[test]
    fn header_timeouts_close_without_response() {
        assert!(UploadError::HeaderReadTimeout(Duration::from_secs(5)).closes_silently());
        assert!(UploadError::IncompleteHeaders.closes_silently());
        assert!(!UploadError::MalformedHeader("x".into()).closes_silently());
        assert!(!UploadError::BodyReadTimeout(Duration::from_secs(5)).closes_silently());
    }

    #[test]
    fn display_includes_timeout_millis() {
        let e = UploadError::BridgeTimeout(Duration::from_millis(1500));
        assert_eq!(e.to_string(), "bridge call timeout (1500 ms)");
    }
}
