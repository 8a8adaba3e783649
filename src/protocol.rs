//! Shared wire constants and default limits for the upload protocol

/// Terminates the header block of a request.
pub const HEADER_DELIMITER: &[u8; 4] = b"\r\n\r\n";

/// Terminates the request line and each header line.
pub const LINE_TERMINATOR: &str = "\r\n";

/// The only method accepted by the streaming path.
pub const UPLOAD_METHOD: &str = "POST";

pub const RESPONSE_PROTOCOL: &str = "HTTP/1.1";

// Header names are compared lower-cased
pub mod header {
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
}

// Default capacities and sizes
pub mod limits {
    /// Elements per bounded queue (inbound chunks and outbound results).
    pub const QUEUE_CAPACITY: usize = 100;

    /// Body read size: 128 * 128 bytes.
    pub const CHUNK_SIZE: usize = 128 * 128;

    // Maximum header block (64KB) - stops a peer from growing the header buffer forever
    pub const MAX_HEADER_BYTES: usize = 64 * 1024;
}

// Centralized timeout constants
pub mod timeouts {
    // Deadline for receiving the complete header block (ms)
    pub const HEADER_READ_MS: u64 = 5_000;

    // Deadline for each cross-context queue call made by the persistence worker (ms)
    pub const BRIDGE_CALL_MS: u64 = 20_000;

    // Deadline for flushing the response before the connection is closed (ms)
    pub const DRAIN_MS: u64 = 2_000;

    // Interval between live-resource reports (ms)
    pub const STATS_INTERVAL_MS: u64 = 10_000;
}
