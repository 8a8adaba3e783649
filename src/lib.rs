//! Hashsink Library
//!
//! Streaming content-addressed upload daemon: request bodies are read off a
//! raw TCP connection, hashed and written to disk chunk by chunk, and stored
//! under their MD5 digest.

pub mod bridge;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;
pub mod stats;
pub mod storage;
pub mod worker;

pub use config::{EmptyBodyPolicy, ServerConfig};
pub use error::{IngestResult, UploadError};
pub use server::{serve, serve_listener, ServerContext};
pub use storage::UploadResult;
