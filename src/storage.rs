//! Flat content-addressed object directory.
//!
//! Objects are files directly under the storage root, named by the lowercase
//! hex MD5 of the first chunk of the stream that produced them. No index or
//! manifest is kept.

use crate::error::{IngestResult, UploadError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Where an upload landed and the digest of its full content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub path: String,
    pub file_hash_md5: String,
}

#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Use `root` as the object directory, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> IngestResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Object path for a hex digest.
    pub fn object_path(&self, digest_hex: &str) -> PathBuf {
        self.root.join(digest_hex)
    }

    /// Start a new object. Its name is fixed by `first_chunk` alone, before
    /// the rest of the stream is known.
    pub fn begin(&self, first_chunk: &[u8]) -> IngestResult<ObjectWriter> {
        let key = hex_digest(md5::compute(first_chunk));
        let path = self.object_path(&key);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                UploadError::Persistence(format!("open {}: {}", path.display(), e))
            })?;
        let mut writer = ObjectWriter {
            path,
            out: BufWriter::new(file),
            hasher: md5::Context::new(),
            bytes: 0,
        };
        writer.append(first_chunk)?;
        Ok(writer)
    }
}

/// An object being written: the open file and the running digest.
///
/// Owned by exactly one persistence worker.
pub struct ObjectWriter {
    path: PathBuf,
    out: BufWriter<File>,
    hasher: md5::Context,
    bytes: u64,
}

impl ObjectWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn append(&mut self, data: &[u8]) -> IngestResult<()> {
        self.hasher.consume(data);
        self.out.write_all(data).map_err(|e| {
            UploadError::Persistence(format!("write {}: {}", self.path.display(), e))
        })?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    /// Flush the file and report the digest over everything appended.
    pub fn finish(mut self) -> IngestResult<UploadResult> {
        self.out.flush().map_err(|e| {
            UploadError::Persistence(format!("flush {}: {}", self.path.display(), e))
        })?;
        Ok(UploadResult {
            path: self.path.to_string_lossy().into_owned(),
            file_hash_md5: hex_digest(self.hasher.compute()),
        })
    }
}

impl std::fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("path", &self.path)
            .field("bytes", &self.bytes)
            .finish()
    }
}

pub fn hex_digest(digest: md5::Digest) -> String {
    format!("{:x}", digest)
}
