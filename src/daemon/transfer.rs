//! Chunked package receipt: one sink per in-flight transfer, fed chunks in
//! arrival order, closed by the terminal flag. Shared by install, upgrade
//! and plain file push.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::daemon::protocol::Chunk;
use crate::error::Result;

/// Transient per-transfer state. Discarded (file handle closed) on
/// completion or error; an aborted transfer may leave a partial file behind.
#[derive(Debug)]
pub struct PackageSink {
    path: PathBuf,
    file: File,
    written: u64,
    done: bool,
}

impl PackageSink {
    /// Create (truncating) the destination file, creating parent directories
    /// on demand.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            file,
            written: 0,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Append one chunk. Only the first `chunk.length` bytes are written; a
    /// terminal chunk may still carry data (or be a zero-length flush).
    /// Returns true once the terminal chunk has been consumed.
    pub async fn push(&mut self, chunk: &Chunk) -> Result<bool> {
        let payload = chunk.payload();
        if !payload.is_empty() {
            self.file.write_all(payload).await?;
            self.written += payload.len() as u64;
        }
        if chunk.is_ok {
            self.file.flush().await?;
            self.file.sync_all().await?;
            self.done = true;
            debug!(
                "Transfer complete: {} ({} bytes)",
                self.path.display(),
                self.written
            );
        }
        Ok(self.done)
    }
}
