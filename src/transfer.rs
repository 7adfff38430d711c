//! Per-connection file upload machine driven by FILE_START / FILE_CHUNK.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Maximum accepted declared file size.
pub const MAX_FILE_SIZE: u32 = 100 * 1024 * 1024;

/// Recommended chunk payload size for senders.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Errors surfaced to the client as FILE_ACK(ERROR, message). The display
/// string is the wire message.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid filename")]
    InvalidName,
    #[error("file too large (max 100MB)")]
    TooLarge,
    #[error("invalid path")]
    PathEscape,
    #[error("file already exists")]
    AlreadyExists,
    #[error("failed to create file")]
    Create(#[source] std::io::Error),
    #[error("offset mismatch")]
    OffsetMismatch { expected: u32, got: u32 },
    #[error("write failed")]
    Write(#[source] std::io::Error),
}

/// Result of an accepted chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks expected.
    More,
    /// Declared size reached; the caller should finish the transfer.
    Complete,
}

/// Validate a declared upload filename.
///
/// The name must be non-empty UTF-8 with no path separators, no `..`, no
/// leading dot, and no control bytes. These rules alone preclude traversal;
/// the path containment check in [`FileTransfer::begin`] is defense in depth.
pub fn validate_filename(name: &[u8]) -> Result<&str, TransferError> {
    let name = std::str::from_utf8(name).map_err(|_| TransferError::InvalidName)?;
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
        || name.bytes().any(|b| b < 0x20)
    {
        return Err(TransferError::InvalidName);
    }
    Ok(name)
}

/// One in-flight upload: exclusive-created destination file plus progress.
#[derive(Debug)]
pub struct FileTransfer {
    name: String,
    size: u32,
    received: u32,
    file: File,
    path: PathBuf,
}

impl FileTransfer {
    /// Validate the declared name and size, resolve the destination inside
    /// `cwd`, and exclusively create it with mode 0644.
    pub async fn begin(cwd: &Path, name: &[u8], size: u32) -> Result<Self, TransferError> {
        let name = validate_filename(name)?;
        if size > MAX_FILE_SIZE {
            return Err(TransferError::TooLarge);
        }

        let path = cwd.join(name);
        if !path.starts_with(cwd) {
            return Err(TransferError::PathEscape);
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o644);
        let file = options.open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                TransferError::AlreadyExists
            } else {
                TransferError::Create(e)
            }
        })?;

        tracing::info!(name, size, path = %path.display(), "file upload started");
        Ok(Self {
            name: name.to_string(),
            size,
            received: 0,
            file,
            path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Append a chunk. The offset must equal the bytes received so far; on
    /// mismatch or write failure the caller must abort the transfer.
    pub async fn accept_chunk(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<ChunkOutcome, TransferError> {
        if offset != self.received {
            return Err(TransferError::OffsetMismatch {
                expected: self.received,
                got: offset,
            });
        }

        self.file
            .write_all(data)
            .await
            .map_err(TransferError::Write)?;
        self.received = self.received.saturating_add(data.len() as u32);

        if self.received >= self.size {
            Ok(ChunkOutcome::Complete)
        } else {
            Ok(ChunkOutcome::More)
        }
    }

    /// Close the destination file and return its name.
    pub async fn finish(mut self) -> String {
        let _ = self.file.flush().await;
        tracing::info!(name = %self.name, "file upload complete");
        self.name
    }

    /// Discard the transfer and remove the partial file from disk.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), ?e, "failed to remove partial upload");
        }
    }
}
