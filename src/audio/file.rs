//! [`SourceBuffer`] that writes audio chunks to a file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::SourceBuffer;
use crate::constants::AUDIO_OUTPUT_BYTES_PER_SEC;

/// Appends every chunk to a file, in order.
#[derive(Debug)]
pub struct FileSourceBuffer {
    path: PathBuf,
    file: tokio::fs::File,
    written: u64,
}

impl FileSourceBuffer {
    /// Create (or truncate) `path`.
    pub async fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create audio file {}", path.display()))?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl SourceBuffer for FileSourceBuffer {
    async fn append(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        self.file.flush().await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// A file has no playback clock: everything written counts as played,
    /// with the length estimated from the nominal output bitrate.
    fn progress(&self) -> Option<(Duration, Duration)> {
        let end = Duration::from_millis(self.written.saturating_mul(1000) / AUDIO_OUTPUT_BYTES_PER_SEC);
        Some((end, end))
    }
}
