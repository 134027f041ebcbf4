//! # Audio Recorder
//!
//! Streams raw 16-bit mono PCM straight to a `.wav` file.
//!
//! ## File layout while recording:
//! ```text
//! [44 zero bytes][chunk 1][chunk 2]...[chunk N]
//! ```
//! The header region is a zero-filled placeholder until `finalize`, which
//! seeks back to offset 0 and writes the real header now that the total
//! data length is known. Chunks are never buffered in memory.
//!
//! A chunk that fails partway is cut back off the file, so the bytes after
//! the header are always exactly the chunks that were accepted.

use super::recorder::{artifact_file_name, MediaError, Recorder};
use super::wav::{WavHeader, WAV_HEADER_LEN};
use crate::protocol::MediaSourceType;
use async_trait::async_trait;
use chrono::Utc;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Seekable byte sink a `.wav` is written into.
#[async_trait]
pub trait WavSink: AsyncWrite + AsyncSeek + Unpin + Send {
    /// Truncate or extend to exactly `len` bytes.
    async fn set_len(&mut self, len: u64) -> io::Result<()>;

    async fn sync_all(&mut self) -> io::Result<()>;
}

#[async_trait]
impl WavSink for File {
    async fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len).await
    }

    async fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self).await
    }
}

pub struct AudioRecorder<W = File> {
    path: PathBuf,
    /// `None` once finalized
    file: Option<W>,
    bytes_written: u64,
    chunks_written: u64,
}

impl AudioRecorder {
    /// Create `<audio_dir>/<sessionId>_<timestamp>.wav` and reserve the header.
    pub async fn create(audio_dir: &Path, session_id: &str) -> Result<Self, MediaError> {
        let path = audio_dir.join(artifact_file_name(session_id, Utc::now(), "wav"));

        let mut file = File::create(&path)
            .await
            .map_err(|e| MediaError::io(&path, e))?;
        file.write_all(&[0u8; WAV_HEADER_LEN])
            .await
            .map_err(|e| MediaError::io(&path, e))?;

        info!(session_id = %session_id, path = %path.display(), "Created AUDIO file");

        Ok(Self {
            path,
            file: Some(file),
            bytes_written: 0,
            chunks_written: 0,
        })
    }

}

impl<W: WavSink> AudioRecorder<W> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PCM bytes written after the header so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Cut the sink back to `end` and continue writing from there.
async fn roll_back<W: WavSink>(file: &mut W, end: u64) -> io::Result<()> {
    file.set_len(end).await?;
    file.seek(SeekFrom::Start(end)).await?;
    Ok(())
}

#[async_trait]
impl<W: WavSink> Recorder for AudioRecorder<W> {
    fn media_type(&self) -> MediaSourceType {
        MediaSourceType::Audio
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        let file = self
            .file
            .as_mut()
            .ok_or(MediaError::AlreadyFinalized(MediaSourceType::Audio))?;

        if let Err(err) = file.write_all(chunk).await {
            let end = WAV_HEADER_LEN as u64 + self.bytes_written;
            if let Err(rollback_err) = roll_back(file, end).await {
                warn!(
                    path = %self.path.display(),
                    "Could not drop partial chunk, header length will not match: {}",
                    rollback_err
                );
            }
            return Err(MediaError::io(&self.path, err));
        }

        self.bytes_written += chunk.len() as u64;
        self.chunks_written += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Option<PathBuf>, MediaError> {
        let mut file = self
            .file
            .take()
            .ok_or(MediaError::AlreadyFinalized(MediaSourceType::Audio))?;

        let header = WavHeader::pcm_mono_16(self.bytes_written);
        let io_err = |e| MediaError::io(&self.path, e);

        file.flush().await.map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).await.map_err(io_err)?;
        file.write_all(&header.to_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        debug!(
            path = %self.path.display(),
            chunks = self.chunks_written,
            data_len = header.data_len,
            "WAV header written"
        );

        Ok(Some(self.path.clone()))
    }
}
