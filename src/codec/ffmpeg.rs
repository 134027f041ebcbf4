//! ffmpeg-backed implementation of the codec bridge.
//!
//! Both modes spawn `ffmpeg` through `tokio::process` with `kill_on_drop`, so
//! a dropped handle never leaves an orphaned process behind.

use super::{CodecBridge, CodecError, DecodeJob, DecodeStream, EncodeJob};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Keep only the end of ffmpeg's stderr in error reports; the banner is noise.
const STDERR_TAIL_BYTES: usize = 2048;

/// Codec bridge that shells out to an ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegBridge {
    binary: String,
}

impl FfmpegBridge {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// Arguments for assembling a frame sequence.
    ///
    /// `-movflags +faststart` moves the index in front of the media data so
    /// the file can start playing before it is fully downloaded.
    fn encode_args(job: &EncodeJob) -> Vec<String> {
        let input = job.frames_dir.join(&job.frame_pattern);
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-framerate".to_string(),
            job.params.frame_rate.to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            job.params.preset.clone(),
            "-crf".to_string(),
            job.params.crf.to_string(),
            "-pix_fmt".to_string(),
            job.params.pixel_format.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            job.output.to_string_lossy().to_string(),
        ]
    }

    /// Arguments for decoding the playback asset to raw PCM on stdout.
    fn decode_args(job: &DecodeJob) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-i".to_string(),
            job.source.to_string_lossy().to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ac".to_string(),
            job.params.channels.to_string(),
            "-ar".to_string(),
            job.params.sample_rate.to_string(),
            "pipe:1".to_string(),
        ]
    }

    fn spawn_error(&self, err: std::io::Error) -> CodecError {
        if err.kind() == std::io::ErrorKind::NotFound {
            CodecError::NotFound(self.binary.clone())
        } else {
            CodecError::SpawnFailed(err.to_string())
        }
    }
}

#[async_trait]
impl CodecBridge for FfmpegBridge {
    async fn encode_frames(&self, job: &EncodeJob) -> Result<(), CodecError> {
        info!(
            frames = job.frame_count,
            output = %job.output.display(),
            "Assembling video"
        );

        let output = Command::new(&self.binary)
            .args(Self::encode_args(job))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            let tail = stderr
                .get(tail_start..)
                .unwrap_or(&stderr)
                .trim()
                .to_string();
            return Err(CodecError::ProcessFailed {
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        Ok(())
    }

    async fn start_decode(&self, job: &DecodeJob) -> Result<Box<dyn DecodeStream>, CodecError> {
        if !tokio::fs::try_exists(&job.source).await.unwrap_or(false) {
            return Err(CodecError::AssetMissing(job.source.clone()));
        }

        let mut child = Command::new(&self.binary)
            .args(Self::decode_args(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CodecError::SpawnFailed("decoder stdout was not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_diagnostics(stderr));
        }

        debug!(source = %job.source.display(), pid = ?child.id(), "Decoder started");

        Ok(Box::new(FfmpegDecodeStream {
            child,
            stdout,
            chunk_bytes: job.params.chunk_bytes.max(1),
        }))
    }
}

/// Forward decoder stderr to the log, one line at a time.
async fn log_diagnostics(stderr: ChildStderr) {
    let mut lines = LinesStream::new(BufReader::new(stderr).lines());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if !line.trim().is_empty() => debug!(target: "ffmpeg", "{}", line),
            Ok(_) => {}
            Err(err) => {
                debug!(target: "ffmpeg", "stderr closed: {}", err);
                break;
            }
        }
    }
}

struct FfmpegDecodeStream {
    child: Child,
    stdout: ChildStdout,
    chunk_bytes: usize,
}

impl FfmpegDecodeStream {
    async fn reap(&mut self) {
        match self.child.wait().await {
            Ok(status) if status.success() => debug!("Decoder exited cleanly"),
            Ok(status) => warn!("Decoder exited with {}", status),
            Err(err) => warn!("Failed to wait for decoder: {}", err),
        }
    }
}

#[async_trait]
impl DecodeStream for FfmpegDecodeStream {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_bytes];
        match self.stdout.read(&mut buf).await {
            Ok(0) => {
                self.reap().await;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(err) => {
                warn!("Failed to read decoder output: {}", err);
                self.reap().await;
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!("Decoder kill: {}", err);
        }
    }
}
