//! # External Codec Bridge
//!
//! Actual audio/video encoding is delegated to an external tool (ffmpeg).
//! This module defines the boundary the rest of the server talks to, so that
//! session logic can be tested without a real binary.
//!
//! ## Two independent modes:
//! - **Encode**: an ordered directory of frame files becomes one video
//!   container. The caller suspends until the process exits.
//! - **Decode**: an audio asset becomes a stream of raw PCM chunks that are
//!   forwarded to the client as soon as they arrive. The returned stream can
//!   be forcefully killed.

pub mod ffmpeg;
pub mod playback;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;

pub use ffmpeg::FfmpegBridge;
pub use playback::PlaybackPipeline;

/// Quality and timing knobs for video assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoEncodeParams {
    /// Input frame rate of the frame sequence
    pub frame_rate: u32,
    /// Encoder speed preset (fast presets keep finalize latency low)
    pub preset: String,
    /// Constant rate factor
    pub crf: u8,
    /// Output pixel format
    pub pixel_format: String,
}

/// Output format of the playback decoder (always signed 16-bit little-endian PCM).
#[derive(Debug, Clone, PartialEq)]
pub struct PcmDecodeParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Upper bound on the size of one forwarded chunk
    pub chunk_bytes: usize,
}

/// One video assembly request.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    /// Directory holding the frame files
    pub frames_dir: PathBuf,
    /// printf-style input pattern inside `frames_dir`, e.g. `%06d.jpg`
    pub frame_pattern: String,
    /// Number of frames the recorder wrote
    pub frame_count: u64,
    /// Destination container path
    pub output: PathBuf,
    pub params: VideoEncodeParams,
}

/// One playback request.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub source: PathBuf,
    pub params: PcmDecodeParams,
}

/// Errors reported by a codec bridge.
#[derive(Debug)]
pub enum CodecError {
    /// The external binary could not be found
    NotFound(String),
    /// The process could not be started
    SpawnFailed(String),
    /// The process ran and exited unsuccessfully
    ProcessFailed { status: String, stderr: String },
    /// The input asset for decoding does not exist
    AssetMissing(PathBuf),
    Io(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::NotFound(binary) => write!(f, "codec binary not found: {}", binary),
            CodecError::SpawnFailed(msg) => write!(f, "failed to start codec process: {}", msg),
            CodecError::ProcessFailed { status, stderr } => {
                write!(f, "codec process exited with {}: {}", status, stderr)
            }
            CodecError::AssetMissing(path) => {
                write!(f, "playback asset not found: {}", path.display())
            }
            CodecError::Io(err) => write!(f, "codec I/O error: {}", err),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Io(err)
    }
}

/// A running decode process, exposed as a sequence of binary chunks.
#[async_trait]
pub trait DecodeStream: Send {
    /// Next chunk of decoder output; `None` once the process has exited.
    ///
    /// Must be cancel-safe: the playback pump races it against a kill request.
    async fn next_chunk(&mut self) -> Option<Vec<u8>>;

    /// Forcefully terminate the process and reap it.
    async fn kill(&mut self);
}

/// The boundary to the external encoder/decoder.
#[async_trait]
pub trait CodecBridge: Send + Sync {
    /// Assemble the frame sequence into a video container.
    async fn encode_frames(&self, job: &EncodeJob) -> Result<(), CodecError>;

    /// Start decoding an asset to raw PCM.
    async fn start_decode(&self, job: &DecodeJob) -> Result<Box<dyn DecodeStream>, CodecError>;
}
