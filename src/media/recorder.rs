//! The recorder abstraction shared by audio and video ingest.

use crate::codec::CodecError;
use crate::protocol::MediaSourceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

/// Accumulates the chunks of one media type for one session.
///
/// ## Lifecycle:
/// 1. Created lazily on the first chunk of its media type
/// 2. `write` called once per chunk, in arrival order
/// 3. `finalize` called exactly once by the session teardown
#[async_trait]
pub trait Recorder: Send {
    fn media_type(&self) -> MediaSourceType;

    /// Persist one chunk.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), MediaError>;

    /// Turn the accumulated state into the final artifact.
    ///
    /// Returns the artifact path, or `None` when there was nothing to produce.
    async fn finalize(&mut self) -> Result<Option<PathBuf>, MediaError>;
}

/// Errors while recording or finalizing media.
#[derive(Debug)]
pub enum MediaError {
    Io { path: PathBuf, source: std::io::Error },
    /// `write` or `finalize` after the recorder was finalized
    AlreadyFinalized(MediaSourceType),
    /// The external encoder failed; the artifact may be missing
    Encode(CodecError),
}

impl MediaError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        MediaError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            MediaError::AlreadyFinalized(kind) => write!(f, "{} recorder is already finalized", kind),
            MediaError::Encode(err) => write!(f, "video assembly failed: {}", err),
        }
    }
}

impl std::error::Error for MediaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MediaError::Io { source, .. } => Some(source),
            MediaError::Encode(err) => Some(err),
            MediaError::AlreadyFinalized(_) => None,
        }
    }
}

/// Artifact file name: `<sessionId>_<timestamp>.<extension>`.
///
/// The timestamp is ISO-8601 UTC with `:` and `.` replaced so it is safe on
/// every filesystem, e.g. `2025-01-01T12-00-00-000Z`.
pub fn artifact_file_name(session_id: &str, created_at: DateTime<Utc>, extension: &str) -> String {
    format!(
        "{}_{}.{}",
        session_id,
        created_at.format("%Y-%m-%dT%H-%M-%S-%3fZ"),
        extension
    )
}
