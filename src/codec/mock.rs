//! In-memory codec bridge for tests.

use super::{CodecBridge, CodecError, DecodeJob, DecodeStream, EncodeJob};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Snapshot of one encode call.
#[derive(Debug, Clone)]
pub struct RecordedEncode {
    pub job: EncodeJob,
    /// Frame file names present in `frames_dir` when the encoder ran, sorted
    pub frames_seen: Vec<String>,
}

/// Codec bridge that never spawns a process.
///
/// Encode writes a small placeholder file at the job's output path unless
/// configured to fail. Decode hands out a [`MockDecodeStream`] with the
/// configured chunks.
#[derive(Default)]
pub struct MockCodecBridge {
    fail_encode: bool,
    encode_delay: Option<Duration>,
    decode_chunks: Vec<Vec<u8>>,
    hold_decoder_open: bool,
    asset_missing: bool,
    encodes: Mutex<Vec<RecordedEncode>>,
    decoders_killed: Mutex<Vec<Arc<AtomicBool>>>,
}

impl MockCodecBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_encode(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    pub fn with_encode_delay(mut self, delay: Duration) -> Self {
        self.encode_delay = Some(delay);
        self
    }

    /// Chunks each decoder yields; with `hold_open` the decoder then hangs until killed.
    pub fn with_decode_output(mut self, chunks: Vec<Vec<u8>>, hold_open: bool) -> Self {
        self.decode_chunks = chunks;
        self.hold_decoder_open = hold_open;
        self
    }

    /// Every decode fails as if the playback asset did not exist.
    pub fn with_missing_asset(mut self) -> Self {
        self.asset_missing = true;
        self
    }

    pub fn encodes(&self) -> Vec<RecordedEncode> {
        self.encodes.lock().unwrap().clone()
    }

    /// Kill flags of every decoder started so far, in start order.
    pub fn decoder_kill_flags(&self) -> Vec<Arc<AtomicBool>> {
        self.decoders_killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CodecBridge for MockCodecBridge {
    async fn encode_frames(&self, job: &EncodeJob) -> Result<(), CodecError> {
        let mut frames_seen: Vec<String> = std::fs::read_dir(&job.frames_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        frames_seen.sort();

        self.encodes.lock().unwrap().push(RecordedEncode {
            job: job.clone(),
            frames_seen,
        });

        if let Some(delay) = self.encode_delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_encode {
            return Err(CodecError::ProcessFailed {
                status: "exit status: 1".to_string(),
                stderr: "mock encoder failure".to_string(),
            });
        }

        tokio::fs::write(&job.output, b"mock video").await?;
        Ok(())
    }

    async fn start_decode(&self, job: &DecodeJob) -> Result<Box<dyn DecodeStream>, CodecError> {
        if self.asset_missing || job.source.as_os_str().is_empty() {
            return Err(CodecError::AssetMissing(job.source.clone()));
        }
        let stream = MockDecodeStream::new(self.decode_chunks.clone(), self.hold_decoder_open);
        self.decoders_killed.lock().unwrap().push(stream.killed_flag());
        Ok(Box::new(stream))
    }
}

/// Decoder that yields canned chunks.
pub struct MockDecodeStream {
    chunks: VecDeque<Vec<u8>>,
    hold_open: bool,
    killed: Arc<AtomicBool>,
}

impl MockDecodeStream {
    pub fn new(chunks: Vec<Vec<u8>>, hold_open: bool) -> Self {
        Self {
            chunks: chunks.into(),
            hold_open,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn killed_flag(&self) -> Arc<AtomicBool> {
        self.killed.clone()
    }
}

#[async_trait]
impl DecodeStream for MockDecodeStream {
    async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.killed.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(chunk) = self.chunks.pop_front() {
            return Some(chunk);
        }
        if self.hold_open {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}
