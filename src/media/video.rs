//! # Video Frame Recorder
//!
//! Each VIDEO chunk is one encoded frame (e.g. a JPEG). Frames are written
//! verbatim into a per-session scratch directory as `000000.jpg`,
//! `000001.jpg`, ... in arrival order, then assembled into a single video
//! container by the codec bridge at finalize.

use super::recorder::{artifact_file_name, MediaError, Recorder};
use crate::codec::{CodecBridge, EncodeJob, VideoEncodeParams};
use crate::protocol::MediaSourceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Width of the zero-padded frame index in frame file names.
pub const FRAME_INDEX_WIDTH: usize = 6;

/// Where and how a session's video gets assembled.
#[derive(Debug, Clone)]
pub struct VideoOutput {
    pub video_dir: PathBuf,
    pub scratch_root: PathBuf,
    pub frame_extension: String,
    pub container: String,
    pub params: VideoEncodeParams,
}

pub struct VideoFrameRecorder {
    session_id: String,
    created_at: DateTime<Utc>,
    scratch_dir: PathBuf,
    output: VideoOutput,
    bridge: Arc<dyn CodecBridge>,
    frame_count: u64,
    finalized: bool,
}

impl VideoFrameRecorder {
    pub fn new(session_id: &str, output: VideoOutput, bridge: Arc<dyn CodecBridge>) -> Self {
        let scratch_dir = output.scratch_root.join(session_id);
        Self {
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            scratch_dir,
            output,
            bridge,
            frame_count: 0,
            finalized: false,
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Destination of the assembled video.
    pub fn output_path(&self) -> PathBuf {
        self.output.video_dir.join(artifact_file_name(
            &self.session_id,
            self.created_at,
            &self.output.container,
        ))
    }

    fn frame_file_name(&self, index: u64) -> String {
        format!(
            "{:0width$}.{}",
            index,
            self.output.frame_extension,
            width = FRAME_INDEX_WIDTH
        )
    }

    fn frame_pattern(&self) -> String {
        format!("%0{}d.{}", FRAME_INDEX_WIDTH, self.output.frame_extension)
    }

    async fn remove_scratch_dir(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.scratch_dir).await {
            warn!(
                session_id = %self.session_id,
                dir = %self.scratch_dir.display(),
                "Failed to remove frame directory: {}",
                err
            );
        }
    }
}

#[async_trait]
impl Recorder for VideoFrameRecorder {
    fn media_type(&self) -> MediaSourceType {
        MediaSourceType::Video
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        if self.finalized {
            return Err(MediaError::AlreadyFinalized(MediaSourceType::Video));
        }

        if self.frame_count == 0 {
            tokio::fs::create_dir_all(&self.scratch_dir)
                .await
                .map_err(|e| MediaError::io(&self.scratch_dir, e))?;
            info!(
                session_id = %self.session_id,
                dir = %self.scratch_dir.display(),
                "Created VIDEO frame directory"
            );
        }

        let path = self.scratch_dir.join(self.frame_file_name(self.frame_count));
        tokio::fs::write(&path, chunk)
            .await
            .map_err(|e| MediaError::io(&path, e))?;

        // Only counted once the frame is on disk, so indices never have gaps
        self.frame_count += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<Option<PathBuf>, MediaError> {
        if self.finalized {
            return Err(MediaError::AlreadyFinalized(MediaSourceType::Video));
        }
        self.finalized = true;

        if self.frame_count == 0 {
            return Ok(None);
        }

        let job = EncodeJob {
            frames_dir: self.scratch_dir.clone(),
            frame_pattern: self.frame_pattern(),
            frame_count: self.frame_count,
            output: self.output_path(),
            params: self.output.params.clone(),
        };

        let started = Instant::now();
        let result = self.bridge.encode_frames(&job).await;

        // The frames are useless either way
        self.remove_scratch_dir().await;
        self.frame_count = 0;

        match result {
            Ok(()) => {
                info!(
                    session_id = %self.session_id,
                    output = %job.output.display(),
                    frames = job.frame_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Video assembled"
                );
                Ok(Some(job.output))
            }
            Err(err) => {
                error!(session_id = %self.session_id, "Video assembly failed: {}", err);
                Err(MediaError::Encode(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mock::MockCodecBridge;

    fn output(root: &Path) -> VideoOutput {
        VideoOutput {
            video_dir: root.join("video"),
            scratch_root: root.join("frames"),
            frame_extension: "jpg".to_string(),
            container: "mp4".to_string(),
            params: VideoEncodeParams {
                frame_rate: 15,
                preset: "veryfast".to_string(),
                crf: 23,
                pixel_format: "yuv420p".to_string(),
            },
        }
    }

    async fn recorder_with(
        root: &Path,
        bridge: Arc<MockCodecBridge>,
    ) -> VideoFrameRecorder {
        tokio::fs::create_dir_all(root.join("video")).await.unwrap();
        VideoFrameRecorder::new("sess", output(root), bridge)
    }

    #[tokio::test]
    async fn test_frames_are_numbered_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let mut recorder = recorder_with(dir.path(), bridge).await;

        for i in 0..12u8 {
            recorder.write(&[i; 4]).await.unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(recorder.scratch_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        let expected: Vec<String> = (0..12).map(|i| format!("{:06}.jpg", i)).collect();
        assert_eq!(names, expected);
        assert_eq!(recorder.frame_count(), 12);

        // Written verbatim
        let frame_7 = std::fs::read(recorder.scratch_dir().join("000007.jpg")).unwrap();
        assert_eq!(frame_7, vec![7u8; 4]);
    }

    #[tokio::test]
    async fn test_finalize_assembles_and_removes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let mut recorder = recorder_with(dir.path(), bridge.clone()).await;

        for i in 0..5u8 {
            recorder.write(&[i]).await.unwrap();
        }
        let scratch = recorder.scratch_dir().to_path_buf();
        let output = recorder.finalize().await.unwrap().unwrap();

        assert!(output.exists());
        assert_eq!(output.extension().unwrap(), "mp4");
        assert!(!scratch.exists());

        let encodes = bridge.encodes();
        assert_eq!(encodes.len(), 1);
        assert_eq!(encodes[0].job.frame_count, 5);
        assert_eq!(encodes[0].job.frame_pattern, "%06d.jpg");
        assert_eq!(encodes[0].job.params.frame_rate, 15);
        assert_eq!(
            encodes[0].frames_seen,
            vec!["000000.jpg", "000001.jpg", "000002.jpg", "000003.jpg", "000004.jpg"]
        );
    }

    #[tokio::test]
    async fn test_encoder_failure_still_removes_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new().failing_encode());
        let mut recorder = recorder_with(dir.path(), bridge).await;

        recorder.write(b"frame").await.unwrap();
        let scratch = recorder.scratch_dir().to_path_buf();
        let output_path = recorder.output_path();

        assert!(matches!(recorder.finalize().await, Err(MediaError::Encode(_))));
        assert!(!scratch.exists());
        assert!(!output_path.exists());
    }

    #[tokio::test]
    async fn test_finalize_without_frames_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let mut recorder = recorder_with(dir.path(), bridge.clone()).await;

        assert!(recorder.finalize().await.unwrap().is_none());
        assert!(bridge.encodes().is_empty());
        assert!(!recorder.scratch_dir().exists());
    }

    #[tokio::test]
    async fn test_second_finalize_does_not_encode_again() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(MockCodecBridge::new());
        let mut recorder = recorder_with(dir.path(), bridge.clone()).await;

        recorder.write(b"frame").await.unwrap();
        recorder.finalize().await.unwrap();
        assert!(recorder.finalize().await.is_err());
        assert_eq!(bridge.encodes().len(), 1);
    }
}
