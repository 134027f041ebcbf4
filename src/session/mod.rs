//! # Media Session Management
//!
//! A session is the server-side state of one client connection's media
//! lifetime: its recorders, its playback pipeline, and the lifecycle stage
//! that makes teardown happen exactly once.
//!
//! ## Session Lifecycle:
//! 1. **Open**: created when the connection is established; chunks accepted
//! 2. **Finalizing**: entered by the first of CLOSE event, transport close or
//!    transport error; recorders are finalized and playback killed
//! 3. **Closed**: artifacts are on disk; the session leaves the registry
//!
//! ## Concurrency:
//! Recorder access is serialized by a per-session async mutex that is only
//! held for one write, or for the instant teardown takes the recorders out.
//! The stage check happens under that mutex, so a chunk either lands before
//! teardown takes the recorders or is rejected.

pub mod lifecycle;
pub mod registry;

use crate::codec::{CodecBridge, CodecError, DecodeJob, PcmDecodeParams, PlaybackPipeline};
use crate::config::AppConfig;
use crate::media::{AudioRecorder, MediaError, Recorder, VideoFrameRecorder, VideoOutput};
use crate::protocol::{MediaSourceType, ServerEvent};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

pub use lifecycle::{Lifecycle, SessionStage};
pub use registry::SessionRegistry;

/// Everything a session needs from the configuration, captured at creation.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub audio_dir: PathBuf,
    pub video: VideoOutput,
    pub playback_asset: PathBuf,
    pub decode: PcmDecodeParams,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            audio_dir: config.media.audio_dir.clone(),
            video: VideoOutput {
                video_dir: config.media.video_dir.clone(),
                scratch_root: config.media.scratch_dir.clone(),
                frame_extension: config.codec.frame_extension.clone(),
                container: config.codec.video_container.clone(),
                params: config.video_encode_params(),
            },
            playback_asset: config.media.playback_asset.clone(),
            decode: config.pcm_decode_params(),
        }
    }
}

/// What ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownTrigger {
    /// Client sent `CLOSE`
    CloseEvent,
    /// Transport closed normally (or the connection actor stopped)
    TransportClosed,
    /// Transport failed with a protocol error
    TransportError,
    /// Client stopped answering heartbeats
    HeartbeatTimeout,
    /// Server is shutting down
    ServerShutdown,
}

impl fmt::Display for TeardownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TeardownTrigger::CloseEvent => "close_event",
            TeardownTrigger::TransportClosed => "transport_closed",
            TeardownTrigger::TransportError => "transport_error",
            TeardownTrigger::HeartbeatTimeout => "heartbeat_timeout",
            TeardownTrigger::ServerShutdown => "server_shutdown",
        };
        f.write_str(label)
    }
}

/// Artifacts and failures of one completed teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub audio: Option<PathBuf>,
    pub video: Option<PathBuf>,
    /// Logged failures that did not stop the session from closing
    pub failures: Vec<String>,
    pub playback_killed: bool,
}

#[derive(Debug)]
pub enum TeardownOutcome {
    /// This call ran finalize and the session is now CLOSED
    Closed(TeardownReport),
    /// Another trigger got there first; nothing was done
    Absorbed,
}

/// Errors from session operations.
#[derive(Debug)]
pub enum SessionError {
    /// The session no longer accepts input
    NotOpen(SessionStage),
    /// The registry is at its session limit
    LimitReached(usize),
    Media(MediaError),
    Codec(CodecError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotOpen(stage) => write!(f, "session is {}", stage),
            SessionError::LimitReached(max) => {
                write!(f, "maximum concurrent sessions ({}) reached", max)
            }
            SessionError::Media(err) => write!(f, "{}", err),
            SessionError::Codec(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        SessionError::Media(err)
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Codec(err)
    }
}

#[derive(Default)]
struct Recorders {
    audio: Option<AudioRecorder>,
    video: Option<VideoFrameRecorder>,
}

/// One client's media session.
pub struct Session {
    id: String,
    settings: SessionSettings,
    bridge: Arc<dyn CodecBridge>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    lifecycle: Lifecycle,
    recorders: tokio::sync::Mutex<Recorders>,
    playback: Mutex<Option<PlaybackPipeline>>,
    /// Woken once the stage reaches CLOSED
    closed: Notify,
}

impl Session {
    pub fn new(
        id: String,
        settings: SessionSettings,
        bridge: Arc<dyn CodecBridge>,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            id,
            settings,
            bridge,
            outbound,
            lifecycle: Lifecycle::new(),
            recorders: tokio::sync::Mutex::new(Recorders::default()),
            playback: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    pub fn stage(&self) -> SessionStage {
        self.lifecycle.stage()
    }

    /// Route one decoded chunk to the recorder for its media type,
    /// creating the recorder on first use.
    pub async fn write_chunk(&self, kind: MediaSourceType, chunk: &[u8]) -> Result<(), SessionError> {
        let mut recorders = self.recorders.lock().await;

        let stage = self.lifecycle.stage();
        if stage != SessionStage::Open {
            return Err(SessionError::NotOpen(stage));
        }

        let recorder: &mut dyn Recorder = match kind {
            MediaSourceType::Audio => {
                let audio = match recorders.audio.take() {
                    Some(audio) => audio,
                    None => AudioRecorder::create(&self.settings.audio_dir, &self.id).await?,
                };
                recorders.audio.insert(audio)
            }
            MediaSourceType::Video => {
                let video = match recorders.video.take() {
                    Some(video) => video,
                    None => VideoFrameRecorder::new(
                        &self.id,
                        self.settings.video.clone(),
                        self.bridge.clone(),
                    ),
                };
                recorders.video.insert(video)
            }
        };

        recorder.write(chunk).await?;
        Ok(())
    }

    /// Start streaming the playback asset to this session's client.
    ///
    /// A second request starts a second pipeline; the session then tracks the
    /// newest one and the previous one runs detached until it ends.
    pub async fn start_playback(&self) -> Result<(), SessionError> {
        let stage = self.lifecycle.stage();
        if stage != SessionStage::Open {
            return Err(SessionError::NotOpen(stage));
        }

        let job = DecodeJob {
            source: self.settings.playback_asset.clone(),
            params: self.settings.decode.clone(),
        };
        let stream = self.bridge.start_decode(&job).await?;
        let pipeline = PlaybackPipeline::spawn(self.id.clone(), stream, self.outbound.clone());

        // Stage is re-checked under the slot lock; teardown flips the stage
        // before it empties the slot, so a pipeline is never left untracked
        let rejected = {
            let mut slot = self.playback.lock().unwrap_or_else(PoisonError::into_inner);
            let stage = self.lifecycle.stage();
            if stage != SessionStage::Open {
                Some((pipeline, stage))
            } else {
                if let Some(previous) = slot.replace(pipeline) {
                    if !previous.is_finished() {
                        debug!(session_id = %self.id, "Previous playback left running detached");
                    }
                }
                None
            }
        };

        if let Some((pipeline, stage)) = rejected {
            pipeline.terminate().await;
            return Err(SessionError::NotOpen(stage));
        }

        info!(session_id = %self.id, asset = %self.settings.playback_asset.display(), "Playback started");
        Ok(())
    }

    /// Run the finalize sequence exactly once.
    ///
    /// Every trigger after the first returns [`TeardownOutcome::Absorbed`]
    /// without touching any recorder. Failures are logged and reported but
    /// never prevent the session from reaching CLOSED.
    pub async fn teardown(&self, trigger: TeardownTrigger) -> TeardownOutcome {
        if !self.lifecycle.begin_finalizing() {
            debug!(session_id = %self.id, %trigger, stage = %self.stage(), "Teardown already handled");
            return TeardownOutcome::Absorbed;
        }
        info!(session_id = %self.id, %trigger, "Finalizing session");

        let (audio, video) = {
            let mut recorders = self.recorders.lock().await;
            (recorders.audio.take(), recorders.video.take())
        };
        let playback = self
            .playback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut report = TeardownReport::default();

        // Order between the two does not matter; video may take seconds
        let (video_result, audio_result) = tokio::join!(finalize_recorder(video), finalize_recorder(audio));

        for (kind, result) in [
            (MediaSourceType::Video, video_result),
            (MediaSourceType::Audio, audio_result),
        ] {
            match result {
                Some(Ok(path)) => match kind {
                    MediaSourceType::Audio => report.audio = path,
                    MediaSourceType::Video => report.video = path,
                },
                Some(Err(err)) => {
                    error!(session_id = %self.id, media = %kind, "Finalize failed: {}", err);
                    report.failures.push(err.to_string());
                }
                None => {}
            }
        }

        if let Some(pipeline) = playback {
            pipeline.terminate().await;
            report.playback_killed = true;
        }

        if !self.lifecycle.mark_closed() {
            warn!(session_id = %self.id, stage = %self.stage(), "Unexpected stage at end of teardown");
        }
        self.closed.notify_waiters();

        info!(
            session_id = %self.id,
            audio = ?report.audio,
            video = ?report.video,
            failures = report.failures.len(),
            "Session closed"
        );
        TeardownOutcome::Closed(report)
    }

    /// Resolve once whichever trigger won the teardown has finished it.
    ///
    /// Returns at once if the session is already CLOSED. Waiting on a session
    /// that is still OPEN waits for some future trigger.
    pub async fn wait_closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        // Register before reading the stage so a close in between is not missed
        notified.as_mut().enable();
        if self.stage() == SessionStage::Closed {
            return;
        }
        notified.await;
    }
}

async fn finalize_recorder<R: Recorder>(recorder: Option<R>) -> Option<Result<Option<PathBuf>, MediaError>> {
    let mut recorder = recorder?;
    debug!(media = %recorder.media_type(), "Finalizing recorder");
    Some(recorder.finalize().await)
}
