//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP__SERVER__HOST, APP__CODEC__CRF, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **media**: where artifacts, frame scratch space and the playback asset live
//! - **codec**: how the external ffmpeg process is invoked for encode and decode
//! - **websocket**: heartbeat timing for client connections
//! - **performance**: session limits

use crate::codec::{PcmDecodeParams, VideoEncodeParams};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
///
/// Breaking configuration into logical groups keeps each concern small and
/// lets the `/api/v1/config` endpoint report them separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub codec: CodecConfig,
    pub websocket: WebSocketConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Filesystem locations used by media sessions.
///
/// ## Fields:
/// - `audio_dir`: finalized `.wav` files
/// - `video_dir`: assembled video containers
/// - `scratch_dir`: parent of the per-session frame directories
/// - `playback_asset`: the pre-recorded audio streamed back on request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    pub audio_dir: PathBuf,
    pub video_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub playback_asset: PathBuf,
}

/// External codec (ffmpeg) settings.
///
/// ## Video assembly:
/// Frames are assembled at `frame_rate` fps with a fast `preset` and a
/// constant quality factor (`crf`). Lower crf means higher quality and
/// larger files; 18-28 is the usual visually-lossless-to-good range.
///
/// ## Playback:
/// The playback asset is decoded to raw 16-bit mono PCM at
/// `playback_sample_rate` and forwarded in reads of up to
/// `playback_chunk_bytes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub ffmpeg_path: String,
    pub frame_rate: u32,
    pub frame_extension: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub video_container: String,
    pub playback_sample_rate: u32,
    pub playback_chunk_bytes: usize,
}

/// WebSocket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// How often the server pings the client
    pub heartbeat_interval_secs: u64,
    /// How long the client may stay silent before the connection is dropped
    pub client_timeout_secs: u64,
    /// Largest inbound frame accepted. A STREAM message carries a whole
    /// base64 video frame, so this sits far above the codec's 64 KiB default.
    pub max_frame_bytes: usize,
}

/// actix's own default frame limit; anything lower would refuse ordinary chunks.
pub const MIN_FRAME_BYTES: usize = 64 * 1024;

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of media sessions open at the same time
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            media: MediaConfig {
                audio_dir: PathBuf::from("media/audio"),
                video_dir: PathBuf::from("media/video"),
                scratch_dir: PathBuf::from("media/frames"),
                playback_asset: PathBuf::from("media/assets/playback.mp3"),
            },
            codec: CodecConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                frame_rate: 15,
                frame_extension: "jpg".to_string(),
                preset: "veryfast".to_string(),
                crf: 23,
                pixel_format: "yuv420p".to_string(),
                video_container: "mp4".to_string(),
                playback_sample_rate: 24_000,
                playback_chunk_bytes: 4096,
            },
            websocket: WebSocketConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_frame_bytes: 16 * 1024 * 1024,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP__
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__CODEC__FFMPEG_PATH=/opt/ffmpeg/bin/ffmpeg`: Use a specific ffmpeg build
    /// - `APP__MEDIA__AUDIO_DIR=/var/lib/media/audio`: Move the audio output
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections because field names contain single ones
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents a session from failing
    /// halfway through a recording because ffmpeg was handed a nonsense
    /// argument.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.codec.frame_rate == 0 {
            return Err(anyhow::anyhow!("Video frame rate must be greater than 0"));
        }

        if self.codec.crf > 51 {
            return Err(anyhow::anyhow!("Constant rate factor must be between 0 and 51"));
        }

        if self.codec.frame_extension.is_empty() || self.codec.video_container.is_empty() {
            return Err(anyhow::anyhow!("Frame extension and video container cannot be empty"));
        }

        if self.codec.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Playback sample rate must be greater than 0"));
        }

        if self.codec.playback_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Playback chunk size must be greater than 0"));
        }

        if self.websocket.client_timeout_secs <= self.websocket.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.websocket.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(anyhow::anyhow!(
                "WebSocket max frame size must be at least {} bytes",
                MIN_FRAME_BYTES
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the codec quality knobs and the session limit can change at
    /// runtime; sessions opened after the update pick up the new values.
    /// Listener address and filesystem layout are fixed at startup.
    ///
    /// For example, `{"codec": {"crf": 28}}` changes only the quality factor.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(codec) = partial_config.get("codec") {
            if let Some(frame_rate) = codec.get("frame_rate").and_then(|v| v.as_u64()) {
                self.codec.frame_rate = u32::try_from(frame_rate)?;
            }
            if let Some(preset) = codec.get("preset").and_then(|v| v.as_str()) {
                self.codec.preset = preset.to_string();
            }
            if let Some(crf) = codec.get("crf").and_then(|v| v.as_u64()) {
                self.codec.crf = u8::try_from(crf)?;
            }
            if let Some(pixel_format) = codec.get("pixel_format").and_then(|v| v.as_str()) {
                self.codec.pixel_format = pixel_format.to_string();
            }
            if let Some(rate) = codec.get("playback_sample_rate").and_then(|v| v.as_u64()) {
                self.codec.playback_sample_rate = u32::try_from(rate)?;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Video encoder arguments derived from the codec section.
    pub fn video_encode_params(&self) -> VideoEncodeParams {
        VideoEncodeParams {
            frame_rate: self.codec.frame_rate,
            preset: self.codec.preset.clone(),
            crf: self.codec.crf,
            pixel_format: self.codec.pixel_format.clone(),
        }
    }

    /// Playback decoder arguments derived from the codec section.
    pub fn pcm_decode_params(&self) -> PcmDecodeParams {
        PcmDecodeParams {
            sample_rate: self.codec.playback_sample_rate,
            channels: 1,
            chunk_bytes: self.codec.playback_chunk_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.codec.frame_rate, 15);
        assert_eq!(config.codec.playback_sample_rate, 24_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.codec.crf = 60;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.websocket.client_timeout_secs = config.websocket.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.websocket.max_frame_bytes = MIN_FRAME_BYTES - 1;
        assert!(config.validate().is_err());
        config.websocket.max_frame_bytes = MIN_FRAME_BYTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"codec": {"crf": 28, "preset": "ultrafast"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.codec.crf, 28);
        assert_eq!(config.codec.preset, "ultrafast");
        // Untouched sections keep their values
        assert_eq!(config.codec.frame_rate, 15);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"codec": {"frame_rate": 0}}"#).is_err());
        assert!(config.update_from_json("not json").is_err());
    }

    #[test]
    fn test_codec_params_follow_config() {
        let config = AppConfig::default();
        let encode = config.video_encode_params();
        assert_eq!(encode.frame_rate, 15);
        assert_eq!(encode.pixel_format, "yuv420p");

        let decode = config.pcm_decode_params();
        assert_eq!(decode.sample_rate, 24_000);
        assert_eq!(decode.channels, 1);
    }
}
