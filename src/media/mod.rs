//! # Media Recording Module
//!
//! Turns the chunks a client streams in into durable files.
//!
//! ## Key Components:
//! - **Recorder**: the common write/finalize contract
//! - **AudioRecorder**: PCM appended to a `.wav` with a backpatched header
//! - **VideoFrameRecorder**: numbered frame files assembled by the codec bridge
//! - **WavHeader**: the 44-byte RIFF/WAVE preamble
//!
//! ## Audio Format (as streamed by clients):
//! - **Sample Rate**: 44.1kHz
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod audio;
pub mod recorder;
pub mod video;
pub mod wav;

pub use audio::AudioRecorder;
pub use recorder::{MediaError, Recorder};
pub use video::{VideoFrameRecorder, VideoOutput};
