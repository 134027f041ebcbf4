//! RIFF/WAVE container header for recorded audio.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

/// Size of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Format of the audio clients stream in.
pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

const PCM_FORMAT_TAG: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;

/// The 44-byte header, built once the data length is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Number of PCM bytes following the header
    pub data_len: u32,
}

impl WavHeader {
    /// Header for the server's ingest format with `data_len` bytes of PCM.
    ///
    /// Lengths past `u32::MAX` cannot be expressed in RIFF and are clamped.
    pub fn pcm_mono_16(data_len: u64) -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            bits_per_sample: BITS_PER_SAMPLE,
            data_len: u32::try_from(data_len).unwrap_or(u32::MAX),
        }
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * u32::from(self.channels) * u32::from(self.bits_per_sample) / 8
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    /// Value of the RIFF chunk size field: everything after the first 8 bytes.
    pub fn riff_len(&self) -> u32 {
        self.data_len.saturating_add(36)
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(b"RIFF")?;
        out.write_u32::<LittleEndian>(self.riff_len())?;
        out.write_all(b"WAVE")?;
        out.write_all(b"fmt ")?;
        out.write_u32::<LittleEndian>(FMT_CHUNK_LEN)?;
        out.write_u16::<LittleEndian>(PCM_FORMAT_TAG)?;
        out.write_u16::<LittleEndian>(self.channels)?;
        out.write_u32::<LittleEndian>(self.sample_rate)?;
        out.write_u32::<LittleEndian>(self.byte_rate())?;
        out.write_u16::<LittleEndian>(self.block_align())?;
        out.write_u16::<LittleEndian>(self.bits_per_sample)?;
        out.write_all(b"data")?;
        out.write_u32::<LittleEndian>(self.data_len)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut bytes = [0u8; WAV_HEADER_LEN];
        let mut cursor = io::Cursor::new(&mut bytes[..]);
        // A 44-byte slice always fits the header
        let _ = self.write_to(&mut cursor);
        bytes
    }
}
