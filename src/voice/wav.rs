//! Canonical 44-byte WAV framing for raw linear PCM

/// Size of the canonical RIFF/WAVE header
pub const HEADER_LEN: usize = 44;

/// PCM format tag in the `fmt ` chunk
const FORMAT_PCM: u16 = 1;

/// Layout of the raw samples being framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    /// Samples per second per channel
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample
    pub bits_per_sample: u16,
}

impl WavSpec {
    /// Voice channel audio: 48 kHz, stereo, 16-bit
    pub const VOICE: Self = Self {
        sample_rate: 48_000,
        channels: 2,
        bits_per_sample: 16,
    };

    /// Local microphone audio: 16 kHz, mono, 16-bit
    pub const MICROPHONE: Self = Self {
        sample_rate: 16_000,
        channels: 1,
        bits_per_sample: 16,
    };

    /// Bytes per second of audio
    #[must_use]
    pub const fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * self.bits_per_sample as u32 / 8
    }

    /// Bytes per interleaved frame
    #[must_use]
    pub const fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }
}

impl Default for WavSpec {
    fn default() -> Self {
        Self::VOICE
    }
}

/// Wrap raw little-endian PCM bytes in a WAV container
///
/// Always succeeds, including for empty input.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn frame(pcm: &[u8], spec: WavSpec) -> Vec<u8> {
    let data_size = pcm.len() as u32;

    let mut wav = Vec::with_capacity(HEADER_LEN + pcm.len());

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&FORMAT_PCM.to_le_bytes());
    wav.extend_from_slice(&spec.channels.to_le_bytes());
    wav.extend_from_slice(&spec.sample_rate.to_le_bytes());
    wav.extend_from_slice(&spec.byte_rate().to_le_bytes());
    wav.extend_from_slice(&spec.block_align().to_le_bytes());
    wav.extend_from_slice(&spec.bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

/// Serialize interleaved i16 samples as little-endian bytes
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Convert f32 samples in `[-1.0, 1.0]` to i16
#[must_use]
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            #[allow(clippy::cast_possible_truncation)]
            let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            s
        })
        .collect()
}
