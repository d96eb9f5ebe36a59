//! PCM sample sources.
//!
//! The demodulator only needs "give me the next N frames" plus the frame
//! rate, so the source is a small trait. [`WavPcmSource`] adapts a WAV
//! stream through hound; [`MemoryPcmSource`] serves an in-memory buffer
//! (synthetic waveforms, tests, pre-decoded audio).
//!
//! Samples are normalized to the 16-bit integer range regardless of the
//! container's bit depth, mirroring the amplitude units the demodulator's
//! noise threshold is calibrated in.

use std::io::Read;

use crate::error::TapeError;

/// A pull-based stream of mono PCM frames at a fixed rate.
pub trait PcmSource {
    /// Frames per second of the underlying stream.
    fn sample_rate(&self) -> u32;

    /// Total number of frames, for progress reporting.
    fn total_frames(&self) -> u64;

    /// Append up to `max` frames to `out`. Returns the number appended;
    /// zero means the stream is exhausted.
    fn read_into(&mut self, out: &mut Vec<f32>, max: usize) -> Result<usize, TapeError>;
}

// ---------------------------------------------------------------------------
// WavPcmSource
// ---------------------------------------------------------------------------

/// WAV-backed source. Stereo input is mixed down with a configurable
/// left-channel weight (1.0 = left only, 0.5 = even mix, 0.0 = right only).
pub struct WavPcmSource<R: Read> {
    samples: hound::WavIntoSamples<R, i32>,
    channels: u16,
    sample_rate: u32,
    total_frames: u64,
    scale: f32,
    left_mix: f32,
}

impl<R: Read> WavPcmSource<R> {
    /// Open a WAV stream.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed WAV header, floating point samples,
    /// or more than two channels.
    pub fn new(reader: R, left_mix: f32) -> Result<Self, TapeError> {
        let reader = hound::WavReader::new(reader)?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int {
            return Err(TapeError::UnsupportedSampleFormat);
        }
        if !(1..=2).contains(&spec.channels) {
            return Err(TapeError::UnsupportedChannels(spec.channels));
        }
        // Normalize every depth to the 16-bit range
        let scale = match spec.bits_per_sample {
            8 => 256.0,
            16 => 1.0,
            24 => 1.0 / 256.0,
            32 => 1.0 / 65536.0,
            bits => return Err(TapeError::UnsupportedBitDepth(bits)),
        };

        Ok(Self {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            total_frames: u64::from(reader.duration()),
            scale,
            left_mix,
            samples: reader.into_samples(),
        })
    }
}

impl<R: Read> PcmSource for WavPcmSource<R> {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn read_into(&mut self, out: &mut Vec<f32>, max: usize) -> Result<usize, TapeError> {
        let mut appended = 0;
        while appended < max {
            let Some(first) = self.samples.next() else {
                break;
            };
            let left = first? as f32 * self.scale;
            let value = if self.channels == 2 {
                match self.samples.next() {
                    Some(second) => {
                        let right = second? as f32 * self.scale;
                        left * self.left_mix + right * (1.0 - self.left_mix)
                    }
                    // Truncated final frame — treat as end of stream
                    None => break,
                }
            } else {
                left
            };
            out.push(value);
            appended += 1;
        }
        Ok(appended)
    }
}

// ---------------------------------------------------------------------------
// MemoryPcmSource
// ---------------------------------------------------------------------------

/// An in-memory sample buffer with a fixed frame rate.
pub struct MemoryPcmSource {
    samples: Vec<f32>,
    sample_rate: u32,
    pos: usize,
}

impl MemoryPcmSource {
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            pos: 0,
        }
    }
}

impl PcmSource for MemoryPcmSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.samples.len() as u64
    }

    fn read_into(&mut self, out: &mut Vec<f32>, max: usize) -> Result<usize, TapeError> {
        let n = max.min(self.samples.len() - self.pos);
        out.extend_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
