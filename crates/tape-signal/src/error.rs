//! Error taxonomy for the signal path.
//!
//! A lost or malformed block during demodulation is *not* represented here —
//! that is the per-block `Skip` outcome and the loader simply resynchronizes.
//! `EndOfStream` marks clean exhaustion of the sample source; everything else
//! is fatal for the operation that raised it.

use format_tzx::TzxError;

#[derive(Debug, thiserror::Error)]
pub enum TapeError {
    /// The sample source ran out. Terminates a capture or playback cleanly.
    #[error("end of sample stream")]
    EndOfStream,
    /// A Jump block resolved outside the tape.
    #[error("jump to non-existing block (target {target}, tape has {count} blocks)")]
    JumpOutOfRange { target: i64, count: usize },
    /// The block kind cannot be rendered as pulses.
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("cannot handle WAV files with {0} channels")]
    UnsupportedChannels(u16),
    #[error("cannot handle WAV files with {0}-bit samples")]
    UnsupportedBitDepth(u16),
    #[error("cannot handle floating point WAV files")]
    UnsupportedSampleFormat,
    #[error(transparent)]
    Format(#[from] TzxError),
    #[error(transparent)]
    Wav(#[from] hound::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
