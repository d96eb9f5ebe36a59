//! The analog bridge for ZX Spectrum tapes.
//!
//! Two directions through the same timing model:
//!
//! - **Capture**: a digitized tape signal goes through [`SampleWindow`] and
//!   [`TapeLoader`], which acquires the leader tone, locks the sync pulse,
//!   classifies bit pulses and assembles TAP payloads — producing a TZX
//!   block list.
//! - **Playback**: a TZX block list goes through [`TapeSaver`] (blocks to
//!   half-wave durations) and [`TapePlayer`] (the tape-control program:
//!   loops, jumps, stops — and duration-to-sample conversion), producing
//!   PCM audio or a WAV file.
//!
//! All pulse widths are defined in CPU T-states against a configurable
//! reference clock (3.5 MHz by default), independent of any WAV sample
//! rate.

mod assembler;
mod error;
mod loader;
mod player;
mod saver;
mod source;
mod window;

pub use assembler::{ByteFn, TapAssembler};
pub use error::TapeError;
pub use loader::{LoaderConfig, TapeLoader};
pub use player::{PlayerConfig, TapePlayer};
pub use saver::{Playable, PulseStream, TapTimings, TapeSaver};
pub use source::{MemoryPcmSource, PcmSource, WavPcmSource};
pub use window::{ProgressFn, SampleWindow};
