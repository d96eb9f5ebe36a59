//! TZX tape container codec.
//!
//! TZX describes a tape as a sequence of typed blocks: data blocks with
//! T-state-accurate pulse timing, pure tones and pulse runs, pauses, and
//! control directives (groups, loops, jumps, stop markers). Unlike TAP it
//! preserves enough timing to reproduce turbo loaders and custom protection
//! schemes.
//!
//! Reference: <https://worldofspectrum.net/TZXformat.html>

mod block;
mod file;

pub use block::{Block, TapExport};
pub use file::{MAJOR, MINOR, TzxFile};

use format_tap::TapError;

/// Errors raised while decoding or converting a TZX container.
#[derive(Debug, thiserror::Error)]
pub enum TzxError {
    #[error("TZX file too short for header (need 10 bytes)")]
    TooShort,
    #[error("invalid TZX magic (expected \"ZXTape!\" + 0x1A)")]
    BadMagic,
    #[error("cannot handle TZX with major version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown TZX block ${id:02X} at offset {offset}")]
    UnknownBlockId { id: u8, offset: usize },
    #[error("truncated TZX {context} at offset {offset}: need {needed} bytes, {remaining} remain")]
    Truncated {
        context: &'static str,
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("block {index} ({type_name}) is not supported by the TAP format")]
    TapUnsupported {
        index: usize,
        type_name: &'static str,
    },
    #[error(transparent)]
    Tap(#[from] TapError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
