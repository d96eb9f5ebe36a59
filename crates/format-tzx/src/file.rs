//! TZX container: header handling, block sequence, legacy TAP detection.

use std::path::Path;

use format_tap::{TapPayload, parse_tap};

use crate::block::{Block, TapExport};
use crate::TzxError;

/// TZX header magic: "ZXTape!" + 0x1A.
const MAGIC: &[u8; 8] = b"ZXTape!\x1A";

/// The container version this codec writes.
pub const MAJOR: u8 = 1;
pub const MINOR: u8 = 20;

/// Default trailing pause written for blocks captured from tape or wrapped
/// from a bare TAP fragment, in milliseconds.
const DEFAULT_PAUSE_MS: u16 = 1000;

/// A parsed TZX file: version plus the ordered block sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TzxFile {
    pub major: u8,
    pub minor: u8,
    pub blocks: Vec<Block>,
}

impl TzxFile {
    /// An empty tape at the current container version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            major: MAJOR,
            minor: MINOR,
            blocks: Vec::new(),
        }
    }

    /// Parse a tape image from raw bytes.
    ///
    /// A file without the TZX magic is treated as a legacy TAP container:
    /// every fragment becomes an implicit Standard Speed block.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported major version, an unknown block
    /// id, or a truncated block.
    pub fn parse(data: &[u8]) -> Result<Self, TzxError> {
        if data.len() >= 8 && &data[..8] == MAGIC {
            Self::parse_tzx(data)
        } else {
            Ok(Self::from_tap(data)?)
        }
    }

    fn parse_tzx(data: &[u8]) -> Result<Self, TzxError> {
        if data.len() < 10 {
            return Err(TzxError::TooShort);
        }
        let major = data[8];
        if major != MAJOR {
            return Err(TzxError::UnsupportedVersion(major));
        }
        let minor = data[9];

        let mut blocks = Vec::new();
        let mut pos = 10;
        while pos < data.len() {
            blocks.push(Block::parse(data, &mut pos)?);
        }

        Ok(Self {
            major,
            minor,
            blocks,
        })
    }

    fn from_tap(data: &[u8]) -> Result<Self, format_tap::TapError> {
        let mut tzx = Self::new();
        for payload in parse_tap(data)? {
            tzx.blocks.push(Block::StandardSpeed {
                pause_ms: DEFAULT_PAUSE_MS,
                payload,
            });
        }
        Ok(tzx)
    }

    /// Wrap a demodulated payload the way a captured tape block is stored.
    #[must_use]
    pub fn wrap_payload(payload: TapPayload) -> Block {
        Block::StandardSpeed {
            pause_ms: DEFAULT_PAUSE_MS,
            payload,
        }
    }

    /// Serialize to TZX bytes. Always writes the current container version;
    /// Glue blocks are dropped.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(MAJOR);
        out.push(MINOR);
        for block in &self.blocks {
            block.write(&mut out);
        }
        out
    }

    /// Export as a bare TAP container.
    ///
    /// Data-carrying blocks become fragments; metadata blocks are silently
    /// omitted. A block TAP cannot express is an error unless
    /// `skip_unsupported` is set, in which case it is left out (the result
    /// will likely not load).
    ///
    /// # Errors
    ///
    /// Returns [`TzxError::TapUnsupported`] for the first inexpressible
    /// block when `skip_unsupported` is false.
    pub fn write_tap(&self, skip_unsupported: bool) -> Result<Vec<u8>, TzxError> {
        let mut out = Vec::new();
        for (index, block) in self.blocks.iter().enumerate() {
            match block.tap_export() {
                TapExport::Fragment(payload) => payload.write_fragment(&mut out),
                TapExport::Omit => {}
                TapExport::Unsupported => {
                    if !skip_unsupported {
                        return Err(TzxError::TapUnsupported {
                            index,
                            type_name: block.type_name(),
                        });
                    }
                }
            }
        }
        Ok(out)
    }

    /// Read a tape image from disk (TZX or legacy TAP).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TzxError> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Write the tape image to disk as TZX.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TzxError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

impl Default for TzxFile {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
