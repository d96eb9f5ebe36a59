//! TAP tape payload model.
//!
//! TAP is the simplest Spectrum tape representation: sequential fragments,
//! each preceded by a 2-byte little-endian length word. A fragment carries
//! the raw on-tape bytes of one block: a flag byte ($00 = header, anything
//! else = data), the body, and a trailing checksum byte (XOR of flag + body).
//!
//! A typical program consists of two fragments:
//!   1. Header (flag $00, 19 bytes total: type, name, length, two params)
//!   2. Data (flag $FF, the actual program/data)
//!
//! Checksum failures are never a parse error here — a payload always keeps
//! its bytes and reports validity through [`TapPayload::valid`], so callers
//! can decide whether to keep or strip corrupted blocks.

use std::fmt;

/// A standard header payload is exactly this long: flag + 17 bytes + checksum.
pub const HEADER_LEN: usize = 19;

/// Pilot tone half-waves preceding a header block (ROM loader timing).
pub const HEADER_LEADER_PULSES: u16 = 8063;

/// Pilot tone half-waves preceding a data block.
pub const DATA_LEADER_PULSES: u16 = 3223;

/// Errors raised while reading a TAP container.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("truncated TAP file: expected 2-byte length at offset {0}")]
    TruncatedLength(usize),
    #[error("truncated TAP fragment at offset {offset}: need {needed} bytes, {remaining} remain")]
    TruncatedFragment {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
}

// ---------------------------------------------------------------------------
// TapPayload
// ---------------------------------------------------------------------------

/// The kind of file announced by a header payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Program,
    NumberArray,
    CharacterArray,
    Bytes,
    Unknown(u8),
}

impl HeaderKind {
    #[must_use]
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Self::Program,
            1 => Self::NumberArray,
            2 => Self::CharacterArray,
            3 => Self::Bytes,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Program => write!(f, "Program"),
            Self::NumberArray => write!(f, "Number array"),
            Self::CharacterArray => write!(f, "Character array"),
            Self::Bytes => write!(f, "Bytes"),
            Self::Unknown(id) => write!(f, "Unknown ({id})"),
        }
    }
}

/// A raw on-tape byte buffer: flag byte, body, trailing XOR checksum.
///
/// Interpreted as a [`TapHeader`] when it is exactly 19 bytes long with a
/// zero flag byte, and as opaque [`TapData`] otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapPayload {
    Header(TapHeader),
    Data(TapData),
}

/// A 19-byte header record describing the block that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapHeader {
    data: Vec<u8>,
}

/// An opaque data record of arbitrary length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapData {
    data: Vec<u8>,
}

impl TapPayload {
    /// Wrap raw tape bytes, classifying them as header or data.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        if data.len() == HEADER_LEN && data[0] == 0x00 {
            Self::Header(TapHeader { data })
        } else {
            Self::Data(TapData { data })
        }
    }

    /// The complete raw buffer, including flag and checksum bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Header(h) => &h.data,
            Self::Data(d) => &d.data,
        }
    }

    /// The body between the flag byte and the checksum byte.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        let data = self.data();
        if data.len() < 2 { &[] } else { &data[1..data.len() - 1] }
    }

    /// The leading flag byte, if any bytes were captured at all.
    #[must_use]
    pub fn flag(&self) -> Option<u8> {
        self.data().first().copied()
    }

    /// Checksum test: the XOR of every byte (flag, body, checksum) is zero.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.data().iter().fold(0u8, |acc, &b| acc ^ b) == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Number of pilot half-waves the ROM saver would put in front of this
    /// payload: headers get the long leader, everything else the short one.
    #[must_use]
    pub fn leader_pulse_count(&self) -> u16 {
        match self {
            Self::Header(_) => HEADER_LEADER_PULSES,
            Self::Data(_) => DATA_LEADER_PULSES,
        }
    }

    #[must_use]
    pub fn as_header(&self) -> Option<&TapHeader> {
        match self {
            Self::Header(h) => Some(h),
            Self::Data(_) => None,
        }
    }

    /// Append this payload as a TAP fragment: u16-LE length, then the bytes.
    pub fn write_fragment(&self, out: &mut Vec<u8>) {
        let data = self.data();
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend_from_slice(data);
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Header(h) => h.data,
            Self::Data(d) => d.data,
        }
    }
}

impl TapHeader {
    /// Raw file-type id (0–3 for the standard kinds).
    #[must_use]
    pub fn type_id(&self) -> u8 {
        self.data[1]
    }

    #[must_use]
    pub fn kind(&self) -> HeaderKind {
        HeaderKind::from_id(self.type_id())
    }

    /// The 10-byte name field, space padding and all.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        &self.data[2..12]
    }

    /// The block name with trailing padding trimmed.
    ///
    /// A name starting with $FF marks a nameless block and yields the empty
    /// string. Bytes outside printable ASCII are shown as `?` — the full ZX
    /// character set (tokens, block graphics) is a display concern handled
    /// elsewhere.
    #[must_use]
    pub fn name(&self) -> String {
        if self.data[2] == 0xFF {
            return String::new();
        }
        self.name_bytes()
            .iter()
            .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '?' })
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    /// Announced length of the data block this header precedes.
    #[must_use]
    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.data[12], self.data[13]])
    }

    /// First parameter: autostart line, or start address for `Bytes`.
    #[must_use]
    pub fn param1(&self) -> u16 {
        u16::from_le_bytes([self.data[14], self.data[15]])
    }

    /// Second parameter: program length without variables, or unused.
    #[must_use]
    pub fn param2(&self) -> u16 {
        u16::from_le_bytes([self.data[16], self.data[17]])
    }

    /// Whether this announces a standard screen dump (Bytes at $4000, 6912).
    #[must_use]
    pub fn is_screen(&self) -> bool {
        self.type_id() == 3 && self.param1() == 0x4000 && self.length() == 6912
    }
}

impl TapData {
    /// Body length, excluding flag and checksum bytes.
    #[must_use]
    pub fn length(&self) -> usize {
        self.data.len().saturating_sub(2)
    }
}

impl fmt::Display for TapPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header(h) => {
                if h.is_screen() {
                    write!(f, "Screen: {}", h.name())?;
                } else if h.type_id() == 3 {
                    write!(
                        f,
                        "{}: {} (start: {}, {} bytes)",
                        h.kind(),
                        h.name(),
                        h.param1(),
                        h.length()
                    )?;
                } else {
                    write!(f, "{}: {} ({} bytes)", h.kind(), h.name(), h.length())?;
                }
            }
            Self::Data(d) => {
                if d.data.len() < 2 {
                    write!(f, "{} bytes of incomplete data", d.data.len())?;
                } else if d.data[0] == 0x00 {
                    write!(f, "{} bytes of bogus header", d.length())?;
                } else {
                    write!(f, "{} bytes of data", d.length())?;
                }
            }
        }
        if !self.valid() {
            write!(f, ", CRC ERROR!")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TAP container
// ---------------------------------------------------------------------------

/// Parse a bare TAP container into its payloads.
///
/// Checksums are not enforced; inspect [`TapPayload::valid`] per payload.
///
/// # Errors
///
/// Returns an error if a fragment is truncated.
pub fn parse_tap(data: &[u8]) -> Result<Vec<TapPayload>, TapError> {
    let mut payloads = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 2 > data.len() {
            return Err(TapError::TruncatedLength(offset));
        }
        let len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;

        if offset + len > data.len() {
            return Err(TapError::TruncatedFragment {
                offset: offset - 2,
                needed: len,
                remaining: data.len() - offset,
            });
        }
        payloads.push(TapPayload::from_bytes(data[offset..offset + len].to_vec()));
        offset += len;
    }

    Ok(payloads)
}

/// Serialize payloads back into a bare TAP container.
#[must_use]
pub fn write_tap(payloads: &[TapPayload]) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in payloads {
        payload.write_fragment(&mut out);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
