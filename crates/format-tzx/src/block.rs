//! TZX block model: one closed enum over every block kind the container
//! defines, each knowing its own binary layout.
//!
//! Length prefixes are recomputed from the owned data on every write — a
//! mutated in-memory block can never emit a stale length word. The Glue
//! block ($5A) is parsed but never re-emitted; it only exists to mark file
//! concatenation points.

use std::fmt;

use format_tap::TapPayload;

use crate::TzxError;

// ---------------------------------------------------------------------------
// Standard ROM timing windows for Turbo → Standard narrowing
// ---------------------------------------------------------------------------

const PILOT_RANGE: std::ops::RangeInclusive<u16> = 2148..=2188;
const SYNC1_RANGE: std::ops::RangeInclusive<u16> = 657..=677;
const SYNC2_RANGE: std::ops::RangeInclusive<u16> = 725..=745;
const ZERO_RANGE: std::ops::RangeInclusive<u16> = 845..=865;
const ONE_RANGE: std::ops::RangeInclusive<u16> = 1700..=1720;

/// Whether a block can be written into a bare TAP container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapExport<'a> {
    /// Length-prefixed payload fragment, losslessly representable.
    Fragment(&'a TapPayload),
    /// Pure metadata — silently left out of a TAP file.
    Omit,
    /// Carries timing or signal content TAP cannot express.
    Unsupported,
}

/// A single TZX block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Block $10: Standard speed data (ROM timing).
    StandardSpeed { pause_ms: u16, payload: TapPayload },
    /// Block $11: Turbo speed data (custom timing).
    TurboSpeed {
        pilot_pulse: u16,
        sync1: u16,
        sync2: u16,
        zero_pulse: u16,
        one_pulse: u16,
        pilot_count: u16,
        used_bits: u8,
        pause_ms: u16,
        payload: TapPayload,
    },
    /// Block $12: Pure tone (repeated single pulse).
    PureTone { pulse_len: u16, count: u16 },
    /// Block $13: Pulse sequence (arbitrary pulse lengths).
    PulseSequence { pulses: Vec<u16> },
    /// Block $14: Pure data (no pilot or sync, just data bits).
    PureData {
        zero_pulse: u16,
        one_pulse: u16,
        used_bits: u8,
        pause_ms: u16,
        payload: TapPayload,
    },
    /// Block $15: Direct recording (raw sample bits).
    DirectRecording {
        tstates_per_sample: u16,
        pause_ms: u16,
        used_bits: u8,
        data: Vec<u8>,
    },
    /// Block $16: C64 ROM type data (deprecated).
    C64Data { raw: Vec<u8> },
    /// Block $17: C64 turbo tape data (deprecated).
    C64TurboData { raw: Vec<u8> },
    /// Block $18: CSW recording (kept opaque, playback unsupported).
    CswRecording { raw: Vec<u8> },
    /// Block $19: Generalized data (kept opaque, playback unsupported).
    GeneralizedData { raw: Vec<u8> },
    /// Block $20: Pause, or stop the tape when the duration is zero.
    Pause { duration_ms: u16 },
    /// Block $21: Group start.
    GroupStart { name: Vec<u8> },
    /// Block $22: Group end.
    GroupEnd,
    /// Block $23: Jump to block (signed relative index).
    JumpTo { relative: i16 },
    /// Block $24: Loop start.
    LoopStart { repetitions: i16 },
    /// Block $25: Loop end.
    LoopEnd,
    /// Block $26: Call sequence (signed relative offsets).
    CallSequence { offsets: Vec<i16> },
    /// Block $27: Return from sequence.
    Return,
    /// Block $28: Select block (options kept opaque).
    Select { raw: Vec<u8> },
    /// Block $2A: Stop the tape if in 48K mode.
    StopTape48k,
    /// Block $2B: Set signal level.
    SetSignalLevel { level: bool },
    /// Block $30: Text description.
    TextDescription { text: Vec<u8> },
    /// Block $31: Message to display for a number of seconds.
    Message { display_time: u8, text: Vec<u8> },
    /// Block $32: Archive info (id-tagged text entries).
    ArchiveInfo { entries: Vec<(u8, Vec<u8>)> },
    /// Block $33: Hardware type (3-byte records).
    HardwareType { entries: Vec<[u8; 3]> },
    /// Block $34: Emulation info (deprecated, fixed 8 bytes).
    EmulationInfo { raw: [u8; 8] },
    /// Block $35: Custom info with a 16-byte identification.
    CustomInfo {
        identification: [u8; 16],
        payload: Vec<u8>,
    },
    /// Block $40: Snapshot reference (deprecated).
    Snapshot { snap_type: u8, data: Vec<u8> },
    /// Block $4B: Kansas City Standard data (playback unsupported).
    KansasCityStandard { raw: Vec<u8> },
    /// Block $5A: Glue marker between concatenated files.
    Glue,
}

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

fn need(
    data: &[u8],
    pos: usize,
    n: usize,
    context: &'static str,
) -> Result<(), TzxError> {
    if pos + n > data.len() {
        Err(TzxError::Truncated {
            context,
            offset: pos,
            needed: n,
            remaining: data.len() - pos,
        })
    } else {
        Ok(())
    }
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn read_u24(data: &[u8], pos: usize) -> u32 {
    u32::from(data[pos]) | (u32::from(data[pos + 1]) << 8) | (u32::from(data[pos + 2]) << 16)
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u24(out: &mut Vec<u8>, value: u32) {
    out.push(value as u8);
    out.push((value >> 8) as u8);
    out.push((value >> 16) as u8);
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn take<'a>(
    data: &'a [u8],
    pos: &mut usize,
    n: usize,
    context: &'static str,
) -> Result<&'a [u8], TzxError> {
    need(data, *pos, n, context)?;
    let slice = &data[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

/// Decode the text bytes used throughout TZX (single-byte, Latin-style).
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

impl Block {
    /// Parse one block starting at `pos` (the type id byte). Advances `pos`
    /// past the block.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown type id or a truncated body.
    pub fn parse(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let id_offset = *pos;
        let id = *data
            .get(*pos)
            .ok_or(TzxError::Truncated {
                context: "block id",
                offset: *pos,
                needed: 1,
                remaining: 0,
            })?;
        *pos += 1;

        match id {
            0x10 => Self::parse_standard_speed(data, pos),
            0x11 => Self::parse_turbo_speed(data, pos),
            0x12 => {
                let body = take(data, pos, 4, "Pure Tone")?;
                Ok(Self::PureTone {
                    pulse_len: read_u16(body, 0),
                    count: read_u16(body, 2),
                })
            }
            0x13 => Self::parse_pulse_sequence(data, pos),
            0x14 => Self::parse_pure_data(data, pos),
            0x15 => Self::parse_direct_recording(data, pos),
            0x16 | 0x17 => Self::parse_c64(id, data, pos),
            0x18 | 0x19 => {
                let context = if id == 0x18 {
                    "CSW Recording"
                } else {
                    "Generalized Data"
                };
                let len = read_u32(take(data, pos, 4, context)?, 0) as usize;
                let raw = take(data, pos, len, context)?.to_vec();
                Ok(if id == 0x18 {
                    Self::CswRecording { raw }
                } else {
                    Self::GeneralizedData { raw }
                })
            }
            0x20 => {
                let body = take(data, pos, 2, "Pause")?;
                Ok(Self::Pause {
                    duration_ms: read_u16(body, 0),
                })
            }
            0x21 => {
                let len = take(data, pos, 1, "Group Start")?[0] as usize;
                let name = take(data, pos, len, "Group Start name")?.to_vec();
                Ok(Self::GroupStart { name })
            }
            0x22 => Ok(Self::GroupEnd),
            0x23 => {
                let body = take(data, pos, 2, "Jump To")?;
                Ok(Self::JumpTo {
                    relative: read_u16(body, 0) as i16,
                })
            }
            0x24 => {
                let body = take(data, pos, 2, "Loop Start")?;
                Ok(Self::LoopStart {
                    repetitions: read_u16(body, 0) as i16,
                })
            }
            0x25 => Ok(Self::LoopEnd),
            0x26 => {
                let count = read_u16(take(data, pos, 2, "Call Sequence")?, 0) as usize;
                let body = take(data, pos, count * 2, "Call Sequence offsets")?;
                let offsets = (0..count).map(|i| read_u16(body, i * 2) as i16).collect();
                Ok(Self::CallSequence { offsets })
            }
            0x27 => Ok(Self::Return),
            0x28 => {
                let len = read_u16(take(data, pos, 2, "Select")?, 0) as usize;
                let raw = take(data, pos, len, "Select options")?.to_vec();
                Ok(Self::Select { raw })
            }
            0x2A => {
                // Fixed 4-byte body length, always zero
                take(data, pos, 4, "Stop If 48K")?;
                Ok(Self::StopTape48k)
            }
            0x2B => {
                let body = take(data, pos, 5, "Set Signal Level")?;
                Ok(Self::SetSignalLevel { level: body[4] != 0 })
            }
            0x30 => {
                let len = take(data, pos, 1, "Text Description")?[0] as usize;
                let text = take(data, pos, len, "Text Description text")?.to_vec();
                Ok(Self::TextDescription { text })
            }
            0x31 => {
                let head = take(data, pos, 2, "Message")?;
                let (display_time, len) = (head[0], head[1] as usize);
                let text = take(data, pos, len, "Message text")?.to_vec();
                Ok(Self::Message { display_time, text })
            }
            0x32 => Self::parse_archive_info(data, pos),
            0x33 => {
                let count = take(data, pos, 1, "Hardware Type")?[0] as usize;
                let body = take(data, pos, count * 3, "Hardware Type records")?;
                let entries = body
                    .chunks_exact(3)
                    .map(|c| [c[0], c[1], c[2]])
                    .collect();
                Ok(Self::HardwareType { entries })
            }
            0x34 => {
                let body = take(data, pos, 8, "Emulation Info")?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(body);
                Ok(Self::EmulationInfo { raw })
            }
            0x35 => {
                let head = take(data, pos, 20, "Custom Info")?;
                let mut identification = [0u8; 16];
                identification.copy_from_slice(&head[..16]);
                let len = read_u32(head, 16) as usize;
                let payload = take(data, pos, len, "Custom Info data")?.to_vec();
                Ok(Self::CustomInfo {
                    identification,
                    payload,
                })
            }
            0x40 => {
                let head = take(data, pos, 4, "Snapshot")?;
                let snap_type = head[0];
                let len = read_u24(head, 1) as usize;
                let data = take(data, pos, len, "Snapshot data")?.to_vec();
                Ok(Self::Snapshot { snap_type, data })
            }
            0x4B => {
                let len = read_u32(take(data, pos, 4, "Kansas City Standard")?, 0) as usize;
                let raw = take(data, pos, len, "Kansas City Standard data")?.to_vec();
                Ok(Self::KansasCityStandard { raw })
            }
            0x5A => {
                take(data, pos, 9, "Glue")?;
                Ok(Self::Glue)
            }
            _ => Err(TzxError::UnknownBlockId {
                id,
                offset: id_offset,
            }),
        }
    }

    fn parse_standard_speed(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let head = take(data, pos, 4, "Standard Speed header")?;
        let pause_ms = read_u16(head, 0);
        let len = read_u16(head, 2) as usize;
        let payload = take(data, pos, len, "Standard Speed data")?.to_vec();
        Ok(Self::StandardSpeed {
            pause_ms,
            payload: TapPayload::from_bytes(payload),
        })
    }

    fn parse_turbo_speed(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let head = take(data, pos, 18, "Turbo Speed header")?;
        let len = read_u24(head, 15) as usize;
        let payload = take(data, pos, len, "Turbo Speed data")?.to_vec();
        Ok(Self::TurboSpeed {
            pilot_pulse: read_u16(head, 0),
            sync1: read_u16(head, 2),
            sync2: read_u16(head, 4),
            zero_pulse: read_u16(head, 6),
            one_pulse: read_u16(head, 8),
            pilot_count: read_u16(head, 10),
            used_bits: head[12],
            pause_ms: read_u16(head, 13),
            payload: TapPayload::from_bytes(payload),
        })
    }

    fn parse_pulse_sequence(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let count = take(data, pos, 1, "Pulse Sequence")?[0] as usize;
        let body = take(data, pos, count * 2, "Pulse Sequence data")?;
        let pulses = (0..count).map(|i| read_u16(body, i * 2)).collect();
        Ok(Self::PulseSequence { pulses })
    }

    fn parse_pure_data(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let head = take(data, pos, 10, "Pure Data header")?;
        let len = read_u24(head, 7) as usize;
        let payload = take(data, pos, len, "Pure Data data")?.to_vec();
        Ok(Self::PureData {
            zero_pulse: read_u16(head, 0),
            one_pulse: read_u16(head, 2),
            used_bits: head[4],
            pause_ms: read_u16(head, 5),
            payload: TapPayload::from_bytes(payload),
        })
    }

    fn parse_direct_recording(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let head = take(data, pos, 8, "Direct Recording header")?;
        let len = read_u24(head, 5) as usize;
        let samples = take(data, pos, len, "Direct Recording data")?.to_vec();
        Ok(Self::DirectRecording {
            tstates_per_sample: read_u16(head, 0),
            pause_ms: read_u16(head, 2),
            used_bits: head[4],
            data: samples,
        })
    }

    fn parse_c64(id: u8, data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        // The C64 block length word includes its own 4 bytes
        let context = if id == 0x16 { "C64 Data" } else { "C64 Turbo Data" };
        let total = read_u32(take(data, pos, 4, context)?, 0) as usize;
        if total < 4 {
            return Err(TzxError::Truncated {
                context,
                offset: *pos - 4,
                needed: 4,
                remaining: total,
            });
        }
        let raw = take(data, pos, total - 4, context)?.to_vec();
        Ok(if id == 0x16 {
            Self::C64Data { raw }
        } else {
            Self::C64TurboData { raw }
        })
    }

    fn parse_archive_info(data: &[u8], pos: &mut usize) -> Result<Self, TzxError> {
        let block_len = read_u16(take(data, pos, 2, "Archive Info")?, 0) as usize;
        let body = take(data, pos, block_len, "Archive Info data")?;
        if body.is_empty() {
            return Ok(Self::ArchiveInfo { entries: vec![] });
        }

        let count = body[0] as usize;
        let mut entries = Vec::with_capacity(count);
        let mut ix = 1;
        for _ in 0..count {
            if ix + 2 > body.len() {
                break;
            }
            let entry_id = body[ix];
            let entry_len = body[ix + 1] as usize;
            ix += 2;
            let end = (ix + entry_len).min(body.len());
            entries.push((entry_id, body[ix..end].to_vec()));
            ix = end;
        }

        Ok(Self::ArchiveInfo { entries })
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

impl Block {
    /// The 1-byte type id of this block.
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            Self::StandardSpeed { .. } => 0x10,
            Self::TurboSpeed { .. } => 0x11,
            Self::PureTone { .. } => 0x12,
            Self::PulseSequence { .. } => 0x13,
            Self::PureData { .. } => 0x14,
            Self::DirectRecording { .. } => 0x15,
            Self::C64Data { .. } => 0x16,
            Self::C64TurboData { .. } => 0x17,
            Self::CswRecording { .. } => 0x18,
            Self::GeneralizedData { .. } => 0x19,
            Self::Pause { .. } => 0x20,
            Self::GroupStart { .. } => 0x21,
            Self::GroupEnd => 0x22,
            Self::JumpTo { .. } => 0x23,
            Self::LoopStart { .. } => 0x24,
            Self::LoopEnd => 0x25,
            Self::CallSequence { .. } => 0x26,
            Self::Return => 0x27,
            Self::Select { .. } => 0x28,
            Self::StopTape48k => 0x2A,
            Self::SetSignalLevel { .. } => 0x2B,
            Self::TextDescription { .. } => 0x30,
            Self::Message { .. } => 0x31,
            Self::ArchiveInfo { .. } => 0x32,
            Self::HardwareType { .. } => 0x33,
            Self::EmulationInfo { .. } => 0x34,
            Self::CustomInfo { .. } => 0x35,
            Self::Snapshot { .. } => 0x40,
            Self::KansasCityStandard { .. } => 0x4B,
            Self::Glue => 0x5A,
        }
    }

    /// Human-readable block type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StandardSpeed { .. } => "Standard Speed Data Block",
            Self::TurboSpeed { .. } => "Turbo Speed Data Block",
            Self::PureTone { .. } => "Pure Tone",
            Self::PulseSequence { .. } => "Pulse Sequence",
            Self::PureData { .. } => "Pure Data Block",
            Self::DirectRecording { .. } => "Direct Recording",
            Self::C64Data { .. } => "C64 ROM type data",
            Self::C64TurboData { .. } => "C64 turbo tape data",
            Self::CswRecording { .. } => "CSW recording",
            Self::GeneralizedData { .. } => "Generalized data",
            Self::Pause { .. } => "Pause",
            Self::GroupStart { .. } => "Group start",
            Self::GroupEnd => "Group end",
            Self::JumpTo { .. } => "Jump to",
            Self::LoopStart { .. } => "Loop start",
            Self::LoopEnd => "Loop end",
            Self::CallSequence { .. } => "Call sequence",
            Self::Return => "Return from sequence",
            Self::Select { .. } => "Select",
            Self::StopTape48k => "Stop the tape (48k)",
            Self::SetSignalLevel { .. } => "Set signal level",
            Self::TextDescription { .. } => "Text description",
            Self::Message { .. } => "Message",
            Self::ArchiveInfo { .. } => "Archive info",
            Self::HardwareType { .. } => "Hardware type",
            Self::EmulationInfo { .. } => "Emulation info",
            Self::CustomInfo { .. } => "Custom info",
            Self::Snapshot { .. } => "Snapshot",
            Self::KansasCityStandard { .. } => "Kansas City Standard",
            Self::Glue => "Glue",
        }
    }

    /// Append the serialized block (type id + body) to `out`.
    ///
    /// Glue blocks write nothing — they serve no purpose once files have
    /// been joined.
    pub fn write(&self, out: &mut Vec<u8>) {
        if matches!(self, Self::Glue) {
            return;
        }
        out.push(self.id());

        match self {
            Self::StandardSpeed { pause_ms, payload } => {
                push_u16(out, *pause_ms);
                push_u16(out, payload.len() as u16);
                out.extend_from_slice(payload.data());
            }
            Self::TurboSpeed {
                pilot_pulse,
                sync1,
                sync2,
                zero_pulse,
                one_pulse,
                pilot_count,
                used_bits,
                pause_ms,
                payload,
            } => {
                push_u16(out, *pilot_pulse);
                push_u16(out, *sync1);
                push_u16(out, *sync2);
                push_u16(out, *zero_pulse);
                push_u16(out, *one_pulse);
                push_u16(out, *pilot_count);
                out.push(*used_bits);
                push_u16(out, *pause_ms);
                push_u24(out, payload.len() as u32);
                out.extend_from_slice(payload.data());
            }
            Self::PureTone { pulse_len, count } => {
                push_u16(out, *pulse_len);
                push_u16(out, *count);
            }
            Self::PulseSequence { pulses } => {
                out.push(pulses.len() as u8);
                for &pulse in pulses {
                    push_u16(out, pulse);
                }
            }
            Self::PureData {
                zero_pulse,
                one_pulse,
                used_bits,
                pause_ms,
                payload,
            } => {
                push_u16(out, *zero_pulse);
                push_u16(out, *one_pulse);
                out.push(*used_bits);
                push_u16(out, *pause_ms);
                push_u24(out, payload.len() as u32);
                out.extend_from_slice(payload.data());
            }
            Self::DirectRecording {
                tstates_per_sample,
                pause_ms,
                used_bits,
                data,
            } => {
                push_u16(out, *tstates_per_sample);
                push_u16(out, *pause_ms);
                out.push(*used_bits);
                push_u24(out, data.len() as u32);
                out.extend_from_slice(data);
            }
            Self::C64Data { raw } | Self::C64TurboData { raw } => {
                // C64 length words include their own 4 bytes
                push_u32(out, raw.len() as u32 + 4);
                out.extend_from_slice(raw);
            }
            Self::CswRecording { raw }
            | Self::GeneralizedData { raw }
            | Self::KansasCityStandard { raw } => {
                push_u32(out, raw.len() as u32);
                out.extend_from_slice(raw);
            }
            Self::Pause { duration_ms } => push_u16(out, *duration_ms),
            Self::GroupStart { name } => {
                out.push(name.len() as u8);
                out.extend_from_slice(name);
            }
            Self::JumpTo { relative } => push_u16(out, *relative as u16),
            Self::LoopStart { repetitions } => push_u16(out, *repetitions as u16),
            Self::CallSequence { offsets } => {
                push_u16(out, offsets.len() as u16);
                for &offset in offsets {
                    push_u16(out, offset as u16);
                }
            }
            Self::Select { raw } => {
                push_u16(out, raw.len() as u16);
                out.extend_from_slice(raw);
            }
            Self::StopTape48k => push_u32(out, 0),
            Self::SetSignalLevel { level } => {
                push_u32(out, 1);
                out.push(u8::from(*level));
            }
            Self::TextDescription { text } => {
                out.push(text.len() as u8);
                out.extend_from_slice(text);
            }
            Self::Message { display_time, text } => {
                out.push(*display_time);
                out.push(text.len() as u8);
                out.extend_from_slice(text);
            }
            Self::ArchiveInfo { entries } => {
                let body_len: usize = 1 + entries.iter().map(|(_, t)| 2 + t.len()).sum::<usize>();
                push_u16(out, body_len as u16);
                out.push(entries.len() as u8);
                for (entry_id, text) in entries {
                    out.push(*entry_id);
                    out.push(text.len() as u8);
                    out.extend_from_slice(text);
                }
            }
            Self::HardwareType { entries } => {
                out.push(entries.len() as u8);
                for entry in entries {
                    out.extend_from_slice(entry);
                }
            }
            Self::EmulationInfo { raw } => out.extend_from_slice(raw),
            Self::CustomInfo {
                identification,
                payload,
            } => {
                out.extend_from_slice(identification);
                push_u32(out, payload.len() as u32);
                out.extend_from_slice(payload);
            }
            Self::Snapshot { snap_type, data } => {
                out.push(*snap_type);
                push_u24(out, data.len() as u32);
                out.extend_from_slice(data);
            }
            Self::GroupEnd | Self::LoopEnd | Self::Return | Self::Glue => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

impl Block {
    /// The owned tape payload, for the data-carrying kinds.
    #[must_use]
    pub fn payload(&self) -> Option<&TapPayload> {
        match self {
            Self::StandardSpeed { payload, .. }
            | Self::TurboSpeed { payload, .. }
            | Self::PureData { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Checksum verdict for payload-carrying blocks, `None` otherwise.
    #[must_use]
    pub fn valid(&self) -> Option<bool> {
        self.payload().map(TapPayload::valid)
    }

    /// The raw content bytes this block would export, if it has any.
    #[must_use]
    pub fn dump(&self) -> Option<&[u8]> {
        match self {
            Self::StandardSpeed { payload, .. }
            | Self::TurboSpeed { payload, .. }
            | Self::PureData { payload, .. } => Some(payload.body()),
            Self::TextDescription { text } | Self::Message { text, .. } => Some(text),
            Self::CustomInfo { payload, .. } => Some(payload),
            Self::C64Data { raw } => Some(raw.get(0x24..).unwrap_or(&[])),
            Self::C64TurboData { raw } => Some(raw.get(0x12..).unwrap_or(&[])),
            Self::KansasCityStandard { raw } => Some(raw.get(0x0C..).unwrap_or(&[])),
            _ => None,
        }
    }

    /// How this block maps onto a bare TAP container.
    #[must_use]
    pub fn tap_export(&self) -> TapExport<'_> {
        match self {
            Self::StandardSpeed { payload, .. }
            | Self::TurboSpeed { payload, .. }
            | Self::PureData { payload, .. } => TapExport::Fragment(payload),
            Self::StopTape48k
            | Self::TextDescription { .. }
            | Self::Message { .. }
            | Self::ArchiveInfo { .. }
            | Self::HardwareType { .. }
            | Self::Glue => TapExport::Omit,
            _ => TapExport::Unsupported,
        }
    }

    /// Narrow a Turbo block with standard ROM timing down to a Standard
    /// Speed block. Lossless: only fires when every timing parameter sits
    /// inside the ROM windows, all eight bits of the final byte are used,
    /// and the payload fits a 16-bit length. Every other kind, including an
    /// already-standard block, passes through unchanged.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::TurboSpeed {
                pilot_pulse,
                sync1,
                sync2,
                zero_pulse,
                one_pulse,
                pilot_count,
                used_bits,
                pause_ms,
                payload,
            } if PILOT_RANGE.contains(&pilot_pulse)
                && SYNC1_RANGE.contains(&sync1)
                && SYNC2_RANGE.contains(&sync2)
                && ZERO_RANGE.contains(&zero_pulse)
                && ONE_RANGE.contains(&one_pulse)
                && pilot_count > 2000
                && used_bits == 8
                && payload.len() <= usize::from(u16::MAX) =>
            {
                Self::StandardSpeed { pause_ms, payload }
            }
            other => other,
        }
    }

    /// Secondary details for listings, where the kind has any.
    #[must_use]
    pub fn info(&self) -> Option<String> {
        match self {
            Self::PureTone { pulse_len, count } => {
                Some(format!("{pulse_len} x {count} T-states"))
            }
            Self::PulseSequence { pulses } => Some(format!("{} pulses", pulses.len())),
            Self::Pause { duration_ms } => Some(format!("{duration_ms} ms")),
            Self::TextDescription { text } => Some(decode_text(text)),
            Self::Message { text, .. } => Some(decode_text(text)),
            Self::ArchiveInfo { entries } => Some(archive_info_text(entries)),
            Self::CustomInfo { payload, .. } => {
                let text = decode_text(payload);
                if text.contains('\0') { None } else { Some(text) }
            }
            Self::KansasCityStandard { raw } => Some(format!(
                "Data stream: {} bytes",
                raw.len().saturating_sub(0x0C)
            )),
            _ => None,
        }
    }
}

/// Archive info identification labels, indexed by entry id.
const ARCHIVE_IDS: [&str; 9] = [
    "Title",
    "Publisher",
    "Author",
    "Publication",
    "Language",
    "Type",
    "Price",
    "Loader",
    "Origin",
];

fn archive_info_text(entries: &[(u8, Vec<u8>)]) -> String {
    let mut result = String::new();
    for (entry_id, text) in entries {
        let label = ARCHIVE_IDS
            .get(*entry_id as usize)
            .copied()
            .unwrap_or("Comment");
        let body = decode_text(text)
            .replace('\r', "\n")
            .replace('\n', "\n\t")
            .trim()
            .to_string();
        result.push_str(label);
        result.push_str(": ");
        result.push_str(&body);
        result.push('\n');
    }
    result
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StandardSpeed { payload, .. }
            | Self::TurboSpeed { payload, .. }
            | Self::PureData { payload, .. } => write!(f, "{payload}"),
            Self::GroupStart { name } => write!(f, "{}", decode_text(name).trim()),
            Self::JumpTo { relative } => write!(f, "{relative}"),
            Self::LoopStart { repetitions } => write!(f, "{repetitions}"),
            Self::SetSignalLevel { level } => {
                write!(f, "{}", if *level { "high" } else { "low" })
            }
            Self::CustomInfo { identification, .. } => {
                write!(f, "{}", decode_text(identification).trim())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Build raw payload bytes from flag + body, computing the checksum.
    fn make_payload(flag: u8, body: &[u8]) -> Vec<u8> {
        let mut checksum = flag;
        for &b in body {
            checksum ^= b;
        }
        let mut raw = vec![flag];
        raw.extend_from_slice(body);
        raw.push(checksum);
        raw
    }

    fn parse_one(raw: &[u8]) -> Block {
        let mut pos = 0;
        let block = Block::parse(raw, &mut pos).expect("block should parse");
        assert_eq!(pos, raw.len(), "parse should consume the whole block");
        block
    }

    fn roundtrip(block: &Block) -> Block {
        let mut raw = Vec::new();
        block.write(&mut raw);
        parse_one(&raw)
    }

    #[test]
    fn standard_speed_roundtrip() {
        let block = Block::StandardSpeed {
            pause_ms: 1000,
            payload: TapPayload::from_bytes(make_payload(0xFF, &[1, 2, 3])),
        };
        assert_eq!(roundtrip(&block), block);
        assert_eq!(block.valid(), Some(true));
        assert_eq!(block.dump(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn standard_speed_length_recomputed() {
        // Serialize and check the length word matches the payload exactly
        let payload = TapPayload::from_bytes(make_payload(0xFF, &[9; 40]));
        let block = Block::StandardSpeed {
            pause_ms: 500,
            payload,
        };
        let mut raw = Vec::new();
        block.write(&mut raw);
        assert_eq!(raw[0], 0x10);
        assert_eq!(u16::from_le_bytes([raw[3], raw[4]]), 42);
        assert_eq!(raw.len(), 5 + 42);
    }

    #[test]
    fn turbo_speed_roundtrip() {
        let block = Block::TurboSpeed {
            pilot_pulse: 2168,
            sync1: 667,
            sync2: 735,
            zero_pulse: 855,
            one_pulse: 1710,
            pilot_count: 3223,
            used_bits: 8,
            pause_ms: 1000,
            payload: TapPayload::from_bytes(make_payload(0xFF, &[0xAA, 0x55])),
        };
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn pure_tone_and_pulse_sequence_roundtrip() {
        let tone = Block::PureTone {
            pulse_len: 2168,
            count: 8063,
        };
        assert_eq!(roundtrip(&tone), tone);

        let seq = Block::PulseSequence {
            pulses: vec![100, 200, 300],
        };
        assert_eq!(roundtrip(&seq), seq);
    }

    #[test]
    fn pure_data_roundtrip() {
        let block = Block::PureData {
            zero_pulse: 855,
            one_pulse: 1710,
            used_bits: 6,
            pause_ms: 500,
            payload: TapPayload::from_bytes(make_payload(0xFF, &[0xAB])),
        };
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn direct_recording_roundtrip() {
        let block = Block::DirectRecording {
            tstates_per_sample: 79,
            pause_ms: 0,
            used_bits: 2,
            data: vec![0b1010_0000, 0b0100_0000],
        };
        assert_eq!(roundtrip(&block), block);
    }

    #[test]
    fn control_blocks_roundtrip() {
        for block in [
            Block::Pause { duration_ms: 0 },
            Block::Pause { duration_ms: 2000 },
            Block::GroupStart {
                name: b"Level 1".to_vec(),
            },
            Block::GroupEnd,
            Block::JumpTo { relative: -2 },
            Block::LoopStart { repetitions: 5 },
            Block::LoopEnd,
            Block::CallSequence {
                offsets: vec![1, -3],
            },
            Block::Return,
            Block::Select {
                raw: vec![1, 2, 3, 4],
            },
            Block::StopTape48k,
            Block::SetSignalLevel { level: true },
        ] {
            assert_eq!(roundtrip(&block), block);
        }
    }

    #[test]
    fn metadata_blocks_roundtrip() {
        for block in [
            Block::TextDescription {
                text: b"Hello World".to_vec(),
            },
            Block::Message {
                display_time: 3,
                text: b"Flip the tape".to_vec(),
            },
            Block::ArchiveInfo {
                entries: vec![(0x00, b"Jet Set Willy".to_vec()), (0x02, b"Smith".to_vec())],
            },
            Block::HardwareType {
                entries: vec![[0, 0, 1], [3, 5, 0]],
            },
            Block::EmulationInfo { raw: [0; 8] },
            Block::CustomInfo {
                identification: *b"POKEs           ",
                payload: vec![1, 2, 3],
            },
            Block::Snapshot {
                snap_type: 0,
                data: vec![0xDE, 0xAD],
            },
            Block::KansasCityStandard {
                raw: vec![0; 16],
            },
        ] {
            assert_eq!(roundtrip(&block), block);
        }
    }

    #[test]
    fn glue_is_parsed_but_never_written() {
        let mut raw = vec![0x5A];
        raw.extend_from_slice(&[0u8; 9]);
        let block = parse_one(&raw);
        assert_eq!(block, Block::Glue);

        let mut out = Vec::new();
        block.write(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_id_is_a_hard_error() {
        let raw = [0x77u8, 0, 0, 0, 0];
        let mut pos = 0;
        assert!(matches!(
            Block::parse(&raw, &mut pos),
            Err(TzxError::UnknownBlockId { id: 0x77, offset: 0 })
        ));
    }

    #[test]
    fn truncated_body_errors() {
        let raw = [0x10u8, 0x00]; // Standard Speed with half a header
        let mut pos = 0;
        assert!(matches!(
            Block::parse(&raw, &mut pos),
            Err(TzxError::Truncated { .. })
        ));
    }

    #[test]
    fn tap_export_classes() {
        let data = Block::StandardSpeed {
            pause_ms: 0,
            payload: TapPayload::from_bytes(make_payload(0xFF, &[1])),
        };
        assert!(matches!(data.tap_export(), TapExport::Fragment(_)));

        assert_eq!(
            Block::TextDescription { text: vec![] }.tap_export(),
            TapExport::Omit
        );
        assert_eq!(Block::StopTape48k.tap_export(), TapExport::Omit);
        assert_eq!(
            Block::PureTone {
                pulse_len: 100,
                count: 1
            }
            .tap_export(),
            TapExport::Unsupported
        );
        assert_eq!(
            Block::SetSignalLevel { level: false }.tap_export(),
            TapExport::Unsupported
        );
    }

    #[test]
    fn turbo_with_rom_timing_normalizes_to_standard() {
        let payload = TapPayload::from_bytes(make_payload(0xFF, &[1, 2, 3]));
        let turbo = Block::TurboSpeed {
            pilot_pulse: 2168,
            sync1: 667,
            sync2: 735,
            zero_pulse: 855,
            one_pulse: 1710,
            pilot_count: 3223,
            used_bits: 8,
            pause_ms: 950,
            payload: payload.clone(),
        };

        let narrowed = turbo.normalized();
        assert_eq!(
            narrowed,
            Block::StandardSpeed {
                pause_ms: 950,
                payload,
            }
        );
    }

    #[test]
    fn turbo_with_custom_timing_stays_turbo() {
        let turbo = Block::TurboSpeed {
            pilot_pulse: 1000, // outside the ROM window
            sync1: 667,
            sync2: 735,
            zero_pulse: 855,
            one_pulse: 1710,
            pilot_count: 3223,
            used_bits: 8,
            pause_ms: 0,
            payload: TapPayload::from_bytes(make_payload(0xFF, &[1])),
        };
        assert_eq!(turbo.clone().normalized(), turbo);
    }

    #[test]
    fn normalization_is_idempotent() {
        let payload = TapPayload::from_bytes(make_payload(0xFF, &[7, 8]));
        let turbo = Block::TurboSpeed {
            pilot_pulse: 2168,
            sync1: 667,
            sync2: 735,
            zero_pulse: 855,
            one_pulse: 1710,
            pilot_count: 8063,
            used_bits: 8,
            pause_ms: 1000,
            payload: payload.clone(),
        };

        let once = turbo.clone().normalized();
        let twice = turbo.normalized().normalized();
        assert_eq!(once, twice);

        // Already-standard blocks pass through untouched
        let standard = Block::StandardSpeed {
            pause_ms: 1000,
            payload,
        };
        assert_eq!(standard.clone().normalized(), standard);
    }

    #[test]
    fn info_strings() {
        assert_eq!(
            Block::PureTone {
                pulse_len: 2168,
                count: 8063
            }
            .info()
            .as_deref(),
            Some("2168 x 8063 T-states")
        );
        assert_eq!(
            Block::Pause { duration_ms: 100 }.info().as_deref(),
            Some("100 ms")
        );
        assert_eq!(
            Block::ArchiveInfo {
                entries: vec![(0x00, b"Manic Miner".to_vec())],
            }
            .info()
            .as_deref(),
            Some("Title: Manic Miner\n")
        );
        assert_eq!(Block::GroupEnd.info(), None);
    }
}
