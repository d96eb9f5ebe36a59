//! Remodulator: turns payloads and blocks back into timed half-wave pulses.
//!
//! A [`PulseStream`] yields half-wave durations in nanoseconds, one per
//! polarity toggle. Consumers toggle their output level once per yielded
//! duration; a zero-length duration is an alignment toggle that flips the
//! level without occupying any time (used to force a known level before a
//! pause or a direct-recording sample).
//!
//! Durations are real-time units derived from T-states through the
//! configured CPU clock — converting to an output sample rate is the
//! playback driver's job.

use format_tap::TapPayload;
use format_tzx::Block;

use crate::error::TapeError;

// ---------------------------------------------------------------------------
// Standard ROM timing (T-states)
// ---------------------------------------------------------------------------

const PILOT_PULSE: u16 = 2168;
const SYNC1_PULSE: u16 = 667;
const SYNC2_PULSE: u16 = 735;
const ZERO_PULSE: u16 = 855;
const ONE_PULSE: u16 = 1710;

/// Timing parameters for modulating a payload. The options mirror what the
/// block kinds need: pure-data blocks carry no pilot or sync at all, turbo
/// blocks override everything.
#[derive(Debug, Clone, Copy)]
pub struct TapTimings {
    pub pilot_pulse: Option<u16>,
    pub sync1: Option<u16>,
    pub sync2: Option<u16>,
    pub zero_pulse: u16,
    pub one_pulse: u16,
    /// Pilot half-waves; `None` selects the ROM count by payload flag.
    pub leader_tone: Option<u16>,
    /// Bits transmitted from the final byte.
    pub final_bits: u8,
}

impl Default for TapTimings {
    fn default() -> Self {
        Self {
            pilot_pulse: Some(PILOT_PULSE),
            sync1: Some(SYNC1_PULSE),
            sync2: Some(SYNC2_PULSE),
            zero_pulse: ZERO_PULSE,
            one_pulse: ONE_PULSE,
            leader_tone: None,
            final_bits: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// PulseStream
// ---------------------------------------------------------------------------

/// One segment of a pulse program. Data segments keep a cursor so the
/// stream never materializes the full pulse sequence.
#[derive(Debug, Clone)]
enum Segment {
    /// `remaining` alternating half-waves of one period.
    Tone { period_ns: u64, remaining: u32 },
    /// A single toggle (zero duration allowed).
    Pulse { ns: u64 },
    /// Two toggles per data bit, MSB first, truncated final byte.
    Bits {
        data: Vec<u8>,
        zero_ns: u64,
        one_ns: u64,
        byte: usize,
        bit: u8,
        second_half: bool,
        counter: i32,
    },
    /// One level per sample bit; equal levels need an alignment toggle.
    Direct {
        data: Vec<u8>,
        bit_ns: u64,
        byte: usize,
        bit: u8,
        counter: i32,
        pending: Option<u64>,
    },
    /// Silence: force the line low, then one long quiet "pulse".
    Pause { ms: u32 },
}

/// Lazy sequence of half-wave durations for one block (or one saver call).
#[derive(Debug, Clone)]
pub struct PulseStream {
    segments: std::collections::VecDeque<Segment>,
    level: bool,
}

impl PulseStream {
    fn new(level: bool, segments: Vec<Segment>) -> Self {
        Self {
            segments: segments.into(),
            level,
        }
    }

    /// The line level after the most recently yielded pulse.
    #[must_use]
    pub fn level(&self) -> bool {
        self.level
    }
}

impl Iterator for PulseStream {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            let segment = self.segments.front_mut()?;
            match segment {
                Segment::Tone {
                    period_ns,
                    remaining,
                } => {
                    if *remaining == 0 {
                        self.segments.pop_front();
                        continue;
                    }
                    *remaining -= 1;
                    let ns = *period_ns;
                    self.level = !self.level;
                    return Some(ns);
                }
                Segment::Pulse { ns } => {
                    let ns = *ns;
                    self.segments.pop_front();
                    self.level = !self.level;
                    return Some(ns);
                }
                Segment::Bits {
                    data,
                    zero_ns,
                    one_ns,
                    byte,
                    bit,
                    second_half,
                    counter,
                } => {
                    if *byte >= data.len() {
                        self.segments.pop_front();
                        continue;
                    }
                    let mask = 0x80u8 >> *bit;
                    let ns = if data[*byte] & mask != 0 {
                        *one_ns
                    } else {
                        *zero_ns
                    };
                    if *second_half {
                        // Advance to the next bit after this half
                        *second_half = false;
                        let last_byte = *byte == data.len() - 1;
                        let mut done = false;
                        if last_byte {
                            *counter -= 1;
                            if *counter <= 0 {
                                done = true;
                            }
                        }
                        if done {
                            self.segments.pop_front();
                        } else {
                            *bit += 1;
                            if *bit == 8 {
                                *bit = 0;
                                *byte += 1;
                            }
                        }
                    } else {
                        *second_half = true;
                    }
                    self.level = !self.level;
                    return Some(ns);
                }
                Segment::Direct {
                    data,
                    bit_ns,
                    byte,
                    bit,
                    counter,
                    pending,
                } => {
                    if let Some(ns) = pending.take() {
                        self.level = !self.level;
                        return Some(ns);
                    }
                    if *byte >= data.len() {
                        self.segments.pop_front();
                        continue;
                    }
                    let new_state = data[*byte] & (0x80u8 >> *bit) != 0;
                    let needs_align = new_state == self.level;
                    let ns = *bit_ns;
                    if needs_align {
                        *pending = Some(ns);
                    }

                    // Advance the cursor past this sample; a spent counter
                    // marks the segment exhausted (any pending alignment
                    // pulse is still delivered first)
                    let last_byte = *byte == data.len() - 1;
                    let mut advance = true;
                    if last_byte {
                        *counter -= 1;
                        if *counter <= 0 {
                            *byte = data.len();
                            advance = false;
                        }
                    }
                    if advance {
                        *bit += 1;
                        if *bit == 8 {
                            *bit = 0;
                            *byte += 1;
                        }
                    }

                    self.level = !self.level;
                    return Some(if needs_align { 0 } else { ns });
                }
                Segment::Pause { ms } => {
                    if *ms == 0 {
                        self.segments.pop_front();
                        continue;
                    }
                    let ns = u64::from(*ms) * 1_000_000;
                    self.segments.pop_front();
                    if self.level {
                        // Single toggle down into silence
                        self.level = false;
                        return Some(ns);
                    }
                    // Alignment toggle first, then the silent pulse
                    self.segments.push_front(Segment::Pulse { ns });
                    self.level = true;
                    return Some(0);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TapeSaver
// ---------------------------------------------------------------------------

/// Pulse generator context: reference clock plus the persistent line level
/// that streams start from.
#[derive(Debug, Clone)]
pub struct TapeSaver {
    cpu_freq: u32,
    level: bool,
}

impl TapeSaver {
    #[must_use]
    pub fn new(cpu_freq: u32) -> Self {
        Self {
            cpu_freq,
            level: false,
        }
    }

    /// The line level after every stream handed out so far.
    #[must_use]
    pub fn level(&self) -> bool {
        self.level
    }

    fn t_states_to_ns(&self, t_states: u32) -> u64 {
        u64::from(t_states) * 1_000_000_000 / u64::from(self.cpu_freq)
    }

    /// A single half-wave.
    pub fn pulse(&mut self, t_states: u16) -> PulseStream {
        self.stream(vec![Segment::Pulse {
            ns: self.t_states_to_ns(u32::from(t_states)),
        }])
    }

    /// `count` alternating half-waves of one period.
    pub fn tone(&mut self, t_states: u16, count: u32) -> PulseStream {
        self.stream(vec![Segment::Tone {
            period_ns: self.t_states_to_ns(u32::from(t_states)),
            remaining: count,
        }])
    }

    /// Standard two-pulses-per-bit data modulation, without leader or sync.
    pub fn data(
        &mut self,
        data: Vec<u8>,
        zero_pulse: u16,
        one_pulse: u16,
        final_bits: u8,
    ) -> PulseStream {
        self.stream(vec![Self::bits_segment(
            data,
            self.t_states_to_ns(u32::from(zero_pulse)),
            self.t_states_to_ns(u32::from(one_pulse)),
            final_bits,
        )])
    }

    /// A complete payload: leader tone, sync pair, data bits.
    pub fn tap(&mut self, payload: &TapPayload, timings: &TapTimings) -> PulseStream {
        let segments = self.tap_segments(payload, timings);
        self.stream(segments)
    }

    /// Direct-recording samples: one level per bit.
    pub fn direct(&mut self, data: Vec<u8>, final_bits: u8, t_states: u16) -> PulseStream {
        self.stream(vec![Segment::Direct {
            data,
            bit_ns: self.t_states_to_ns(u32::from(t_states)),
            byte: 0,
            bit: 0,
            counter: i32::from(final_bits),
            pending: None,
        }])
    }

    /// Silence. Zero milliseconds is a no-op stream.
    pub fn pause(&mut self, ms: u32) -> PulseStream {
        self.stream(vec![Segment::Pause { ms }])
    }

    /// The full pulse program for one block, including its trailing pause.
    ///
    /// # Errors
    ///
    /// Returns [`TapeError::Unsupported`] for recordings this remodulator
    /// cannot render (CSW, generalized data, C64, Kansas City).
    pub fn block(&mut self, block: &Block) -> Result<PulseStream, TapeError> {
        let segments = match block {
            Block::StandardSpeed { pause_ms, payload } => {
                let mut segments = self.tap_segments(payload, &TapTimings::default());
                segments.push(Segment::Pause {
                    ms: u32::from(*pause_ms),
                });
                segments
            }
            Block::TurboSpeed {
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
                let timings = TapTimings {
                    pilot_pulse: Some(*pilot_pulse),
                    sync1: Some(*sync1),
                    sync2: Some(*sync2),
                    zero_pulse: *zero_pulse,
                    one_pulse: *one_pulse,
                    leader_tone: Some(*pilot_count),
                    final_bits: *used_bits,
                };
                let mut segments = self.tap_segments(payload, &timings);
                segments.push(Segment::Pause {
                    ms: u32::from(*pause_ms),
                });
                segments
            }
            Block::PureTone { pulse_len, count } => vec![Segment::Tone {
                period_ns: self.t_states_to_ns(u32::from(*pulse_len)),
                remaining: u32::from(*count),
            }],
            Block::PulseSequence { pulses } => pulses
                .iter()
                .map(|&p| Segment::Pulse {
                    ns: self.t_states_to_ns(u32::from(p)),
                })
                .collect(),
            Block::PureData {
                zero_pulse,
                one_pulse,
                used_bits,
                pause_ms,
                payload,
            } => {
                let timings = TapTimings {
                    pilot_pulse: None,
                    sync1: None,
                    sync2: None,
                    zero_pulse: *zero_pulse,
                    one_pulse: *one_pulse,
                    leader_tone: None,
                    final_bits: *used_bits,
                };
                let mut segments = self.tap_segments(payload, &timings);
                segments.push(Segment::Pause {
                    ms: u32::from(*pause_ms),
                });
                segments
            }
            Block::DirectRecording {
                tstates_per_sample,
                pause_ms,
                used_bits,
                data,
            } => {
                let mut segments = Vec::new();
                if !data.is_empty() {
                    segments.push(Segment::Direct {
                        data: data.clone(),
                        bit_ns: self.t_states_to_ns(u32::from(*tstates_per_sample)),
                        byte: 0,
                        bit: 0,
                        counter: i32::from(*used_bits),
                        pending: None,
                    });
                }
                segments.push(Segment::Pause {
                    ms: u32::from(*pause_ms),
                });
                segments
            }
            Block::Pause { duration_ms } => vec![Segment::Pause {
                ms: u32::from(*duration_ms),
            }],
            Block::CswRecording { .. } => {
                return Err(TapeError::Unsupported("CSW Recording Block"));
            }
            Block::GeneralizedData { .. } => {
                return Err(TapeError::Unsupported("Generalized Data Block"));
            }
            Block::C64Data { .. } | Block::C64TurboData { .. } => {
                return Err(TapeError::Unsupported("C64 blocks"));
            }
            Block::KansasCityStandard { .. } => {
                return Err(TapeError::Unsupported("Kansas City Standard"));
            }
            // Metadata and control blocks carry no signal; the playback
            // driver interprets the control ones
            _ => Vec::new(),
        };
        Ok(self.stream(segments))
    }

    fn bits_segment(data: Vec<u8>, zero_ns: u64, one_ns: u64, final_bits: u8) -> Segment {
        Segment::Bits {
            data,
            zero_ns,
            one_ns,
            byte: 0,
            bit: 0,
            second_half: false,
            counter: i32::from(final_bits),
        }
    }

    fn tap_segments(&self, payload: &TapPayload, timings: &TapTimings) -> Vec<Segment> {
        let mut segments = Vec::new();
        if let Some(pilot) = timings.pilot_pulse {
            let count = timings
                .leader_tone
                .unwrap_or_else(|| payload.leader_pulse_count());
            segments.push(Segment::Tone {
                period_ns: self.t_states_to_ns(u32::from(pilot)),
                remaining: u32::from(count),
            });
        }
        if let Some(sync1) = timings.sync1 {
            segments.push(Segment::Pulse {
                ns: self.t_states_to_ns(u32::from(sync1)),
            });
        }
        if let Some(sync2) = timings.sync2 {
            segments.push(Segment::Pulse {
                ns: self.t_states_to_ns(u32::from(sync2)),
            });
        }
        if !payload.is_empty() {
            segments.push(Self::bits_segment(
                payload.data().to_vec(),
                self.t_states_to_ns(u32::from(timings.zero_pulse)),
                self.t_states_to_ns(u32::from(timings.one_pulse)),
                timings.final_bits,
            ));
        }
        segments
    }

    /// Wrap segments in a stream starting at the current level, and advance
    /// the saver's level past the stream's toggles.
    fn stream(&mut self, segments: Vec<Segment>) -> PulseStream {
        let start = self.level;
        self.level = final_level(&segments, start);
        PulseStream::new(start, segments)
    }
}

/// The line level after every toggle of `segments`, starting from `level`.
fn final_level(segments: &[Segment], mut level: bool) -> bool {
    for segment in segments {
        match segment {
            Segment::Tone { remaining, .. } => {
                if remaining % 2 == 1 {
                    level = !level;
                }
            }
            Segment::Pulse { .. } => level = !level,
            // Two toggles per bit: parity never changes
            Segment::Bits { .. } => {}
            Segment::Direct { data, counter, .. } => {
                // Each sample leaves the line at its own bit value
                if let Some(&last) = data.last() {
                    let bits_last = (*counter).clamp(1, 8) as u8;
                    level = last & (0x80u8 >> (bits_last - 1)) != 0;
                }
            }
            Segment::Pause { ms } => {
                if *ms > 0 {
                    level = false;
                }
            }
        }
    }
    level
}

// ---------------------------------------------------------------------------
// Playable
// ---------------------------------------------------------------------------

/// Capability of blocks that can be rendered as half-wave pulses.
pub trait Playable {
    /// The pulse program for this block in the given saver context.
    fn pulses(&self, saver: &mut TapeSaver) -> Result<PulseStream, TapeError>;
}

impl Playable for Block {
    fn pulses(&self, saver: &mut TapeSaver) -> Result<PulseStream, TapeError> {
        saver.block(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
