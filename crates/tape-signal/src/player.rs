//! Playback driver: runs the block sequence as a tiny tape program and
//! renders the pulse stream into PCM samples.
//!
//! The block list is interpreted with three control operators — loop
//! start/end (one active loop, the format does not nest them), a bounds-
//! checked relative jump, and two flag-gated stop conditions. Every other
//! block is handed to the remodulator and its half-wave durations are
//! converted to run-length level segments: elapsed real time accumulates in
//! nanoseconds and a waveform chunk is emitted only when it crosses an
//! output sample boundary. Identical chunks (same length, same level) are
//! cached and reused, so long tones cost one synthesis each.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use std::rc::Rc;

use log::debug;

use format_tzx::{Block, TzxFile};

use crate::error::TapeError;
use crate::saver::{PulseStream, TapeSaver};

/// Silence is emitted in chunks of at most this many frames.
const SILENCE_CHUNK: usize = 1024;

/// Playback tuning.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Output sample rate in Hz.
    pub rate: u32,
    /// Honor "stop the tape" pauses (duration 0).
    pub stop_on_pause: bool,
    /// Honor "stop the tape if 48K" markers.
    pub stop_48k: bool,
    /// Render soft sine pulses instead of square ones.
    pub sine: bool,
    /// Reference CPU clock, in Hz.
    pub cpu_freq: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            rate: 44100,
            stop_on_pause: false,
            stop_48k: false,
            sine: false,
            cpu_freq: 3_500_000,
        }
    }
}

/// Pull-based sample stream over a tape program.
///
/// Yields 16-bit mono chunks at the configured rate. A fatal condition
/// (unsupported recording, jump out of range) surfaces as one `Err` item
/// and ends the stream.
pub struct TapePlayer {
    blocks: Vec<Block>,
    cfg: PlayerConfig,
    saver: TapeSaver,
    index: usize,
    repeat: Option<(usize, i32)>,
    stream: Option<PulseStream>,
    current_level: bool,
    last_level: bool,
    real_time_ns: u64,
    sample_time: u64,
    wavelets: HashMap<(usize, bool), Rc<[i16]>>,
    silence: Rc<[i16]>,
    pending: VecDeque<Rc<[i16]>>,
    finished: bool,
}

impl TapePlayer {
    #[must_use]
    pub fn new(blocks: Vec<Block>, cfg: PlayerConfig) -> Self {
        let saver = TapeSaver::new(cfg.cpu_freq);
        Self {
            blocks,
            saver,
            index: 0,
            repeat: None,
            stream: None,
            current_level: false,
            last_level: false,
            real_time_ns: 0,
            sample_time: 0,
            wavelets: HashMap::new(),
            silence: vec![0i16; SILENCE_CHUNK].into(),
            pending: VecDeque::new(),
            finished: false,
            cfg,
        }
    }

    #[must_use]
    pub fn from_tzx(tzx: &TzxFile, cfg: PlayerConfig) -> Self {
        Self::new(tzx.blocks.clone(), cfg)
    }

    /// Total playback time so far, in nanoseconds of tape real time.
    #[must_use]
    pub fn elapsed_ns(&self) -> u64 {
        self.real_time_ns
    }

    /// Render the whole program into a WAV container.
    ///
    /// The container is finalized even when playback fails partway, so an
    /// interrupted export still leaves a readable file.
    pub fn write_wav<W: Write + Seek>(mut self, writer: W) -> Result<(), TapeError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.cfg.rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut wav = hound::WavWriter::new(writer, spec)?;

        let mut outcome = Ok(());
        for item in &mut self {
            match item {
                Ok(chunk) => {
                    for &sample in chunk.iter() {
                        wav.write_sample(sample)?;
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        // A short tail of silence, then close the container regardless
        for _ in 0..8 {
            wav.write_sample(0i16)?;
        }
        wav.finalize()?;
        outcome
    }

    /// Render the whole program to a WAV file on disk.
    pub fn save_wav(self, path: impl AsRef<Path>) -> Result<(), TapeError> {
        let file = BufWriter::new(File::create(path)?);
        self.write_wav(file)
    }

    /// Step the program counter to the next signal-producing block,
    /// executing control blocks on the way. Returns false when the program
    /// has ended.
    fn advance_block(&mut self) -> Result<bool, TapeError> {
        while self.index < self.blocks.len() {
            let i = self.index;
            self.index += 1;
            let block = &self.blocks[i];
            debug!("block {i:3} {:<30} {block}", block.type_name());

            match block {
                Block::LoopStart { repetitions } => {
                    if *repetitions <= 0 {
                        // Zero iterations: skip directly past the loop end
                        while self.index < self.blocks.len()
                            && !matches!(self.blocks[self.index], Block::LoopEnd)
                        {
                            self.index += 1;
                        }
                        if self.index < self.blocks.len() {
                            self.index += 1;
                        }
                    } else {
                        self.repeat = Some((self.index, i32::from(*repetitions)));
                    }
                }
                Block::LoopEnd => {
                    if let Some((start, remaining)) = self.repeat {
                        if remaining > 1 {
                            self.repeat = Some((start, remaining - 1));
                            self.index = start;
                            debug!("loop: back to block {start} ({} left)", remaining - 1);
                        } else {
                            self.repeat = None;
                        }
                    }
                }
                Block::JumpTo { relative } => {
                    let target = i as i64 + i64::from(*relative);
                    if target < 0 || target >= self.blocks.len() as i64 {
                        return Err(TapeError::JumpOutOfRange {
                            target,
                            count: self.blocks.len(),
                        });
                    }
                    self.index = target as usize;
                    debug!("jump to block {target}");
                }
                Block::Pause { duration_ms: 0 } if self.cfg.stop_on_pause => {
                    debug!("tape stopped");
                    break;
                }
                Block::StopTape48k if self.cfg.stop_48k => {
                    debug!("tape stopped (48k mode)");
                    break;
                }
                _ => {
                    // The driver's emission level restarts low per block;
                    // the saver keeps its own line parity across blocks
                    self.current_level = false;
                    self.last_level = false;
                    self.stream = Some(self.saver.block(block)?);
                    return Ok(true);
                }
            }
        }
        self.finished = true;
        Ok(false)
    }

    /// Account one half-wave: toggle the level, and emit a waveform chunk
    /// for every output sample the elapsed time has crossed.
    fn emit_pulse(&mut self, ns: u64) {
        self.current_level = !self.current_level;
        if ns == 0 {
            return;
        }
        self.real_time_ns += ns;
        let new_sample_time = (self.real_time_ns * u64::from(self.cfg.rate) + 500_000_000)
            / 1_000_000_000;
        let wavelen = (new_sample_time - self.sample_time) as usize;
        if wavelen == 0 {
            return;
        }

        if self.current_level == self.last_level {
            // No transition: a held level renders as silence
            let mut left = wavelen;
            while left > 0 {
                let n = left.min(SILENCE_CHUNK);
                if n == SILENCE_CHUNK {
                    self.pending.push_back(Rc::clone(&self.silence));
                } else {
                    self.pending.push_back(vec![0i16; n].into());
                }
                left -= n;
            }
        } else {
            let chunk = self.wavelet(wavelen, self.current_level);
            self.pending.push_back(chunk);
        }

        self.last_level = self.current_level;
        self.sample_time = new_sample_time;
    }

    /// One pulse shape, cached by (length, level).
    fn wavelet(&mut self, len: usize, level: bool) -> Rc<[i16]> {
        let sine = self.cfg.sine;
        Rc::clone(
            self.wavelets
                .entry((len, level))
                .or_insert_with(|| synthesize(len, level, sine)),
        )
    }
}

/// Build one pulse of `len` samples. Square pulses are flat at near full
/// scale; sine pulses are a half-period arc with the amplitude eased down
/// for very short pulses.
fn synthesize(len: usize, level: bool, sine: bool) -> Rc<[i16]> {
    let sign = if level { 1.0f64 } else { -1.0 };
    if sine {
        let amp = sign * (32767.0 * (len as f64 + 10.0) / 25.0).min(32767.0);
        (0..len)
            .map(|pos| (amp * (pos as f64 * std::f64::consts::PI / len as f64).sin()) as i16)
            .collect::<Vec<i16>>()
            .into()
    } else {
        let amp = (sign * 32000.0) as i16;
        vec![amp; len].into()
    }
}

impl Iterator for TapePlayer {
    type Item = Result<Rc<[i16]>, TapeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(Ok(chunk));
            }
            if self.finished {
                return None;
            }

            if let Some(stream) = self.stream.as_mut() {
                match stream.next() {
                    Some(ns) => self.emit_pulse(ns),
                    None => self.stream = None,
                }
            } else {
                match self.advance_block() {
                    Ok(_) => {}
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use format_tap::TapPayload;

    /// Build raw payload bytes from flag + body, computing the checksum.
    fn make_payload(flag: u8, body: &[u8]) -> TapPayload {
        let mut checksum = flag;
        for &b in body {
            checksum ^= b;
        }
        let mut raw = vec![flag];
        raw.extend_from_slice(body);
        raw.push(checksum);
        TapPayload::from_bytes(raw)
    }

    /// Drain the player, panicking on stream errors; returns total frames.
    fn total_frames(player: TapePlayer) -> usize {
        player
            .map(|item| item.expect("playback should not fail").len())
            .sum()
    }

    #[test]
    fn empty_program_produces_nothing() {
        let player = TapePlayer::new(vec![], PlayerConfig::default());
        assert_eq!(total_frames(player), 0);
    }

    #[test]
    fn pause_renders_expected_sample_count() {
        let player = TapePlayer::new(
            vec![Block::Pause { duration_ms: 100 }],
            PlayerConfig::default(),
        );
        // 100 ms at 44100 Hz
        assert_eq!(total_frames(player), 4410);
    }

    #[test]
    fn loop_repeats_pause_exactly_n_times() {
        let player = TapePlayer::new(
            vec![
                Block::LoopStart { repetitions: 3 },
                Block::Pause { duration_ms: 100 },
                Block::LoopEnd,
            ],
            PlayerConfig::default(),
        );
        assert_eq!(total_frames(player), 3 * 4410);
    }

    #[test]
    fn loop_with_zero_count_skips_the_body() {
        let player = TapePlayer::new(
            vec![
                Block::LoopStart { repetitions: 0 },
                Block::Pause { duration_ms: 100 },
                Block::LoopEnd,
                Block::Pause { duration_ms: 50 },
            ],
            PlayerConfig::default(),
        );
        // Only the pause after the loop plays
        assert_eq!(total_frames(player), 2205);
    }

    #[test]
    fn jump_skips_blocks() {
        let player = TapePlayer::new(
            vec![
                Block::JumpTo { relative: 2 },
                Block::Pause { duration_ms: 100 }, // jumped over
                Block::Pause { duration_ms: 50 },
            ],
            PlayerConfig::default(),
        );
        assert_eq!(total_frames(player), 2205);
    }

    #[test]
    fn jump_out_of_range_is_fatal() {
        for relative in [-1i16, 5] {
            let mut player = TapePlayer::new(
                vec![
                    Block::JumpTo { relative },
                    Block::Pause { duration_ms: 10 },
                ],
                PlayerConfig::default(),
            );
            let first = player.next().expect("one item");
            assert!(matches!(first, Err(TapeError::JumpOutOfRange { .. })));
            assert!(player.next().is_none(), "stream ends after a fatal error");
        }
    }

    #[test]
    fn stop_on_pause_is_gated_by_flag() {
        let blocks = vec![
            Block::Pause { duration_ms: 0 },
            Block::Pause { duration_ms: 100 },
        ];

        // Flag off: the zero pause is silent, playback continues
        let player = TapePlayer::new(blocks.clone(), PlayerConfig::default());
        assert_eq!(total_frames(player), 4410);

        // Flag on: playback stops at the marker
        let cfg = PlayerConfig {
            stop_on_pause: true,
            ..PlayerConfig::default()
        };
        let player = TapePlayer::new(blocks, cfg);
        assert_eq!(total_frames(player), 0);
    }

    #[test]
    fn stop_48k_is_gated_by_flag() {
        let blocks = vec![
            Block::StopTape48k,
            Block::Pause { duration_ms: 100 },
        ];

        let player = TapePlayer::new(blocks.clone(), PlayerConfig::default());
        assert_eq!(total_frames(player), 4410);

        let cfg = PlayerConfig {
            stop_48k: true,
            ..PlayerConfig::default()
        };
        let player = TapePlayer::new(blocks, cfg);
        assert_eq!(total_frames(player), 0);
    }

    #[test]
    fn pure_tone_renders_alternating_pulses() {
        // 1000 pulses of 2168 T-states at 3.5 MHz ≈ 619.4 µs... keep it
        // small: each pulse is 2168/3.5e6 s ≈ 27.3 samples at 44.1 kHz
        let player = TapePlayer::new(
            vec![Block::PureTone {
                pulse_len: 2168,
                count: 100,
            }],
            PlayerConfig::default(),
        );

        let mut positive = 0usize;
        let mut negative = 0usize;
        let mut frames = 0usize;
        for item in player {
            let chunk = item.expect("tone");
            frames += chunk.len();
            if chunk.iter().any(|&s| s > 0) {
                positive += 1;
            }
            if chunk.iter().any(|&s| s < 0) {
                negative += 1;
            }
        }
        // 100 pulses * 2168 T / 3.5 MHz * 44100 Hz ≈ 2732 frames
        assert!((2700..=2760).contains(&frames), "got {frames} frames");
        assert!(positive >= 49 && negative >= 49, "levels should alternate");
    }

    #[test]
    fn standard_block_renders_and_is_loud() {
        let player = TapePlayer::new(
            vec![Block::StandardSpeed {
                pause_ms: 0,
                payload: make_payload(0xFF, &[0x55, 0xAA]),
            }],
            PlayerConfig::default(),
        );

        let mut frames = 0usize;
        let mut peak = 0i16;
        for item in player {
            let chunk = item.expect("block");
            frames += chunk.len();
            for &s in chunk.iter() {
                peak = peak.max(s.unsigned_abs() as i16);
            }
        }
        // 3223 pilot pulses dominate: ≈ 3223 * 2168 / 3.5e6 s ≈ 2 s
        assert!(frames > 80000, "got {frames} frames");
        assert_eq!(peak, 32000);
    }

    #[test]
    fn sine_pulses_are_shaped() {
        let cfg = PlayerConfig {
            sine: true,
            ..PlayerConfig::default()
        };
        let player = TapePlayer::new(
            vec![Block::PureTone {
                pulse_len: 2168,
                count: 4,
            }],
            cfg,
        );

        for item in player {
            let chunk = item.expect("tone");
            if chunk.len() < 4 {
                continue;
            }
            // A sine arc starts and ends near zero and peaks in the middle
            let mid = chunk[chunk.len() / 2].unsigned_abs();
            assert!(chunk[0].unsigned_abs() < mid);
        }
    }

    #[test]
    fn unsupported_block_fails_playback() {
        let mut player = TapePlayer::new(
            vec![Block::CswRecording { raw: vec![1, 2] }],
            PlayerConfig::default(),
        );
        assert!(matches!(
            player.next(),
            Some(Err(TapeError::Unsupported(_)))
        ));
    }

    #[test]
    fn wav_export_writes_a_readable_container() {
        let player = TapePlayer::new(
            vec![Block::Pause { duration_ms: 10 }],
            PlayerConfig::default(),
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        player.write_wav(&mut cursor).expect("export");

        let raw = cursor.into_inner();
        let reader = hound::WavReader::new(std::io::Cursor::new(raw)).expect("readable WAV");
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 44100);
        // 441 frames of pause + 8 frames of tail silence
        assert_eq!(reader.duration(), 449);
    }

    #[test]
    fn wav_export_finalizes_even_on_error() {
        let player = TapePlayer::new(
            vec![
                Block::Pause { duration_ms: 10 },
                Block::JumpTo { relative: 100 },
            ],
            PlayerConfig::default(),
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        let result = player.write_wav(&mut cursor);
        assert!(matches!(result, Err(TapeError::JumpOutOfRange { .. })));

        // The container is still well-formed and holds the rendered prefix
        let raw = cursor.into_inner();
        let reader = hound::WavReader::new(std::io::Cursor::new(raw)).expect("readable WAV");
        assert_eq!(reader.duration(), 449);
    }
}
