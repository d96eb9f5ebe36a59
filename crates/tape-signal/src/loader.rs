//! Tape demodulator: recovers TAP payloads from a digitized tape signal.
//!
//! Works one block at a time through four stages: hunt for the leader tone,
//! track it while measuring the tape's actual speed, lock onto the sync
//! pulse pair, then classify bit pulses until the signal gives out. All
//! expected pulse widths are scaled from a rolling average of observed
//! leader periods, so a tape recorded fast or slow still decodes.
//!
//! A block that cannot be recovered is skipped and the hunt resumes at the
//! current position — losing one block never aborts the capture. Running
//! out of samples ends the session, returning everything decoded so far.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, trace};

use format_tap::TapPayload;
use format_tzx::TzxFile;

use crate::assembler::TapAssembler;
use crate::error::TapeError;
use crate::source::{PcmSource, WavPcmSource};
use crate::window::{ProgressFn, SampleWindow};

// ---------------------------------------------------------------------------
// Standard ZX Spectrum half-wave timings (T-states)
// ---------------------------------------------------------------------------

const LEADER_T: f64 = 2168.0; // leader pulse
const SYNC_T: f64 = 701.0; // sync pulse, averaged over on (667) and off (735)
const LOW_T: f64 = 855.0; // 0-bit pulse
const HIGH_T: f64 = 1710.0; // 1-bit pulse

/// Demodulator tuning.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Minimum peak-to-peak amplitude for a stretch of signal to count as
    /// sound rather than noise, in 16-bit sample units.
    pub threshold: f32,
    /// Accepted deviation factor around expected pulse widths.
    pub tolerance: f64,
    /// Leader pulses that must be tracked before sync detection arms.
    pub leader_min: usize,
    /// Reference CPU clock the tape was mastered against, in Hz.
    pub cpu_freq: u32,
    /// Stereo downmix weight for the left channel.
    pub left_mix: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            threshold: 3500.0,
            tolerance: 1.2,
            leader_min: 20,
            cpu_freq: 3_500_000,
            left_mix: 0.5,
        }
    }
}

/// Per-block demodulation outcome. `Skip` is the recoverable case: the
/// block was lost, try again from the current position.
enum BlockOutcome {
    Recovered {
        payload: TapPayload,
        start: u64,
        end: u64,
    },
    Skip,
    EndOfStream,
}

/// Tape demodulator. One loader can run any number of captures.
#[derive(Debug, Clone, Default)]
pub struct TapeLoader {
    config: LoaderConfig,
}

impl TapeLoader {
    #[must_use]
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Demodulate an entire sample stream into a tape image.
    pub fn load<S: PcmSource>(&self, source: S) -> Result<TzxFile, TapeError> {
        self.load_range(source, None, None, None)
    }

    /// Demodulate a frame range of a sample stream, with an optional
    /// progress callback.
    pub fn load_range<S: PcmSource>(
        &self,
        source: S,
        start_frame: Option<u64>,
        end_frame: Option<u64>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<TzxFile, TapeError> {
        // The window must hold one leader period of either polarity plus
        // slack for drift
        let window_tstates = LEADER_T * 2.2 * self.config.tolerance;
        let mut window = SampleWindow::new(source, self.config.cpu_freq, window_tstates);
        window.set_range(start_frame, end_frame);
        if let Some(progress) = progress {
            window.set_progress(progress);
        }

        let mut session = Session {
            window,
            cfg: &self.config,
            last_pulse: 0,
        };

        let mut tzx = TzxFile::new();
        loop {
            match session.read_block()? {
                BlockOutcome::Recovered {
                    payload,
                    start,
                    end,
                } => {
                    let millis = session.window.to_millis(start);
                    debug!(
                        "{}:{:02}.{:03} frames {start}..{end}: {payload}",
                        millis / 60000,
                        millis / 1000 % 60,
                        millis % 1000,
                    );
                    tzx.blocks.push(TzxFile::wrap_payload(payload));
                }
                BlockOutcome::Skip => {}
                BlockOutcome::EndOfStream => break,
            }
        }
        session.window.finish_progress();
        Ok(tzx)
    }

    /// Demodulate a WAV file from disk.
    pub fn load_wav_file(&self, path: impl AsRef<Path>) -> Result<TzxFile, TapeError> {
        let reader = BufReader::new(File::open(path)?);
        let source = WavPcmSource::new(reader, self.config.left_mix)?;
        self.load(source)
    }
}

fn sgn(v: f32) -> i32 {
    if v >= 0.0 { 1 } else { -1 }
}

// ---------------------------------------------------------------------------
// Capture session
// ---------------------------------------------------------------------------

/// State for one capture run: the sample window plus the position of the
/// pulse currently under test. Created per capture, discarded afterwards.
struct Session<'a, 'p, S: PcmSource> {
    window: SampleWindow<'p, S>,
    cfg: &'a LoaderConfig,
    last_pulse: u64,
}

impl<S: PcmSource> Session<'_, '_, S> {
    /// Demodulate the next block, mapping stream exhaustion to a clean
    /// outcome. Any other error is fatal.
    fn read_block(&mut self) -> Result<BlockOutcome, TapeError> {
        match self.try_block() {
            Ok(outcome) => Ok(outcome),
            Err(TapeError::EndOfStream) => Ok(BlockOutcome::EndOfStream),
            Err(e) => Err(e),
        }
    }

    fn try_block(&mut self) -> Result<BlockOutcome, TapeError> {
        let mut assembler = TapAssembler::new();
        self.window.invert = false;

        // Hunt for the leader tone: skip ahead one expected period at a
        // time until a plausible leader pulse shows up
        self.window.next_rising_edge()?;
        let mut length = self.test_leader_pulse()?;
        while length.is_none() {
            let skip = self.window.to_frames(LEADER_T / self.cfg.tolerance);
            self.window.advance(skip)?;
            self.window.next_rising_edge()?;
            length = self.test_leader_pulse()?;
        }
        let leader_pos = self.last_pulse;

        // Track the leader, adapting to the tape's speed, until the sync
        // pulse interrupts it
        let capacity = self.cfg.leader_min.max(20);
        let mut leader_lengths: VecDeque<f64> = VecDeque::with_capacity(capacity);
        if let Some(t) = length {
            leader_lengths.push_back(t);
        }
        let sync_pos;
        loop {
            if let Some(t) = self.test_leader_pulse()? {
                if leader_lengths.len() == capacity {
                    leader_lengths.pop_front();
                }
                leader_lengths.push_back(t);
                continue;
            }

            if leader_lengths.len() >= self.cfg.leader_min {
                let avg = leader_lengths.iter().sum::<f64>() / leader_lengths.len() as f64;
                let expected_sync = 1.1 * avg * SYNC_T / LEADER_T;
                if self.test_sync_pulse(expected_sync)?.is_some() {
                    sync_pos = self.last_pulse;
                    break;
                }
            }

            // Leader lost before sync — give up on this block
            debug!(
                "leader lost at frame {} after {} pulses",
                self.window.position(),
                leader_lengths.len()
            );
            return Ok(BlockOutcome::Skip);
        }
        trace!("sync locked at frame {sync_pos}");

        // Decode data bits, both widths scaled from the observed leader
        let avg = leader_lengths.iter().sum::<f64>() / leader_lengths.len() as f64;
        let expected_low = avg * LOW_T / LEADER_T;
        let expected_high = avg * HIGH_T / LEADER_T;
        let mut let_me_guess = false;

        loop {
            let low = self.test_bit_pulse(expected_low, '0')?;
            let high = self.test_bit_pulse(expected_high, '1')?;

            match (low, high) {
                // A certain bit re-arms the single-guess allowance
                (Some((true, frames)), _) => {
                    let_me_guess = true;
                    self.advance_bit(false, frames, "")?;
                    assembler.shift(false);
                }
                (_, Some((true, frames))) => {
                    let_me_guess = true;
                    self.advance_bit(true, frames, "")?;
                    assembler.shift(true);
                }
                // Not sure, but only one candidate is in range
                (Some((false, frames)), None) => {
                    self.advance_bit(false, frames, "gap")?;
                    assembler.shift(false);
                }
                (None, Some((false, frames))) => {
                    self.advance_bit(true, frames, "gap")?;
                    assembler.shift(true);
                }
                // Both plausible but neither clean: tolerate one broken
                // low half-wave, then demand certainty again
                (Some((false, frames)), Some((false, _))) if let_me_guess => {
                    let_me_guess = false;
                    self.advance_bit(false, frames, "noise")?;
                    assembler.shift(false);
                }
                _ => break,
            }
        }

        // The bit stream ended. Anything shorter than flag + byte + checksum
        // cannot be a real block.
        if assembler.len() <= 2 {
            debug!(
                "block at frame {leader_pos} too short ({} bytes), skipping",
                assembler.len()
            );
            return Ok(BlockOutcome::Skip);
        }
        Ok(BlockOutcome::Recovered {
            payload: assembler.finish(),
            start: leader_pos,
            end: self.window.position(),
        })
    }

    /// Measure one same-sign run at the cursor and accept it as a leader
    /// half-wave if its width is in the leader window. Advances past the
    /// pulse on success, stays put otherwise.
    fn test_leader_pulse(&mut self) -> Result<Option<f64>, TapeError> {
        self.window.fill()?;
        self.last_pulse = self.window.position();

        let tol = self.cfg.tolerance;
        let min_range = self.window.to_frames(LEADER_T / (1.3 * tol));
        let max_range = self.window.to_frames(LEADER_T * 1.1 * tol);

        let start_sign = sgn(self.window.sample(0));
        let mut count = 1usize;
        loop {
            if count >= self.window.len() {
                return Err(TapeError::EndOfStream);
            }
            if sgn(self.window.sample(count)) != start_sign {
                break;
            }
            count += 1;
            if count > max_range {
                return Ok(None);
            }
        }

        if !(min_range..=max_range).contains(&count) {
            return Ok(None);
        }

        let length = self.window.to_t_states(count as f64);
        trace!("leader pulse {length:.0}T at frame {}", self.last_pulse);
        self.window.advance(count)?;
        Ok(Some(length))
    }

    /// Probe for the sync pulse: amplitude check, then a single full-wave
    /// test in normal polarity and, failing that, inverted. A match locks
    /// the polarity for the rest of the block.
    fn test_sync_pulse(&mut self, t_cycles: f64) -> Result<Option<f64>, TapeError> {
        self.last_pulse = self.window.position();
        self.window.fill()?;

        let frames = self.window.to_frames(t_cycles * 2.0);
        let (minv, maxv, bias) = self.window.min_max_avg(frames)?;
        if (maxv - minv).abs() < self.cfg.threshold {
            trace!("sync below threshold: {} < {}", (maxv - minv).abs(), self.cfg.threshold);
            return Ok(None);
        }

        self.window.invert = false;
        let mut bias = bias;
        let mut count = self.find_zero_crossing(frames, bias);
        if count.is_none() {
            self.window.invert = true;
            bias = -bias;
            count = self.find_zero_crossing(frames, bias);
        }
        let Some(count) = count else {
            return Ok(None);
        };

        let half = count / 2;
        if half == 0 {
            return Ok(None);
        }
        let w1 = self.mean(0, half, half);
        let w2 = self.mean(half, count, half);
        if !(w1 < bias && w2 > bias && (w2 - w1).abs() >= self.cfg.threshold / 2.0) {
            trace!("sync not a full wave: w1={w1} w2={w2} bias={bias}");
            return Ok(None);
        }

        let length = self.window.to_t_states(count as f64 / 2.0);
        trace!("sync pulse {length:.0}T at frame {}", self.last_pulse);
        self.window.advance(count)?;
        Ok(Some(length))
    }

    /// Probe for one data bit of the given half-wave width. Returns `None`
    /// if no wave of plausible size is present, `Some((false, frames))` for
    /// a wave of the right size but broken shape, `Some((true, frames))`
    /// for a clean full wave. Never advances the cursor.
    fn test_bit_pulse(
        &mut self,
        t_cycles: f64,
        tag: char,
    ) -> Result<Option<(bool, usize)>, TapeError> {
        self.last_pulse = self.window.position();
        self.window.fill()?;

        let frames = self.window.to_frames(t_cycles * 2.0);
        let (minv, maxv, bias) = self.window.min_max_avg(frames)?;
        if (maxv - minv).abs() < self.cfg.threshold {
            trace!("{tag} below threshold: {} < {}", (maxv - minv).abs(), self.cfg.threshold);
            return Ok(None);
        }

        let Some(count) = self.find_zero_crossing(frames, bias) else {
            return Ok(None);
        };

        let half = count / 2;
        if half == 0 {
            return Ok(None);
        }
        let w1 = self.mean(0, half, half);
        let w2 = self.mean(half, count, half);
        if !(w1 < bias && w2 > bias && (w2 - w1).abs() >= self.cfg.threshold) {
            trace!("{tag} not a full wave: w1={w1} w2={w2} bias={bias}");
            return Ok(Some((false, count)));
        }

        Ok(Some((true, count)))
    }

    fn advance_bit(&mut self, bit: bool, count: usize, tag: &str) -> Result<(), TapeError> {
        trace!(
            "bit {} ({:.0}T) at frame {} {tag}",
            u8::from(bit),
            self.window.to_t_states(count as f64 / 2.0),
            self.last_pulse,
        );
        self.window.advance(count)
    }

    /// Locate the end of a full wave near the expected length: walk back
    /// from `frames` into the above-bias half, then forward to where the
    /// signal drops back to bias. Both walks are bounded by the tolerance
    /// window.
    fn find_zero_crossing(&self, frames: usize, bias: f32) -> Option<usize> {
        let tol = self.cfg.tolerance;
        let count_l = (frames as f64 / tol) as usize;
        let count_h = (frames as f64 * tol) as usize;
        let mut count = frames;

        loop {
            if count >= self.window.len() {
                return None;
            }
            if self.window.sample(count) > bias {
                break;
            }
            if count == 0 {
                return None;
            }
            count -= 1;
            if count < count_l {
                return None;
            }
        }

        loop {
            count += 1;
            if count > count_h || count >= self.window.len() {
                return None;
            }
            if self.window.sample(count) <= bias {
                return Some(count);
            }
        }
    }

    /// Mean of the buffered samples in `[from, to)`, divided by `div`
    /// (the half-wave length, also for the possibly longer second half).
    fn mean(&self, from: usize, to: usize, div: usize) -> f32 {
        let sum: f64 = (from..to).map(|i| f64::from(self.window.sample(i))).sum();
        (sum / div as f64) as f32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
