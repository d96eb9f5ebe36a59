//! Bounded sliding window over a PCM source.
//!
//! The demodulator scans a short stretch of samples ahead of a cursor that
//! only ever moves forward. The window buffers just enough frames to hold
//! the longest pulse of interest; advancing the cursor discards consumed
//! samples so memory stays bounded however long the tape is.
//!
//! All tape timing constants are defined in CPU T-states, so the window also
//! owns the unit conversion between frame counts and T-states for its
//! source's rate against a configured reference clock.

use std::collections::VecDeque;

use crate::error::TapeError;
use crate::source::PcmSource;

/// Progress callback: (current frame, total frames), monotonically
/// increasing. Must not block the producer for unbounded time.
pub type ProgressFn<'a> = Box<dyn FnMut(u64, u64) + 'a>;

/// Frames skipped per read while seeking to a start position.
const SKIP_CHUNK: usize = 1000;

pub struct SampleWindow<'a, S: PcmSource> {
    source: S,
    samples: VecDeque<f32>,
    capacity: usize,
    position: u64,
    /// Invert the polarity of every read without touching stored data.
    pub invert: bool,
    start_frame: Option<u64>,
    end_frame: Option<u64>,
    cpu_freq: u32,
    progress: Option<ProgressFn<'a>>,
    scratch: Vec<f32>,
}

impl<'a, S: PcmSource> SampleWindow<'a, S> {
    /// Create a window sized to hold `window_tstates` worth of samples at
    /// the source's rate.
    pub fn new(source: S, cpu_freq: u32, window_tstates: f64) -> Self {
        let capacity =
            ((window_tstates * f64::from(source.sample_rate())) / f64::from(cpu_freq)) as usize;
        Self {
            samples: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
            position: 0,
            invert: false,
            start_frame: None,
            end_frame: None,
            cpu_freq,
            progress: None,
            scratch: Vec::new(),
            source,
        }
    }

    /// Restrict reading to a frame range of the source. Frames before
    /// `start` are skipped on the first refill; advancing past `end` raises
    /// end-of-stream.
    pub fn set_range(&mut self, start: Option<u64>, end: Option<u64>) {
        self.start_frame = start;
        self.end_frame = end;
    }

    pub fn set_progress(&mut self, progress: ProgressFn<'a>) {
        self.progress = Some(progress);
    }

    /// Current cursor position, in source frames.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Buffered samples currently ahead of the cursor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The buffered sample at relative index `i`, polarity applied.
    ///
    /// Callers must have buffered at least `i + 1` samples.
    #[must_use]
    pub fn sample(&self, i: usize) -> f32 {
        let v = self.samples[i];
        if self.invert { -v } else { v }
    }

    /// Skip ahead to the configured start frame, discarding samples.
    fn skip_to_start(&mut self) -> Result<(), TapeError> {
        let Some(start) = self.start_frame.take() else {
            return Ok(());
        };
        if self.position >= start {
            return Ok(());
        }
        let mut remaining = (start - self.position) as usize;
        self.position = start;
        while remaining > 0 {
            self.scratch.clear();
            let n = self
                .source
                .read_into(&mut self.scratch, remaining.min(SKIP_CHUNK))?;
            if n == 0 {
                return Err(TapeError::EndOfStream);
            }
            remaining -= n;
        }
        Ok(())
    }

    /// Refill the buffer to capacity. Raises end-of-stream only when the
    /// source yields nothing at all for a non-empty request.
    pub fn fill(&mut self) -> Result<(), TapeError> {
        self.skip_to_start()?;
        let missing = self.capacity - self.samples.len();
        if missing == 0 {
            return Ok(());
        }
        self.scratch.clear();
        let n = self.source.read_into(&mut self.scratch, missing)?;
        if n == 0 {
            return Err(TapeError::EndOfStream);
        }
        self.samples.extend(self.scratch.iter().copied());
        Ok(())
    }

    /// Block until at least `needed` samples are buffered ahead of the
    /// cursor, refilling from the source.
    pub fn ensure(&mut self, needed: usize) -> Result<(), TapeError> {
        self.skip_to_start()?;
        if self.samples.len() >= needed {
            return Ok(());
        }
        self.fill()?;
        if self.samples.len() < needed {
            // The tail of the source is too short to analyze
            return Err(TapeError::EndOfStream);
        }
        Ok(())
    }

    /// Discard `frames` samples, advancing the cursor.
    pub fn advance(&mut self, frames: usize) -> Result<(), TapeError> {
        if frames == 0 {
            return Ok(());
        }
        self.ensure(frames)?;
        self.samples.drain(..frames);
        self.position += frames as u64;
        if let Some(end) = self.end_frame {
            if self.position > end {
                return Err(TapeError::EndOfStream);
            }
        }
        self.report_progress();
        Ok(())
    }

    /// Minimum, maximum and mean over the next `frames` buffered samples.
    pub fn min_max_avg(&mut self, frames: usize) -> Result<(f32, f32, f32), TapeError> {
        self.ensure(frames)?;
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let mut sum = 0.0f64;
        for i in 0..frames {
            let v = self.sample(i);
            min = min.min(v);
            max = max.max(v);
            sum += f64::from(v);
        }
        Ok((min, max, (sum / frames as f64) as f32))
    }

    /// Advance to the next rising edge: a negative sample followed by a
    /// non-negative one, cursor left on the first non-negative sample.
    pub fn next_rising_edge(&mut self) -> Result<(), TapeError> {
        self.ensure(2)?;
        while !(self.sample(0) < 0.0 && self.sample(1) >= 0.0) {
            self.advance(1)?;
            self.ensure(2)?;
        }
        self.advance(1)
    }

    /// Convert T-states to a frame count at the source rate (truncating).
    #[must_use]
    pub fn to_frames(&self, t_states: f64) -> usize {
        ((t_states * f64::from(self.source.sample_rate())) / f64::from(self.cpu_freq)) as usize
    }

    /// Convert a frame count to T-states at the source rate.
    #[must_use]
    pub fn to_t_states(&self, frames: f64) -> f64 {
        frames * f64::from(self.cpu_freq) / f64::from(self.source.sample_rate())
    }

    /// Convert a frame count to milliseconds.
    #[must_use]
    pub fn to_millis(&self, frames: u64) -> u64 {
        frames * 1000 / u64::from(self.source.sample_rate())
    }

    /// Fire the final (total, total) progress call at end of capture.
    pub fn finish_progress(&mut self) {
        let total = self.source.total_frames();
        if let Some(progress) = self.progress.as_mut() {
            progress(total, total);
        }
    }

    fn report_progress(&mut self) {
        let total = self.source.total_frames();
        if let Some(progress) = self.progress.as_mut() {
            progress(self.position, total);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryPcmSource;

    const CPU: u32 = 3_500_000;

    fn window_over(samples: Vec<f32>, rate: u32, window_tstates: f64) -> SampleWindow<'static, MemoryPcmSource> {
        SampleWindow::new(MemoryPcmSource::new(samples, rate), CPU, window_tstates)
    }

    #[test]
    fn unit_conversions() {
        // 44100 Hz against 3.5 MHz: 2168 T-states ≈ 27 frames
        let w = window_over(vec![], 44100, 6000.0);
        assert_eq!(w.to_frames(2168.0), 27);
        let t = w.to_t_states(27.0);
        assert!((t - 2142.8).abs() < 1.0, "got {t}");
        assert_eq!(w.to_millis(44100), 1000);
    }

    #[test]
    fn ensure_and_advance() {
        let mut w = window_over((0..100).map(|i| i as f32).collect(), 44100, 6000.0);
        w.ensure(10).expect("ensure");
        assert_eq!(w.sample(0), 0.0);
        assert_eq!(w.sample(9), 9.0);

        w.advance(5).expect("advance");
        assert_eq!(w.position(), 5);
        assert_eq!(w.sample(0), 5.0);
    }

    #[test]
    fn ensure_past_end_is_end_of_stream() {
        let mut w = window_over(vec![1.0; 10], 44100, 6000.0);
        w.advance(10).expect("consume all");
        assert!(matches!(w.ensure(1), Err(TapeError::EndOfStream)));
    }

    #[test]
    fn polarity_invert_applies_to_reads() {
        let mut w = window_over(vec![5.0, -3.0], 44100, 6000.0);
        w.ensure(2).expect("ensure");
        assert_eq!(w.sample(0), 5.0);
        w.invert = true;
        assert_eq!(w.sample(0), -5.0);
        assert_eq!(w.sample(1), 3.0);
    }

    #[test]
    fn min_max_avg_over_range() {
        let mut w = window_over(vec![-4.0, 0.0, 8.0, 2.0], 44100, 6000.0);
        let (min, max, avg) = w.min_max_avg(4).expect("stats");
        assert_eq!(min, -4.0);
        assert_eq!(max, 8.0);
        assert!((avg - 1.5).abs() < f32::EPSILON);
    }

    #[test]
    fn rising_edge_positions_on_first_positive() {
        let mut w = window_over(vec![3.0, 1.0, -2.0, -1.0, 4.0, 5.0], 44100, 6000.0);
        w.next_rising_edge().expect("edge");
        assert_eq!(w.position(), 4);
        assert_eq!(w.sample(0), 4.0);
    }

    #[test]
    fn start_frame_skips_and_end_frame_terminates() {
        let mut w = window_over((0..50).map(|i| i as f32).collect(), 44100, 6000.0);
        w.set_range(Some(10), Some(20));
        w.ensure(1).expect("ensure after skip");
        assert_eq!(w.position(), 10);
        assert_eq!(w.sample(0), 10.0);

        assert!(matches!(w.advance(15), Err(TapeError::EndOfStream)));
    }

    #[test]
    fn progress_reports_monotonically() {
        let mut seen: Vec<u64> = Vec::new();
        {
            let mut w = SampleWindow::new(
                MemoryPcmSource::new(vec![0.0; 30], 44100),
                CPU,
                1000.0,
            );
            w.set_progress(Box::new(|current, total| {
                assert_eq!(total, 30);
                seen.push(current);
            }));
            w.advance(5).expect("advance");
            w.advance(7).expect("advance");
            w.finish_progress();
        }
        assert_eq!(seen, vec![5, 12, 30]);
    }
}
