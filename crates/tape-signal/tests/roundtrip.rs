//! End-to-end scenarios: WAV capture, playback rendering, and the full
//! modulate → demodulate circle.

use std::io::Cursor;

use format_tzx::{Block, TzxFile};
use tape_signal::{LoaderConfig, PlayerConfig, TapeLoader, TapePlayer, WavPcmSource};

const RATE: u32 = 44100;
const CPU: u32 = 3_500_000;

/// Square-wave synthesizer writing 16-bit mono WAV frames.
struct WavSynth {
    samples: Vec<i16>,
    level: i16,
}

impl WavSynth {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            level: 8000,
        }
    }

    fn frames(t_states: f64) -> usize {
        (t_states * f64::from(RATE) / f64::from(CPU)).round() as usize
    }

    fn pulse(&mut self, t_states: f64) {
        for _ in 0..Self::frames(t_states) {
            self.samples.push(self.level);
        }
        self.level = -self.level;
    }

    fn silence(&mut self, frames: usize) {
        self.samples.extend(std::iter::repeat_n(0i16, frames));
    }

    fn byte(&mut self, byte: u8) {
        for i in (0..8).rev() {
            let width = if byte & (1 << i) != 0 { 1710.0 } else { 855.0 };
            self.pulse(width);
            self.pulse(width);
        }
    }

    fn into_wav(self) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("WAV writer");
            for s in self.samples {
                writer.write_sample(s).expect("sample");
            }
            writer.finalize().expect("finalize");
        }
        cursor.into_inner()
    }
}

fn capture(wav: Vec<u8>) -> TzxFile {
    let source = WavPcmSource::new(Cursor::new(wav), 0.5).expect("WAV source");
    TapeLoader::new(LoaderConfig::default())
        .load(source)
        .expect("capture")
}

#[test]
fn standard_speed_wav_demodulates_to_one_block() {
    // A 44.1 kHz mono recording: 2168 leader pulses of 2168 T-states, the
    // 667/735 sync pair, then flag + 3 data bytes + checksum at standard
    // bit timing
    let source_bytes = [0x21u8, 0x42, 0x84];
    let mut synth = WavSynth::new();
    synth.silence(800);
    for _ in 0..2168 {
        synth.pulse(2168.0);
    }
    synth.pulse(667.0);
    synth.pulse(735.0);
    let mut checksum = 0xFFu8;
    synth.byte(0xFF);
    for &b in &source_bytes {
        checksum ^= b;
        synth.byte(b);
    }
    synth.byte(checksum);
    synth.silence(5000);

    let tzx = capture(synth.into_wav());
    assert_eq!(tzx.blocks.len(), 1);

    let payload = tzx.blocks[0].payload().expect("data block");
    assert!(payload.valid());
    assert_eq!(payload.flag(), Some(0xFF));
    assert_eq!(payload.body(), &source_bytes);
}

#[test]
fn playback_then_capture_returns_the_same_payload() {
    // Modulate a tape image to WAV, then demodulate the WAV back
    let body = [0x01u8, 0x02, 0x03, 0xFE, 0x55];
    let mut raw = vec![0xFFu8];
    raw.extend_from_slice(&body);
    raw.push(raw.iter().fold(0, |acc, &b| acc ^ b));
    let payload = format_tap::TapPayload::from_bytes(raw);

    let mut tzx = TzxFile::new();
    tzx.blocks.push(Block::StandardSpeed {
        pause_ms: 200,
        payload: payload.clone(),
    });

    let player = TapePlayer::from_tzx(&tzx, PlayerConfig::default());
    let mut cursor = Cursor::new(Vec::new());
    player.write_wav(&mut cursor).expect("render");

    let recovered = capture(cursor.into_inner());
    assert_eq!(recovered.blocks.len(), 1);
    let recovered_payload = recovered.blocks[0].payload().expect("payload");
    assert!(recovered_payload.valid());
    assert_eq!(recovered_payload, &payload);
}

#[test]
fn looped_pause_renders_three_segments() {
    // Loop(3) around a 100 ms pause: exactly 300 ms of silence
    let mut tzx = TzxFile::new();
    tzx.blocks.push(Block::LoopStart { repetitions: 3 });
    tzx.blocks.push(Block::Pause { duration_ms: 100 });
    tzx.blocks.push(Block::LoopEnd);

    let player = TapePlayer::from_tzx(&tzx, PlayerConfig::default());
    let mut cursor = Cursor::new(Vec::new());
    player.write_wav(&mut cursor).expect("render");

    let reader = hound::WavReader::new(Cursor::new(cursor.into_inner())).expect("WAV");
    // 3 * 4410 frames of pause, plus the 8-frame closing tail
    assert_eq!(reader.duration(), 3 * 4410 + 8);

    let samples: Vec<i16> = reader
        .into_samples::<i16>()
        .map(|s| s.expect("sample"))
        .collect();
    assert!(samples.iter().all(|&s| s == 0), "pauses must be silent");
}

#[test]
fn tap_file_survives_the_tzx_detour() {
    // A legacy TAP container read as TZX and exported again is unchanged
    let mut tap = Vec::new();
    for body in [&[0x00u8; 17][..], &[0x10, 0x20, 0x30][..]] {
        let flag: u8 = if body.len() == 17 { 0x00 } else { 0xFF };
        let mut fragment = vec![flag];
        fragment.extend_from_slice(body);
        fragment.push(fragment.iter().fold(0, |acc, &b| acc ^ b));
        tap.extend_from_slice(&(fragment.len() as u16).to_le_bytes());
        tap.extend_from_slice(&fragment);
    }

    let tzx = TzxFile::parse(&tap).expect("TAP auto-detection");
    assert_eq!(tzx.blocks.len(), 2);
    let exported = tzx.write_tap(false).expect("export");
    assert_eq!(exported, tap);
}

#[test]
fn turbo_block_roundtrips_through_playback() {
    // A mildly non-standard turbo block still demodulates, because the
    // loader adapts its expectations to the observed leader speed
    let body = [0xAAu8, 0x5A, 0xC3];
    let mut raw = vec![0xFFu8];
    raw.extend_from_slice(&body);
    raw.push(raw.iter().fold(0, |acc, &b| acc ^ b));

    let mut tzx = TzxFile::new();
    tzx.blocks.push(Block::TurboSpeed {
        pilot_pulse: 2100,
        sync1: 646,
        sync2: 712,
        zero_pulse: 828,
        one_pulse: 1656,
        pilot_count: 2000,
        used_bits: 8,
        pause_ms: 150,
        payload: format_tap::TapPayload::from_bytes(raw),
    });

    let player = TapePlayer::from_tzx(&tzx, PlayerConfig::default());
    let mut cursor = Cursor::new(Vec::new());
    player.write_wav(&mut cursor).expect("render");

    let recovered = capture(cursor.into_inner());
    assert_eq!(recovered.blocks.len(), 1);
    let payload = recovered.blocks[0].payload().expect("payload");
    assert!(payload.valid());
    assert_eq!(payload.body(), &body);
}
