//! Bit-to-byte assembly for demodulated streams.

use format_tap::TapPayload;
use log::trace;

/// Diagnostic callback fired per completed byte: (byte, checksum so far,
/// bytes assembled).
pub type ByteFn<'a> = Box<dyn FnMut(u8, u8, usize) + 'a>;

/// Shift register that turns a decoded bit stream into tape bytes,
/// maintaining the running XOR checksum as it goes.
///
/// Bits arrive MSB first, matching the standard ZX tape modulation.
#[derive(Default)]
pub struct TapAssembler<'a> {
    data: Vec<u8>,
    crc: u8,
    shifter: u8,
    bits: u8,
    callback: Option<ByteFn<'a>>,
}

impl<'a> TapAssembler<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&mut self, callback: ByteFn<'a>) {
        self.callback = Some(callback);
    }

    /// Shift in one bit. Every eighth bit completes a byte, folds it into
    /// the checksum and appends it to the output buffer.
    pub fn shift(&mut self, bit: bool) {
        self.shifter <<= 1;
        if bit {
            self.shifter |= 1;
        }
        self.bits += 1;
        if self.bits == 8 {
            self.crc ^= self.shifter;
            self.data.push(self.shifter);
            trace!(
                "assembled byte {:5}: {:02x} crc={:02x}",
                self.data.len(),
                self.shifter,
                self.crc
            );
            if let Some(callback) = self.callback.as_mut() {
                callback(self.shifter, self.crc, self.data.len());
            }
            self.shifter = 0;
            self.bits = 0;
        }
    }

    /// Complete bytes assembled so far. A trailing partial byte is not
    /// counted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wrap the assembled bytes as a tape payload, dropping any trailing
    /// partial byte.
    #[must_use]
    pub fn finish(self) -> TapPayload {
        TapPayload::from_bytes(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shift_byte(assembler: &mut TapAssembler<'_>, byte: u8) {
        for i in (0..8).rev() {
            assembler.shift(byte & (1 << i) != 0);
        }
    }

    #[test]
    fn assembles_msb_first() {
        let mut assembler = TapAssembler::new();
        shift_byte(&mut assembler, 0xA5);
        shift_byte(&mut assembler, 0x3C);
        assert_eq!(assembler.len(), 2);

        let payload = assembler.finish();
        assert_eq!(payload.data(), &[0xA5, 0x3C]);
    }

    #[test]
    fn partial_byte_is_dropped() {
        let mut assembler = TapAssembler::new();
        shift_byte(&mut assembler, 0xFF);
        assembler.shift(true);
        assembler.shift(false);
        assert_eq!(assembler.len(), 1);
        assert_eq!(assembler.finish().data(), &[0xFF]);
    }

    #[test]
    fn callback_sees_running_checksum() {
        let mut log: Vec<(u8, u8, usize)> = Vec::new();
        {
            let mut assembler = TapAssembler::new();
            assembler.set_callback(Box::new(|byte, crc, len| log.push((byte, crc, len))));
            shift_byte(&mut assembler, 0xFF);
            shift_byte(&mut assembler, 0x0F);
        }
        assert_eq!(log, vec![(0xFF, 0xFF, 1), (0x0F, 0xF0, 2)]);
    }

    #[test]
    fn checksummed_stream_finishes_valid() {
        // flag, two data bytes, then the XOR checksum byte off the tape
        let bytes = [0xFF, 0x10, 0x20, 0xFF ^ 0x10 ^ 0x20];
        let mut assembler = TapAssembler::new();
        for &b in &bytes {
            shift_byte(&mut assembler, b);
        }
        let payload = assembler.finish();
        assert!(payload.valid());
        assert_eq!(payload.body(), &[0x10, 0x20]);
    }
}
