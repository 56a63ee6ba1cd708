//! Bit-granular reader and writer over byte streams.
//!
//! The Retrospect tape stream contains bit-packed regions, and some producers
//! interleave byte-granular records with bit-granular runs inside the same
//! output.  Two rules keep both sides coherent:
//!
//! - The per-byte bit order (`BitOrder`) is chosen once, before the first bit
//!   moves, and is locked afterwards.  Changing it mid-stream would silently
//!   reinterpret every byte already buffered.
//! - On the write side the byte slot holding an in-progress bit group is
//!   *reserved* (zero-filled) at the writer's position the moment its first
//!   bit arrives.  Byte-granular writes from other producers land after the
//!   reserved slot; once the group fills, the writer jumps back and patches
//!   the slot in place.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::binary::Endian;

// ── Bit order ────────────────────────────────────────────────────────────────

/// Order in which bits are produced/consumed within a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    /// First bit of a byte is bit 7, last is bit 0.
    HighToLow,
    /// First bit of a byte is bit 0, last is bit 7.
    LowToHigh,
}

/// Maximum width accepted by [`BitReader::read_bits_as_integer`] and
/// [`BitWriter::write_bits_from_integer`].
pub const MAX_INTEGER_BITS: u32 = 32;

fn order_locked() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "bit order cannot change once bits have been read or written",
    )
}

// ── BitReader ────────────────────────────────────────────────────────────────

/// Reads individual bits from a byte-granular source.
pub struct BitReader<R: Read> {
    source:    R,
    order:     BitOrder,
    started:   bool,
    /// Byte currently being consumed.
    current:   u8,
    /// Bits of `current` not yet handed out (0 = need a fresh byte).
    bits_left: u8,
    /// One byte of lookahead, filled by `has_more`.
    pending:   Option<u8>,
}

impl<R: Read> BitReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            order: BitOrder::HighToLow,
            started: false,
            current: 0,
            bits_left: 0,
            pending: None,
        }
    }

    pub fn with_order(source: R, order: BitOrder) -> Self {
        let mut r = Self::new(source);
        r.order = order;
        r
    }

    pub fn bit_order(&self) -> BitOrder {
        self.order
    }

    /// Select the per-byte bit order.  Fails once reading has begun.
    pub fn set_bit_order(&mut self, order: BitOrder) -> io::Result<()> {
        if self.started {
            return Err(order_locked());
        }
        self.order = order;
        Ok(())
    }

    fn next_byte(&mut self) -> io::Result<u8> {
        if let Some(b) = self.pending.take() {
            return Ok(b);
        }
        let mut buf = [0u8; 1];
        self.source.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read a single bit.  Fails with `UnexpectedEof` past end of source.
    pub fn read_bit(&mut self) -> io::Result<bool> {
        if self.bits_left == 0 {
            self.current = self.next_byte()?;
            self.bits_left = 8;
        }
        self.started = true;
        let bit = match self.order {
            BitOrder::HighToLow => (self.current >> (self.bits_left - 1)) & 1,
            BitOrder::LowToHigh => (self.current >> (8 - self.bits_left)) & 1,
        };
        self.bits_left -= 1;
        Ok(bit == 1)
    }

    /// Read `count` bits (0..=32) and compose them into an integer.
    ///
    /// With `Endian::Little` the first bit read becomes the least-significant
    /// bit of the result; with `Endian::Big` it becomes the most-significant
    /// bit of the `count`-bit value.
    pub fn read_bits_as_integer(&mut self, count: u32, endian: Endian) -> io::Result<u32> {
        if count > MAX_INTEGER_BITS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bit count {count} exceeds the {MAX_INTEGER_BITS}-bit limit"),
            ));
        }
        let mut value = 0u32;
        for i in 0..count {
            let bit = u32::from(self.read_bit()?);
            match endian {
                Endian::Little => value |= bit << i,
                Endian::Big => value = (value << 1) | bit,
            }
        }
        Ok(value)
    }

    /// Discard the rest of the current byte.  No-op when byte-aligned.
    pub fn skip_rest_of_byte(&mut self) {
        self.bits_left = 0;
    }

    /// True if at least one more bit can be read.
    pub fn has_more(&mut self) -> io::Result<bool> {
        if self.bits_left > 0 || self.pending.is_some() {
            return Ok(true);
        }
        let mut buf = [0u8; 1];
        loop {
            match self.source.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    self.pending = Some(buf[0]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

// ── BitWriter ────────────────────────────────────────────────────────────────

/// Writes individual bits into a byte-granular sink.
///
/// The slot for an in-progress bit group is reserved in the sink when the
/// group's first bit is written; interleaved byte-granular writes performed
/// directly on the sink therefore land after the slot.  Callers MUST invoke
/// [`finish_current_byte`](Self::finish_current_byte) before dropping the
/// writer, otherwise a partially-filled group stays zero in the sink.
pub struct BitWriter<W: Write + Seek> {
    sink:      W,
    order:     BitOrder,
    started:   bool,
    current:   u8,
    bits_used: u8,
    /// Sink offset of the reserved slot; valid while `bits_used > 0`.
    slot:      u64,
}

impl<W: Write + Seek> BitWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            order: BitOrder::HighToLow,
            started: false,
            current: 0,
            bits_used: 0,
            slot: 0,
        }
    }

    pub fn with_order(sink: W, order: BitOrder) -> Self {
        let mut w = Self::new(sink);
        w.order = order;
        w
    }

    pub fn bit_order(&self) -> BitOrder {
        self.order
    }

    /// Select the per-byte bit order.  Fails once writing has begun.
    pub fn set_bit_order(&mut self, order: BitOrder) -> io::Result<()> {
        if self.started {
            return Err(order_locked());
        }
        self.order = order;
        Ok(())
    }

    pub fn write_bit(&mut self, bit: bool) -> io::Result<()> {
        if self.bits_used == 0 {
            // Reserve the slot at the current tail.
            self.slot = self.sink.stream_position()?;
            self.sink.write_all(&[0u8])?;
            self.current = 0;
        }
        self.started = true;
        if bit {
            self.current |= match self.order {
                BitOrder::HighToLow => 1 << (7 - self.bits_used),
                BitOrder::LowToHigh => 1 << self.bits_used,
            };
        }
        self.bits_used += 1;
        if self.bits_used == 8 {
            self.patch_slot()?;
        }
        Ok(())
    }

    /// Write the low `count` bits of `value` (0..=32), mirroring
    /// [`BitReader::read_bits_as_integer`].
    pub fn write_bits_from_integer(
        &mut self,
        value: u32,
        count: u32,
        endian: Endian,
    ) -> io::Result<()> {
        if count > MAX_INTEGER_BITS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bit count {count} exceeds the {MAX_INTEGER_BITS}-bit limit"),
            ));
        }
        for i in 0..count {
            let bit = match endian {
                Endian::Little => (value >> i) & 1,
                Endian::Big => (value >> (count - i - 1)) & 1,
            };
            self.write_bit(bit == 1)?;
        }
        Ok(())
    }

    /// Pad the in-progress byte with zero bits up to the next boundary.
    /// Returns the number of padding bits written (0 when aligned).
    pub fn finish_current_byte(&mut self) -> io::Result<u32> {
        if self.bits_used == 0 {
            return Ok(0);
        }
        let padding = u32::from(8 - self.bits_used);
        self.patch_slot()?;
        Ok(padding)
    }

    fn patch_slot(&mut self) -> io::Result<()> {
        let tail = self.sink.stream_position()?;
        self.sink.seek(SeekFrom::Start(self.slot))?;
        self.sink.write_all(&[self.current])?;
        self.sink.seek(SeekFrom::Start(tail))?;
        self.current = 0;
        self.bits_used = 0;
        Ok(())
    }

    /// Access the sink for interleaved byte-granular writes.
    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn high_to_low_reads_msb_first() {
        let mut r = BitReader::new(Cursor::new(vec![0b1010_0000]));
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert!(r.read_bit().unwrap());
    }

    #[test]
    fn low_to_high_reads_lsb_first() {
        let mut r = BitReader::with_order(Cursor::new(vec![0b0000_0101]), BitOrder::LowToHigh);
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert!(r.read_bit().unwrap());
    }

    #[test]
    fn order_is_locked_after_first_read() {
        let mut r = BitReader::new(Cursor::new(vec![0xFF]));
        r.read_bit().unwrap();
        assert!(r.set_bit_order(BitOrder::LowToHigh).is_err());
    }

    #[test]
    fn integer_composition_endianness() {
        // 0b1101 read MSB-first.
        let mut r = BitReader::new(Cursor::new(vec![0b1101_0000]));
        assert_eq!(r.read_bits_as_integer(4, Endian::Big).unwrap(), 0b1101);

        let mut r = BitReader::new(Cursor::new(vec![0b1101_0000]));
        assert_eq!(r.read_bits_as_integer(4, Endian::Little).unwrap(), 0b1011);
    }

    #[test]
    fn skip_rest_of_byte_aligns() {
        let mut r = BitReader::new(Cursor::new(vec![0xFF, 0x00]));
        r.read_bit().unwrap();
        r.skip_rest_of_byte();
        assert!(!r.read_bit().unwrap());
        // Aligned skip is a no-op: the next read stays inside byte two.
        r.skip_rest_of_byte();
        assert!(!r.read_bit().unwrap());
    }

    #[test]
    fn has_more_tracks_cached_bits_and_source() {
        let mut r = BitReader::new(Cursor::new(vec![0xAA]));
        assert!(r.has_more().unwrap());
        for _ in 0..8 {
            r.read_bit().unwrap();
        }
        assert!(!r.has_more().unwrap());
        assert!(r.read_bit().is_err());
    }

    #[test]
    fn read_past_end_is_unexpected_eof() {
        let mut r = BitReader::new(Cursor::new(Vec::<u8>::new()));
        let err = r.read_bit().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn writer_reserves_slot_for_interleaved_bytes() {
        let mut w = BitWriter::new(Cursor::new(Vec::new()));
        w.write_bit(true).unwrap();
        // A byte-granular producer writes while the group is open.
        w.sink_mut().write_all(&[0xEE]).unwrap();
        let padding = w.finish_current_byte().unwrap();
        assert_eq!(padding, 7);
        let out = w.into_inner().into_inner();
        assert_eq!(out, vec![0b1000_0000, 0xEE]);
    }

    #[test]
    fn finish_when_aligned_is_zero_padding() {
        let mut w = BitWriter::new(Cursor::new(Vec::new()));
        assert_eq!(w.finish_current_byte().unwrap(), 0);
        for _ in 0..8 {
            w.write_bit(false).unwrap();
        }
        assert_eq!(w.finish_current_byte().unwrap(), 0);
    }

    proptest! {
        #[test]
        fn round_trip_bits(bits in prop::collection::vec(any::<bool>(), 0..4096),
                           high_to_low in any::<bool>()) {
            let order = if high_to_low { BitOrder::HighToLow } else { BitOrder::LowToHigh };
            let mut w = BitWriter::with_order(Cursor::new(Vec::new()), order);
            for &b in &bits {
                w.write_bit(b).unwrap();
            }
            w.finish_current_byte().unwrap();

            let bytes = w.into_inner().into_inner();
            let mut r = BitReader::with_order(Cursor::new(bytes), order);
            for &b in &bits {
                prop_assert_eq!(r.read_bit().unwrap(), b);
            }
        }

        #[test]
        fn round_trip_integers(value in any::<u32>(), count in 0u32..=32,
                               big in any::<bool>()) {
            let endian = if big { Endian::Big } else { Endian::Little };
            let masked = if count == 32 { value } else { value & ((1u32 << count) - 1) };
            let mut w = BitWriter::new(Cursor::new(Vec::new()));
            w.write_bits_from_integer(masked, count, endian).unwrap();
            w.finish_current_byte().unwrap();

            let mut r = BitReader::new(Cursor::new(w.into_inner().into_inner()));
            prop_assert_eq!(r.read_bits_as_integer(count, endian).unwrap(), masked);
        }
    }
}
