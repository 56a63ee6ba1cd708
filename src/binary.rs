//! Typed binary reader and writer with runtime byte order.
//!
//! Retrospect records are big-endian while most tool-side scratch formats are
//! little-endian, so the byte order is a runtime property of the reader
//! rather than a type parameter.  Both sides keep a current byte index and a
//! stack of saved indices for temporary excursions (`jump_temp` /
//! `jump_return`), which the chunk parser uses to peek ahead without losing
//! its place.
//!
//! Strings are decoded byte-per-char (Latin-1 superset of ASCII); the tape
//! names are single-byte Mac text and survive this round trip unchanged.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Byte order applied to every multi-byte read/write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

fn empty_jump_stack() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "jump_return called with an empty jump stack")
}

// ── EndianReader ─────────────────────────────────────────────────────────────

pub struct EndianReader<R: Read + Seek> {
    inner:  R,
    endian: Endian,
    pos:    u64,
    jumps:  Vec<u64>,
}

macro_rules! read_prim {
    ($name:ident, $ty:ty, $size:expr, $method:ident) => {
        pub fn $name(&mut self) -> io::Result<$ty> {
            let v = match self.endian {
                Endian::Little => self.inner.$method::<LittleEndian>()?,
                Endian::Big => self.inner.$method::<BigEndian>()?,
            };
            self.pos += $size;
            Ok(v)
        }
    };
}

macro_rules! read_fixed_point {
    ($name:ident, $read:ident, $ty:ty, $width:expr) => {
        /// Fixed-point read: the wire value is the underlying integer; the
        /// caller supplies the number of fractional bits.
        pub fn $name(&mut self, decimal_bits: u32) -> io::Result<f64> {
            if decimal_bits >= $width {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{decimal_bits} fractional bits do not fit a {}-bit value", $width),
                ));
            }
            let raw = self.$read()? as f64;
            Ok(raw / (1u64 << decimal_bits) as f64)
        }
    };
}

impl<R: Read + Seek> EndianReader<R> {
    pub fn new(mut inner: R, endian: Endian) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        Ok(Self { inner, endian, pos, jumps: Vec::new() })
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Current byte index in the underlying stream.
    pub fn index(&self) -> u64 {
        self.pos
    }

    pub fn set_index(&mut self, index: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(index))?;
        self.pos = index;
        Ok(())
    }

    /// Length of the underlying stream; restores the current position.
    pub fn len(&mut self) -> io::Result<u64> {
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(self.pos))?;
        Ok(end)
    }

    /// Save the current index and jump to `index`.
    pub fn jump_temp(&mut self, index: u64) -> io::Result<()> {
        let here = self.pos;
        self.set_index(index)?;
        self.jumps.push(here);
        Ok(())
    }

    /// Return to the most recently saved index.  Fails on an empty stack.
    pub fn jump_return(&mut self) -> io::Result<()> {
        let back = self.jumps.pop().ok_or_else(empty_jump_stack)?;
        self.set_index(back)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    // ── Integers ─────────────────────────────────────────────────────────────

    pub fn read_u8(&mut self) -> io::Result<u8> {
        let v = self.inner.read_u8()?;
        self.pos += 1;
        Ok(v)
    }

    pub fn read_i8(&mut self) -> io::Result<i8> {
        let v = self.inner.read_i8()?;
        self.pos += 1;
        Ok(v)
    }

    read_prim!(read_u16, u16, 2, read_u16);
    read_prim!(read_i16, i16, 2, read_i16);
    read_prim!(read_u32, u32, 4, read_u32);
    read_prim!(read_i32, i32, 4, read_i32);
    read_prim!(read_u64, u64, 8, read_u64);
    read_prim!(read_i64, i64, 8, read_i64);
    read_prim!(read_f32, f32, 4, read_f32);
    read_prim!(read_f64, f64, 8, read_f64);

    // ── Floats beyond the native set ─────────────────────────────────────────

    /// IEEE 754 half-precision, widened to `f32`.
    pub fn read_f16(&mut self) -> io::Result<f32> {
        Ok(half_to_f32(self.read_u16()?))
    }

    /// 128-bit decimal in the .NET wire layout: `lo`, `mid`, `hi`, `flags`
    /// (scale in flags bits 16..24, sign in bit 31).  Widened to `f64`.
    pub fn read_decimal128(&mut self) -> io::Result<f64> {
        let lo = u128::from(self.read_u32()?);
        let mid = u128::from(self.read_u32()?);
        let hi = u128::from(self.read_u32()?);
        let flags = self.read_u32()?;
        let scale = (flags >> 16) & 0xFF;
        if scale > 28 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("decimal128 scale {scale} exceeds the maximum of 28"),
            ));
        }
        let mantissa = (hi << 64) | (mid << 32) | lo;
        let mut value = mantissa as f64 / 10f64.powi(scale as i32);
        if flags & 0x8000_0000 != 0 {
            value = -value;
        }
        Ok(value)
    }

    // ── Fixed point ──────────────────────────────────────────────────────────

    read_fixed_point!(read_fixed_u16, read_u16, u16, 16);
    read_fixed_point!(read_fixed_i16, read_i16, i16, 16);
    read_fixed_point!(read_fixed_u32, read_u32, u32, 32);
    read_fixed_point!(read_fixed_i32, read_i32, i32, 32);

    // ── Bytes and strings ────────────────────────────────────────────────────

    pub fn read_bytes(&mut self, count: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.inner.read_exact(&mut buf)?;
        self.pos += count as u64;
        Ok(buf)
    }

    /// Raw-length string: exactly `len` bytes, decoded byte-per-char.
    pub fn read_string(&mut self, len: usize) -> io::Result<String> {
        Ok(latin1_decode(&self.read_bytes(len)?))
    }

    /// NUL-terminated string.  Reaching end of stream before the terminator
    /// is `InvalidData`, not `UnexpectedEof`: the record itself is broken.
    pub fn read_cstring(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8() {
                Ok(0) => return Ok(latin1_decode(&bytes)),
                Ok(b) => bytes.push(b),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "stream ended before the string terminator",
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fixed-size string field: `size` bytes are always consumed; the value
    /// ends at the first `terminator` byte, the rest is padding.
    pub fn read_fixed_string(&mut self, size: usize, terminator: u8) -> io::Result<String> {
        let raw = self.read_bytes(size)?;
        let end = raw.iter().position(|&b| b == terminator).unwrap_or(size);
        Ok(latin1_decode(&raw[..end]))
    }
}

// ── EndianWriter ─────────────────────────────────────────────────────────────

pub struct EndianWriter<W: Write + Seek> {
    inner:  W,
    endian: Endian,
    pos:    u64,
    jumps:  Vec<u64>,
}

macro_rules! write_prim {
    ($name:ident, $ty:ty, $size:expr, $method:ident) => {
        pub fn $name(&mut self, value: $ty) -> io::Result<()> {
            match self.endian {
                Endian::Little => self.inner.$method::<LittleEndian>(value)?,
                Endian::Big => self.inner.$method::<BigEndian>(value)?,
            }
            self.pos += $size;
            Ok(())
        }
    };
}

impl<W: Write + Seek> EndianWriter<W> {
    pub fn new(mut inner: W, endian: Endian) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        Ok(Self { inner, endian, pos, jumps: Vec::new() })
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn index(&self) -> u64 {
        self.pos
    }

    pub fn set_index(&mut self, index: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(index))?;
        self.pos = index;
        Ok(())
    }

    pub fn jump_temp(&mut self, index: u64) -> io::Result<()> {
        let here = self.pos;
        self.set_index(index)?;
        self.jumps.push(here);
        Ok(())
    }

    pub fn jump_return(&mut self) -> io::Result<()> {
        let back = self.jumps.pop().ok_or_else(empty_jump_stack)?;
        self.set_index(back)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.inner.write_u8(value)?;
        self.pos += 1;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> io::Result<()> {
        self.inner.write_i8(value)?;
        self.pos += 1;
        Ok(())
    }

    write_prim!(write_u16, u16, 2, write_u16);
    write_prim!(write_i16, i16, 2, write_i16);
    write_prim!(write_u32, u32, 4, write_u32);
    write_prim!(write_i32, i32, 4, write_i32);
    write_prim!(write_u64, u64, 8, write_u64);
    write_prim!(write_i64, i64, 8, write_i64);
    write_prim!(write_f32, f32, 4, write_f32);
    write_prim!(write_f64, f64, 8, write_f64);

    /// Narrow an `f32` to IEEE half precision (rounds half up).
    pub fn write_f16(&mut self, value: f32) -> io::Result<()> {
        self.write_u16(f32_to_half(value))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> io::Result<()> {
        let bytes = latin1_encode(value)?;
        self.write_bytes(&bytes)
    }

    pub fn write_cstring(&mut self, value: &str) -> io::Result<()> {
        self.write_string(value)?;
        self.write_u8(0)
    }

    /// Fixed-size string field: fails with `InvalidData` if `value` does not
    /// fit, pads the remainder with `pad`.
    pub fn write_fixed_string(&mut self, value: &str, size: usize, pad: u8) -> io::Result<()> {
        let bytes = latin1_encode(value)?;
        if bytes.len() > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("string of {} bytes exceeds the {size}-byte field", bytes.len()),
            ));
        }
        self.write_bytes(&bytes)?;
        for _ in bytes.len()..size {
            self.write_u8(pad)?;
        }
        Ok(())
    }
}

// ── Codec helpers ────────────────────────────────────────────────────────────

pub(crate) fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_encode(value: &str) -> io::Result<Vec<u8>> {
    value
        .chars()
        .map(|c| {
            let code = c as u32;
            if code > 0xFF {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("character {c:?} is outside the single-byte range"),
                ))
            } else {
                Ok(code as u8)
            }
        })
        .collect()
}

fn half_to_f32(h: u16) -> f32 {
    let sign = u32::from(h >> 15) << 31;
    let exp = u32::from((h >> 10) & 0x1F);
    let frac = u32::from(h & 0x3FF);
    let bits = match (exp, frac) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize into the f32 exponent range.
            let mut e = 113u32;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            sign | (e << 23) | ((f & 0x3FF) << 13)
        }
        (0x1F, 0) => sign | 0x7F80_0000,
        (0x1F, _) => sign | 0x7F80_0000 | (frac << 13),
        _ => sign | ((exp + 112) << 23) | (frac << 13),
    };
    f32::from_bits(bits)
}

fn f32_to_half(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x7F_FFFF;

    if exp == 0xFF {
        // Inf / NaN; keep a non-zero mantissa for NaN.
        let m = if frac != 0 { 0x200 } else { 0 };
        return sign | 0x7C00 | m;
    }
    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00; // overflow to infinity
    }
    if unbiased >= -14 {
        let m = frac >> 13;
        let rounded = if frac & 0x1000 != 0 { m + 1 } else { m };
        let h = ((unbiased + 15) as u32) << 10 | m;
        // Rounding may carry into the exponent; re-add handles it.
        return sign | (h + (rounded - m)) as u16;
    }
    if unbiased >= -24 {
        // Subnormal half.
        let m = (frac | 0x80_0000) >> (126 - exp);
        return sign | m as u16;
    }
    sign // underflow to zero
}

// ── Tests ────────────────────────────────────────────────────────────────────
