//! Payload-only view over a raw dump file.
//!
//! Every on-disk frame is `FULL_SECTION_SIZE` bytes: the payload followed by
//! the 512-byte aux trailer.  This adapter hides the trailers, exposing the
//! concatenated payloads as one contiguous stream — the coordinate system the
//! rest of the pipeline thinks in.  `add_aux`/`remove_aux` translate between
//! the two offset spaces.

use std::io::{self, Read, Seek, SeekFrom};

use super::{DATA_SECTION_SIZE, FULL_SECTION_SIZE};

/// Map a stripped (payload-space) offset to the raw file offset.
pub fn add_aux(stripped: u64) -> u64 {
    let data = DATA_SECTION_SIZE as u64;
    let full = FULL_SECTION_SIZE as u64;
    (stripped / data) * full + (stripped % data)
}

/// Map a raw file offset to payload space.  Offsets inside an aux trailer
/// clamp to the end of that frame's payload.
pub fn remove_aux(raw: u64) -> u64 {
    let data = DATA_SECTION_SIZE as u64;
    let full = FULL_SECTION_SIZE as u64;
    (raw / full) * data + (raw % full).min(data)
}

/// `Read + Seek` adapter that skips every frame's aux trailer.
pub struct AuxStrippedStream<R: Read + Seek> {
    inner: R,
    /// Position in payload space.
    pos:   u64,
    /// Stripped length: whole frames only; a trailing partial frame is not
    /// exposed.
    len:   u64,
}

impl<R: Read + Seek> AuxStrippedStream<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let raw_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let len = (raw_len / FULL_SECTION_SIZE as u64) * DATA_SECTION_SIZE as u64;
        Ok(Self { inner, pos: 0, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for AuxStrippedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.pos < self.len {
            let intra = (self.pos % DATA_SECTION_SIZE as u64) as usize;
            let in_frame = DATA_SECTION_SIZE - intra;
            let remaining = (self.len - self.pos) as usize;
            let take = (buf.len() - written).min(in_frame).min(remaining);

            self.inner.seek(SeekFrom::Start(add_aux(self.pos)))?;
            self.inner.read_exact(&mut buf[written..written + take])?;

            written += take;
            self.pos += take as u64;
        }
        Ok(written)
    }
}

impl<R: Read + Seek> Seek for AuxStrippedStream<R> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::End(d) => i128::from(self.len) + i128::from(d),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stripped stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
