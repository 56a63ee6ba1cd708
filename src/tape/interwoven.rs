//! Logically-ordered read view over a [`BlockMap`].
//!
//! The dump holds frames in capture order; this stream presents the
//! concatenated payloads of logical blocks `0..LogicalBlockCount` as one
//! continuous, seekable byte range.  For logical block `k` the backing frame
//! is the one whose physical id equals `from_logical(k).to_physical()`.
//! Frames that are absent from the dump — and write-stop frames, whose
//! payload is unreliable — read as zeroes; the substitution is never a short
//! read, but it is observable through
//! [`missing_blocks_in`](InterwovenStream::missing_blocks_in) so the parser
//! can report damage at the right offset.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;

use super::{BlockMap, LogicalStream, DATA_SECTION_SIZE};
use crate::cartridge::{CartridgeType, PhysicalPosition};

pub struct InterwovenStream<'map> {
    map:       &'map BlockMap,
    cartridge: CartridgeType,
    pos:       u64,
    len:       u64,
}

impl<'map> InterwovenStream<'map> {
    pub fn new(map: &'map BlockMap) -> Self {
        let cartridge = map.cartridge();
        let len = u64::from(cartridge.logical_block_count()) * DATA_SECTION_SIZE as u64;
        Self { map, cartridge, pos: 0, len }
    }

    /// Total stream length: `LogicalBlockCount * DATA_SECTION_SIZE`.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// How many blocks backing `[start, position)` were substituted with
    /// zeroes.  Lets a consumer bracket a read and ask afterwards whether it
    /// crossed damage.
    pub fn missing_since(&self, start: u64) -> u64 {
        self.missing_blocks_in(start..self.pos)
    }

    /// Payload of logical block `k`, or `None` when the backing frame is
    /// missing or a write-stop frame.
    fn block_payload(&self, logical: u32) -> Option<&'map [u8]> {
        let position = PhysicalPosition::from_logical(self.cartridge, logical).ok()?;
        let block = self.map.get(position.to_physical())?;
        if block.is_write_stop() {
            None
        } else {
            Some(&block.payload)
        }
    }
}

impl Read for InterwovenStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.pos < self.len {
            let logical = (self.pos / DATA_SECTION_SIZE as u64) as u32;
            let intra = (self.pos % DATA_SECTION_SIZE as u64) as usize;
            let take = (buf.len() - written).min(DATA_SECTION_SIZE - intra);
            match self.block_payload(logical) {
                Some(payload) => {
                    buf[written..written + take].copy_from_slice(&payload[intra..intra + take]);
                }
                None => buf[written..written + take].fill(0),
            }
            written += take;
            self.pos += take as u64;
        }
        Ok(written)
    }
}

impl Seek for InterwovenStream<'_> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::End(d) => i128::from(self.len) + i128::from(d),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
        };
        if target < 0 || target > i128::from(self.len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target} is outside the {}-byte tape image", self.len),
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl LogicalStream for InterwovenStream<'_> {
    fn missing_blocks_in(&self, range: Range<u64>) -> u64 {
        if range.end <= range.start {
            return 0;
        }
        let block_count = u64::from(self.cartridge.logical_block_count());
        let first = range.start / DATA_SECTION_SIZE as u64;
        let last = (range.end - 1) / DATA_SECTION_SIZE as u64;
        (first..=last)
            .take_while(|&k| k < block_count)
            .filter(|&k| self.block_payload(k as u32).is_none())
            .count() as u64
    }

    fn skip_missing(&self, from: u64) -> u64 {
        let block_count = u64::from(self.cartridge.logical_block_count());
        let mut block = from / DATA_SECTION_SIZE as u64;
        if block >= block_count || self.block_payload(block as u32).is_some() {
            return from;
        }
        while block < block_count && self.block_payload(block as u32).is_none() {
            block += 1;
        }
        (block * DATA_SECTION_SIZE as u64).min(self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::test_support::raw_frame;
    use crate::tape::{BlockMap, WRITE_STOP_SIGNATURE};

    const SIG: u32 = 0x4144_5230;

    /// Map with the first `n` logical blocks present, each filled with its
    /// logical index, minus the ids listed in `holes`.
    fn map_with(n: u32, holes: &[u32], write_stops: &[u32]) -> BlockMap {
        let mut dump = Vec::new();
        for logical in 0..n {
            if holes.contains(&logical) {
                continue;
            }
            let id = PhysicalPosition::from_logical(CartridgeType::Adr30, logical)
                .unwrap()
                .to_physical();
            let sig = if write_stops.contains(&logical) { WRITE_STOP_SIGNATURE } else { SIG };
            dump.extend(raw_frame(logical as u8, sig, id));
        }
        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();
        map
    }

    #[test]
    fn length_is_capacity_times_payload() {
        let map = BlockMap::new(CartridgeType::Adr30);
        let stream = InterwovenStream::new(&map);
        assert_eq!(
            stream.len(),
            u64::from(CartridgeType::Adr30.logical_block_count()) * DATA_SECTION_SIZE as u64
        );
    }

    #[test]
    fn reads_cross_block_boundaries_in_logical_order() {
        let map = map_with(3, &[], &[]);
        let mut stream = InterwovenStream::new(&map);
        stream
            .seek(SeekFrom::Start(DATA_SECTION_SIZE as u64 - 2))
            .unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 1, 1]);
    }

    #[test]
    fn missing_block_reads_zero_and_is_reported() {
        let map = map_with(44, &[42], &[]);
        let mut stream = InterwovenStream::new(&map);
        let start = 42 * DATA_SECTION_SIZE as u64;
        stream.seek(SeekFrom::Start(start)).unwrap();
        let mut buf = vec![0xFFu8; DATA_SECTION_SIZE];
        stream.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(stream.missing_blocks_in(start..start + DATA_SECTION_SIZE as u64), 1);
        assert_eq!(stream.missing_blocks_in(0..start), 0);
        assert_eq!(stream.missing_since(start), 1);
    }

    #[test]
    fn write_stop_payload_is_suppressed() {
        let map = map_with(2, &[], &[1]);
        let mut stream = InterwovenStream::new(&map);
        stream.seek(SeekFrom::Start(DATA_SECTION_SIZE as u64)).unwrap();
        let mut buf = [0xFFu8; 16];
        stream.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        let range = DATA_SECTION_SIZE as u64..DATA_SECTION_SIZE as u64 + 16;
        assert_eq!(stream.missing_blocks_in(range), 1);
    }

    #[test]
    fn seek_past_length_is_rejected() {
        let map = BlockMap::new(CartridgeType::Adr30);
        let mut stream = InterwovenStream::new(&map);
        let err = stream.seek(SeekFrom::End(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(stream.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn read_at_end_returns_zero() {
        let map = BlockMap::new(CartridgeType::Adr30);
        let mut stream = InterwovenStream::new(&map);
        stream.seek(SeekFrom::End(0)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
