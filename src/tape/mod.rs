//! Tape frame model — block map construction from raw dumps.
//!
//! # Frame layout on disk
//!
//! ```text
//! Offset  Size    Field
//!     0   32768   user payload (data section)
//! 32768     512   aux trailer
//! ```
//!
//! The aux trailer starts with a 4-byte ASCII signature (big-endian u32);
//! bytes `[8..12)` hold the frame's packed 32-bit physical id, big-endian.
//! Signature `"WTST"` marks a frame produced by a write-stop event — the
//! payload of such a frame may be garbage and is never handed to the parser.
//!
//! Dump files are unordered and may be sparse: frames appear in capture
//! order, not logical order, and any number of them can be missing.  The
//! [`BlockMap`] indexes every captured frame by physical id; the
//! [`InterwovenStream`](interwoven::InterwovenStream) then re-orders them
//! into the logical byte stream.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::ops::Range;
use std::path::Path;

use tracing::{debug, warn};

use crate::cartridge::{CartridgeType, PhysicalPosition};

pub mod aux_strip;
pub mod interwoven;

// ── Frame constants ──────────────────────────────────────────────────────────

/// User payload bytes per frame.
pub const DATA_SECTION_SIZE: usize = 32 * 1024;
/// Aux trailer bytes per frame.
pub const AUX_SECTION_SIZE: usize = 512;
/// On-disk frame size: payload plus aux trailer.
pub const FULL_SECTION_SIZE: usize = DATA_SECTION_SIZE + AUX_SECTION_SIZE;

/// Offset of the packed physical id inside the aux trailer.
pub const AUX_PHYSICAL_ID_OFFSET: usize = 8;

/// `"WTST"` — frame written during a write-stop event; payload unreliable.
pub const WRITE_STOP_SIGNATURE: u32 = 0x5754_5354;

// ── TapeBlock ────────────────────────────────────────────────────────────────

/// One captured tape frame.
#[derive(Debug, Clone)]
pub struct TapeBlock {
    pub physical_id:   u32,
    /// `DATA_SECTION_SIZE` bytes of user payload.
    pub payload:       Vec<u8>,
    /// `AUX_SECTION_SIZE` bytes of aux trailer.
    pub aux:           Vec<u8>,
    /// Byte offset of the frame in the dump file it was captured from.
    pub source_offset: u64,
    /// First 4 bytes of the aux trailer, big-endian.
    pub signature:     u32,
}

impl TapeBlock {
    pub fn is_write_stop(&self) -> bool {
        self.signature == WRITE_STOP_SIGNATURE
    }

    /// Signature rendered for diagnostics: ASCII when printable, hex otherwise.
    pub fn signature_display(&self) -> String {
        let bytes = self.signature.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            bytes.iter().map(|&b| b as char).collect()
        } else {
            format!("0x{}", hex::encode(bytes))
        }
    }
}

// ── BlockMap ─────────────────────────────────────────────────────────────────

/// Index of captured frames by physical id.  Built once during ingestion,
/// read-only afterwards.
#[derive(Debug)]
pub struct BlockMap {
    cartridge:            CartridgeType,
    blocks:               HashMap<u32, TapeBlock>,
    pub duplicate_frames: usize,
    pub rejected_frames:  usize,
    pub write_stop_frames: usize,
}

impl BlockMap {
    pub fn new(cartridge: CartridgeType) -> Self {
        Self {
            cartridge,
            blocks: HashMap::new(),
            duplicate_frames: 0,
            rejected_frames: 0,
            write_stop_frames: 0,
        }
    }

    /// Ingest every frame of every dump file, in the order given.
    pub fn load<P: AsRef<Path>>(paths: &[P], cartridge: CartridgeType) -> io::Result<Self> {
        let mut map = Self::new(cartridge);
        for path in paths {
            let path = path.as_ref();
            let file = File::open(path)?;
            map.ingest(BufReader::new(file), &path.display().to_string())?;
        }
        Ok(map)
    }

    /// Read frames from `source` until end of stream.  A trailing partial
    /// frame is reported and dropped; it cannot carry a trusted aux trailer.
    pub fn ingest<R: Read>(&mut self, mut source: R, label: &str) -> io::Result<()> {
        let mut frame = vec![0u8; FULL_SECTION_SIZE];
        let mut offset = 0u64;
        loop {
            match read_frame(&mut source, &mut frame)? {
                FrameRead::Complete => {}
                FrameRead::Eof => break,
                FrameRead::Partial(n) => {
                    warn!("{label}: trailing partial frame of {n} bytes ignored");
                    break;
                }
            }
            self.insert_frame(&frame, offset, label);
            offset += FULL_SECTION_SIZE as u64;
        }
        Ok(())
    }

    fn insert_frame(&mut self, frame: &[u8], source_offset: u64, label: &str) {
        let aux = &frame[DATA_SECTION_SIZE..];
        let signature = u32::from_be_bytes(aux[0..4].try_into().unwrap());
        let id_bytes = &aux[AUX_PHYSICAL_ID_OFFSET..AUX_PHYSICAL_ID_OFFSET + 4];
        let physical_id = u32::from_be_bytes(id_bytes.try_into().unwrap());

        if let Err(e) = PhysicalPosition::from_physical(self.cartridge, physical_id) {
            warn!("{label} @ {source_offset}: frame rejected: {e}");
            self.rejected_frames += 1;
            return;
        }

        let block = TapeBlock {
            physical_id,
            payload: frame[..DATA_SECTION_SIZE].to_vec(),
            aux: aux.to_vec(),
            source_offset,
            signature,
        };
        if block.is_write_stop() {
            self.write_stop_frames += 1;
        }

        // Keep the earliest capture of a physical id; re-reads of the same
        // frame later in a dump tend to be the degraded ones.
        if self.blocks.contains_key(&physical_id) {
            debug!("{label} @ {source_offset}: duplicate physical id {physical_id:#010x} ignored");
            self.duplicate_frames += 1;
            return;
        }
        self.blocks.insert(physical_id, block);
    }

    pub fn cartridge(&self) -> CartridgeType {
        self.cartridge
    }

    pub fn get(&self, physical_id: u32) -> Option<&TapeBlock> {
        self.blocks.get(&physical_id)
    }

    pub fn contains(&self, physical_id: u32) -> bool {
        self.blocks.contains_key(&physical_id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &TapeBlock)> {
        self.blocks.iter()
    }
}

enum FrameRead {
    Complete,
    Partial(usize),
    Eof,
}

fn read_frame<R: Read>(source: &mut R, frame: &mut [u8]) -> io::Result<FrameRead> {
    let mut filled = 0;
    while filled < frame.len() {
        match source.read(&mut frame[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 { FrameRead::Eof } else { FrameRead::Partial(filled) });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(FrameRead::Complete)
}

// ── Logical stream access ────────────────────────────────────────────────────

/// A seekable view of the logically-ordered tape contents that can report
/// which byte ranges were backed by missing or write-stop frames.
pub trait LogicalStream: io::Read + io::Seek {
    /// Number of logical blocks in `range` whose payload was substituted
    /// with zeroes (absent from the dump, or write-stop frames).
    fn missing_blocks_in(&self, _range: Range<u64>) -> u64 {
        0
    }

    /// First offset at or after `from` that is backed by captured data, or
    /// the stream length if nothing follows.  Substituted regions read as
    /// zeroes and no record signature contains a zero byte, so a scanner may
    /// hop over them wholesale instead of resynchronizing byte by byte.
    fn skip_missing(&self, from: u64) -> u64 {
        from
    }
}

/// In-memory streams used in tests and tooling have no missing regions.
impl<T: AsRef<[u8]>> LogicalStream for io::Cursor<T> {}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a raw frame with the given payload fill, signature, and id.
    pub fn raw_frame(fill: u8, signature: u32, physical_id: u32) -> Vec<u8> {
        let mut frame = vec![fill; DATA_SECTION_SIZE];
        let mut aux = vec![0u8; AUX_SECTION_SIZE];
        aux[0..4].copy_from_slice(&signature.to_be_bytes());
        aux[AUX_PHYSICAL_ID_OFFSET..AUX_PHYSICAL_ID_OFFSET + 4]
            .copy_from_slice(&physical_id.to_be_bytes());
        frame.extend_from_slice(&aux);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::raw_frame;
    use super::*;
    use crate::cartridge::CartridgeType;

    const DATA_SIGNATURE: u32 = 0x4144_5230; // "ADR0", any non-WTST value

    #[test]
    fn ingest_indexes_frames_by_physical_id() {
        let mut dump = raw_frame(0x11, DATA_SIGNATURE, 0x0000_0000);
        dump.extend(raw_frame(0x22, DATA_SIGNATURE, 0x0000_0005));

        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();

        assert_eq!(map.len(), 2);
        let block = map.get(0x0000_0005).unwrap();
        assert_eq!(block.payload[0], 0x22);
        assert_eq!(block.source_offset, FULL_SECTION_SIZE as u64);
        assert_eq!(block.signature, DATA_SIGNATURE);
    }

    #[test]
    fn duplicate_ids_keep_the_earliest_capture() {
        let mut dump = raw_frame(0x11, DATA_SIGNATURE, 3);
        dump.extend(raw_frame(0x22, DATA_SIGNATURE, 3));

        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map.duplicate_frames, 1);
        assert_eq!(map.get(3).unwrap().payload[0], 0x11);
    }

    #[test]
    fn bad_ids_are_rejected_not_fatal() {
        // Non-zero reserved lane.
        let dump = raw_frame(0x11, DATA_SIGNATURE, 0x0001_0000);
        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();
        assert_eq!(map.len(), 0);
        assert_eq!(map.rejected_frames, 1);
    }

    #[test]
    fn write_stop_frames_are_kept_but_counted() {
        let dump = raw_frame(0x11, WRITE_STOP_SIGNATURE, 7);
        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.write_stop_frames, 1);
        assert!(map.get(7).unwrap().is_write_stop());
    }

    #[test]
    fn trailing_partial_frame_is_dropped() {
        let mut dump = raw_frame(0x11, DATA_SIGNATURE, 1);
        dump.extend_from_slice(&[0u8; 100]);
        let mut map = BlockMap::new(CartridgeType::Adr30);
        map.ingest(&dump[..], "test").unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn signature_display_is_ascii_or_hex() {
        let block = TapeBlock {
            physical_id: 0,
            payload: Vec::new(),
            aux: Vec::new(),
            source_offset: 0,
            signature: WRITE_STOP_SIGNATURE,
        };
        assert_eq!(block.signature_display(), "WTST");
    }
}
