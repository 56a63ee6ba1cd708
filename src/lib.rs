//! # adrescue — OnStream ADR tape dump recovery
//!
//! Recovers the original files and directory tree from raw disk-image dumps
//! of OnStream ADR30/ADR50 cartridges written by Retrospect for classic
//! Mac OS.  The dumps are unordered and usually incomplete; recovery is a
//! fixed pipeline:
//!
//! - Every 33 280-byte frame carries its own position: a packed physical id
//!   in the 512-byte aux trailer.  Ingestion indexes frames by that id.
//! - The cartridge geometry (serpentine tracks, fast lanes, and on ADR50 the
//!   parking zone) maps physical positions to logical block numbers; the
//!   interwoven stream presents the logical byte order, substituting zeroes
//!   for missing or write-stop frames.
//! - The Retrospect chunk scanner walks that stream, resynchronizing one
//!   byte at a time across damage, and reassembles files across fork and
//!   continuation records.  Nothing short of a dump or sink I/O error is
//!   fatal.
//! - Recovered files go to one archive sink, backup snapshots to a second.

pub mod binary;
pub mod bits;
pub mod cartridge;
pub mod extract;
pub mod gaps;
pub mod retrospect;
pub mod sink;
pub mod tape;

// Flat re-exports for the most common types.
pub use binary::{Endian, EndianReader, EndianWriter};
pub use bits::{BitOrder, BitReader, BitWriter};
pub use cartridge::{CartridgeType, Location, PhysicalPosition, PositionError};
pub use extract::{extract_dumps, ExtractError, ExtractSummary};
pub use gaps::{find_gaps, Gap, GapReport};
pub use retrospect::{Chunk, ParseStats, RetrospectParser};
pub use sink::{ArchiveSink, CompressionHint, DirectorySink, MemorySink, NullSink};
pub use tape::interwoven::InterwovenStream;
pub use tape::{BlockMap, TapeBlock, DATA_SECTION_SIZE, FULL_SECTION_SIZE, WRITE_STOP_SIGNATURE};
