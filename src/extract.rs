//! End-to-end extraction: dump files in, archives out.
//!
//! Pipeline: ingest every dump into a [`BlockMap`], report the gap census,
//! lay the captured frames out in logical order behind an
//! [`InterwovenStream`], skip the tape's opening frame (it carries drive
//! bookkeeping, not Retrospect data), and hand the stream to the chunk
//! parser.  Live files land in one archive, snapshot metadata in a second.
//!
//! Only I/O errors against the dump files or the archive sinks are fatal;
//! damage on tape degrades the output but never aborts the run.

use std::io::{self, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::cartridge::{CartridgeType, PositionError};
use crate::gaps;
use crate::retrospect::{ParseStats, RetrospectParser};
use crate::sink::ArchiveSink;
use crate::tape::interwoven::InterwovenStream;
use crate::tape::{BlockMap, DATA_SECTION_SIZE};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cartridge geometry error: {0}")]
    Position(#[from] PositionError),
}

/// Counters for one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractSummary {
    pub cartridge:         CartridgeType,
    pub frames_captured:   usize,
    pub duplicate_frames:  usize,
    pub rejected_frames:   usize,
    pub write_stop_frames: usize,
    pub gap_count:         usize,
    pub frames_missing:    u64,
    pub parse:             ParseStats,
}

/// Recover everything the dumps contain.
pub fn extract_dumps<P: AsRef<Path>>(
    dump_paths: &[P],
    cartridge: CartridgeType,
    files: &mut dyn ArchiveSink,
    snapshots: &mut dyn ArchiveSink,
) -> Result<ExtractSummary, ExtractError> {
    let map = BlockMap::load(dump_paths, cartridge)?;
    extract_map(&map, files, snapshots)
}

/// Same as [`extract_dumps`], over an already-ingested block map.
pub fn extract_map(
    map: &BlockMap,
    files: &mut dyn ArchiveSink,
    snapshots: &mut dyn ArchiveSink,
) -> Result<ExtractSummary, ExtractError> {
    let report = gaps::report(map)?;

    let mut stream = InterwovenStream::new(map);
    // The opening frame carries no Retrospect data.
    stream.seek(SeekFrom::Start(DATA_SECTION_SIZE as u64))?;

    let mut parser = RetrospectParser::new(stream)?;
    let parse = parser.run(files, snapshots)?;

    files.close_archive()?;
    snapshots.close_archive()?;

    info!(
        "extraction finished: {} file(s), {} directories, {} snapshot(s), {} forced close(s)",
        parse.files_written, parse.directories_created, parse.snapshots_written, parse.forced_closes
    );

    Ok(ExtractSummary {
        cartridge: map.cartridge(),
        frames_captured: map.len(),
        duplicate_frames: map.duplicate_frames,
        rejected_frames: map.rejected_frames,
        write_stop_frames: map.write_stop_frames,
        gap_count: report.gaps.len(),
        frames_missing: report.frames_missing,
        parse,
    })
}
