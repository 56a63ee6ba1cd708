//! Retrospect tape-stream records.
//!
//! The backup stream is a sequence of typed, variable-length chunks.  Every
//! chunk opens with a 4-byte ASCII signature; all integers are big-endian,
//! names are Pascal-style (length byte followed by single-byte Mac text),
//! and timestamps count seconds from the Mac epoch, 1904-01-01 00:00 UTC.
//!
//! | Kind      | Signature | Role                                          |
//! |-----------|-----------|-----------------------------------------------|
//! | Directory | `RDIR`    | names a folder, links to its parent by id     |
//! | File      | `RFIL`    | opens a file body inside a folder             |
//! | Fork      | `RFRK`    | a slice of an open file's bytes, by id        |
//! | Continue  | `RCNT`    | more bytes for the most recent stream         |
//! | Tail      | `RTAL`    | closes the file addressed by id               |
//! | Snapshot  | `RSNP`    | synthetic backup-metadata file                |
//!
//! Recognition is deliberately strict — besides the signature, ids must be
//! non-zero, names printable, and data lengths bounded — because the scanner
//! treats *any* position in the stream as a potential chunk start when
//! resynchronizing across damage.

use std::io::{self, Read, Seek};

use chrono::{DateTime, Datelike, Utc};

use crate::binary::{latin1_decode, EndianReader};

pub mod parser;

pub use parser::{ParseStats, RetrospectParser};

// ── Signatures ───────────────────────────────────────────────────────────────

pub const DIRECTORY_SIGNATURE: u32 = 0x5244_4952; // "RDIR"
pub const FILE_SIGNATURE: u32 = 0x5246_494C; // "RFIL"
pub const FORK_SIGNATURE: u32 = 0x5246_524B; // "RFRK"
pub const CONTINUE_SIGNATURE: u32 = 0x5243_4E54; // "RCNT"
pub const TAIL_SIGNATURE: u32 = 0x5254_414C; // "RTAL"
pub const SNAPSHOT_SIGNATURE: u32 = 0x5253_4E50; // "RSNP"

/// Upper bound on a single fork/continue slice.  Real slices stay well under
/// a frame; the cap only limits how much garbage a counterfeit length field
/// can swallow before the scanner notices.
pub const MAX_SLICE_BYTES: u32 = 4 * 1024 * 1024;

/// Longest accepted name field.
pub const MAX_NAME_BYTES: u8 = 63;

// ── Timestamps ───────────────────────────────────────────────────────────────

/// Seconds between 1904-01-01 (Mac epoch) and 1970-01-01 (Unix epoch).
const MAC_TO_UNIX_SECONDS: i64 = 2_082_844_800;

pub fn mac_timestamp_to_utc(seconds: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(seconds) - MAC_TO_UNIX_SECONDS, 0)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Pick the entry modification time: `last_modified` when plausible (1980+),
/// else `backup_time` when plausible, else none.
pub fn modification_time(last_modified: u32, backup_time: u32) -> Option<DateTime<Utc>> {
    [last_modified, backup_time]
        .into_iter()
        .map(mac_timestamp_to_utc)
        .find(|dt| dt.year() >= 1980)
}

// ── Chunk payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DirectoryChunk {
    pub folder_id:     u32,
    pub parent_id:     u32,
    pub last_modified: u32,
    pub backup_time:   u32,
    pub name:          String,
}

#[derive(Debug, Clone)]
pub struct FileChunk {
    pub resource_id:   u32,
    pub folder_id:     u32,
    pub file_size:     u32,
    pub last_modified: u32,
    pub backup_time:   u32,
    pub name:          String,
}

#[derive(Debug, Clone)]
pub struct ForkChunk {
    pub resource_id: u32,
    pub data:        Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ContinueChunk {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TailChunk {
    pub resource_id: u32,
}

#[derive(Debug, Clone)]
pub struct SnapshotChunk {
    pub remember_id:        u32,
    /// Finder type code (OSType), four ASCII bytes.
    pub finder_type:        u32,
    pub backup_time:        u32,
    pub file_size:          u32,
    pub parent_folder_name: String,
    pub folder_name:        String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Directory,
    File,
    Fork,
    Continue,
    Tail,
    Snapshot,
}

#[derive(Debug, Clone)]
pub enum Chunk {
    Directory(DirectoryChunk),
    File(FileChunk),
    Fork(ForkChunk),
    Continue(ContinueChunk),
    Tail(TailChunk),
    Snapshot(SnapshotChunk),
}

impl Chunk {
    pub fn kind(&self) -> ChunkKind {
        match self {
            Chunk::Directory(_) => ChunkKind::Directory,
            Chunk::File(_) => ChunkKind::File,
            Chunk::Fork(_) => ChunkKind::Fork,
            Chunk::Continue(_) => ChunkKind::Continue,
            Chunk::Tail(_) => ChunkKind::Tail,
            Chunk::Snapshot(_) => ChunkKind::Snapshot,
        }
    }

    /// Id under which later chunks can look this one up, if any.
    pub fn remember_id(&self) -> Option<u32> {
        match self {
            Chunk::Directory(d) => Some(d.folder_id),
            Chunk::File(f) => Some(f.resource_id),
            Chunk::Snapshot(s) => Some(s.remember_id),
            Chunk::Fork(_) | Chunk::Continue(_) | Chunk::Tail(_) => None,
        }
    }

    pub fn is_rememberable(&self) -> bool {
        self.remember_id().is_some()
    }

    /// Worth a log line on its own (structural chunks, not data carriers).
    pub fn is_loggable(&self) -> bool {
        !matches!(self, Chunk::Fork(_) | Chunk::Continue(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Chunk::Directory(d) => {
                format!("directory {:?} (folder {:#x}, parent {:#x})", d.name, d.folder_id, d.parent_id)
            }
            Chunk::File(f) => {
                format!("file {:?} ({} byte(s), resource {:#x})", f.name, f.file_size, f.resource_id)
            }
            Chunk::Fork(f) => format!("fork slice of {} byte(s) for resource {:#x}", f.data.len(), f.resource_id),
            Chunk::Continue(c) => format!("continuation of {} byte(s)", c.data.len()),
            Chunk::Tail(t) => format!("tail for resource {:#x}", t.resource_id),
            Chunk::Snapshot(s) => {
                format!("snapshot {:?}/{:?} ({} byte(s))", s.parent_folder_name, s.folder_name, s.file_size)
            }
        }
    }

    /// Read one chunk at the reader's position.  The reader must be
    /// big-endian.  Unknown signatures fail with `ErrorKind::NotFound` (the
    /// quiet "nothing here" case); recognized signatures with implausible
    /// fields fail with `ErrorKind::InvalidData`.  Either way the scanner
    /// resynchronizes one byte forward.
    pub fn read<S: Read + Seek>(reader: &mut EndianReader<S>) -> io::Result<Chunk> {
        let signature = reader.read_u32()?;
        match signature {
            DIRECTORY_SIGNATURE => {
                let folder_id = read_nonzero_id(reader, "folder id")?;
                let parent_id = reader.read_u32()?;
                let last_modified = reader.read_u32()?;
                let backup_time = reader.read_u32()?;
                let name = read_name(reader)?;
                Ok(Chunk::Directory(DirectoryChunk {
                    folder_id,
                    parent_id,
                    last_modified,
                    backup_time,
                    name,
                }))
            }
            FILE_SIGNATURE => {
                let resource_id = read_nonzero_id(reader, "resource id")?;
                let folder_id = reader.read_u32()?;
                let file_size = reader.read_u32()?;
                let last_modified = reader.read_u32()?;
                let backup_time = reader.read_u32()?;
                let name = read_name(reader)?;
                Ok(Chunk::File(FileChunk {
                    resource_id,
                    folder_id,
                    file_size,
                    last_modified,
                    backup_time,
                    name,
                }))
            }
            FORK_SIGNATURE => {
                let resource_id = read_nonzero_id(reader, "resource id")?;
                let data = read_slice(reader)?;
                Ok(Chunk::Fork(ForkChunk { resource_id, data }))
            }
            CONTINUE_SIGNATURE => {
                let data = read_slice(reader)?;
                Ok(Chunk::Continue(ContinueChunk { data }))
            }
            TAIL_SIGNATURE => {
                let resource_id = read_nonzero_id(reader, "resource id")?;
                Ok(Chunk::Tail(TailChunk { resource_id }))
            }
            SNAPSHOT_SIGNATURE => {
                let remember_id = read_nonzero_id(reader, "remember id")?;
                let finder_type = reader.read_u32()?;
                if !finder_type.to_be_bytes().iter().all(|b| (0x20..0x7F).contains(b)) {
                    return Err(invalid("snapshot finder type is not ASCII"));
                }
                let backup_time = reader.read_u32()?;
                let file_size = reader.read_u32()?;
                let parent_folder_name = read_name(reader)?;
                let folder_name = read_name(reader)?;
                Ok(Chunk::Snapshot(SnapshotChunk {
                    remember_id,
                    finder_type,
                    backup_time,
                    file_size,
                    parent_folder_name,
                    folder_name,
                }))
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "no chunk signature")),
        }
    }
}

// ── Field readers ────────────────────────────────────────────────────────────

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn read_nonzero_id<S: Read + Seek>(reader: &mut EndianReader<S>, what: &str) -> io::Result<u32> {
    let id = reader.read_u32()?;
    if id == 0 {
        return Err(invalid(format!("{what} must be non-zero")));
    }
    Ok(id)
}

/// Pascal-style name: length byte, then single-byte Mac text.  Length and
/// printability limits keep resync from accepting noise as a record.
fn read_name<S: Read + Seek>(reader: &mut EndianReader<S>) -> io::Result<String> {
    let len = reader.read_u8()?;
    if len == 0 || len > MAX_NAME_BYTES {
        return Err(invalid(format!("name length {len} outside 1..={MAX_NAME_BYTES}")));
    }
    let bytes = reader.read_bytes(usize::from(len))?;
    if bytes.iter().any(|&b| b < 0x20 || b == 0x7F) {
        return Err(invalid("name contains control bytes"));
    }
    Ok(latin1_decode(&bytes))
}

fn read_slice<S: Read + Seek>(reader: &mut EndianReader<S>) -> io::Result<Vec<u8>> {
    let len = reader.read_u32()?;
    if len > MAX_SLICE_BYTES {
        return Err(invalid(format!("slice of {len} bytes exceeds the {MAX_SLICE_BYTES}-byte cap")));
    }
    reader.read_bytes(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::Endian;
    use std::io::Cursor;

    fn big_reader(bytes: Vec<u8>) -> EndianReader<Cursor<Vec<u8>>> {
        EndianReader::new(Cursor::new(bytes), Endian::Big).unwrap()
    }

    fn pstr(name: &str) -> Vec<u8> {
        let mut out = vec![name.len() as u8];
        out.extend(name.bytes());
        out
    }

    #[test]
    fn directory_chunk_round_trip() {
        let mut bytes = DIRECTORY_SIGNATURE.to_be_bytes().to_vec();
        bytes.extend(5u32.to_be_bytes());
        bytes.extend(1u32.to_be_bytes());
        bytes.extend(0xB000_0000u32.to_be_bytes());
        bytes.extend(0xB000_0100u32.to_be_bytes());
        bytes.extend(pstr("Projects"));

        let chunk = Chunk::read(&mut big_reader(bytes)).unwrap();
        let Chunk::Directory(d) = chunk else { panic!("wrong kind") };
        assert_eq!(d.folder_id, 5);
        assert_eq!(d.parent_id, 1);
        assert_eq!(d.name, "Projects");
    }

    #[test]
    fn unknown_signature_is_quietly_rejected() {
        let err = Chunk::read(&mut big_reader(vec![0xDE, 0xAD, 0xBE, 0xEF])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn zero_id_is_invalid() {
        let mut bytes = TAIL_SIGNATURE.to_be_bytes().to_vec();
        bytes.extend(0u32.to_be_bytes());
        let err = Chunk::read(&mut big_reader(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_slice_is_invalid() {
        let mut bytes = CONTINUE_SIGNATURE.to_be_bytes().to_vec();
        bytes.extend((MAX_SLICE_BYTES + 1).to_be_bytes());
        let err = Chunk::read(&mut big_reader(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn name_with_control_bytes_is_invalid() {
        let mut bytes = DIRECTORY_SIGNATURE.to_be_bytes().to_vec();
        bytes.extend(5u32.to_be_bytes());
        bytes.extend(1u32.to_be_bytes());
        bytes.extend(0u32.to_be_bytes());
        bytes.extend(0u32.to_be_bytes());
        bytes.extend([2u8, 0x01, 0x41]);
        let err = Chunk::read(&mut big_reader(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_fork_reports_eof() {
        let mut bytes = FORK_SIGNATURE.to_be_bytes().to_vec();
        bytes.extend(7u32.to_be_bytes());
        bytes.extend(100u32.to_be_bytes());
        bytes.extend([0xAA; 10]); // 90 bytes short
        let err = Chunk::read(&mut big_reader(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn mac_epoch_conversion() {
        assert_eq!(mac_timestamp_to_utc(0).to_rfc3339(), "1904-01-01T00:00:00+00:00");
        // 1998-01-01 00:00:00 UTC is 2_966_457_600 seconds after the Mac epoch.
        assert_eq!(mac_timestamp_to_utc(2_966_457_600).year(), 1998);
    }

    #[test]
    fn modification_time_prefers_plausible_last_modified() {
        let modern = 2_966_457_600u32; // 1998
        let ancient = 1_000u32; // 1904
        assert_eq!(modification_time(modern, ancient).unwrap().year(), 1998);
        assert_eq!(modification_time(ancient, modern).unwrap().year(), 1998);
        assert!(modification_time(ancient, ancient).is_none());
    }
}
