//! Chunk scanner and file-tree assembly.
//!
//! The scanner walks the logical byte stream left to right.  At each cursor
//! position it attempts to recognize a chunk; on success it advances by the
//! chunk's length, on failure it advances by exactly one byte and tries
//! again.  One-byte resync is conservative but loses nothing: every intact
//! chunk after a damaged region is recovered.
//!
//! Assembly keeps two structures between chunks: `tracked`, mapping remember
//! ids to previously seen definition chunks so Fork/Tail records can address
//! them, and `unfinished`, the per-file byte buffers accumulating fork data
//! between a File/Snapshot definition and its Tail.  Buffers left open at
//! end-of-stream are force-closed in the order the definitions appeared —
//! whatever made it onto tape is still worth exporting, just with a warning.
//!
//! Nothing in here is fatal except I/O errors reaching the dump or the
//! archive sink.

use std::collections::HashMap;
use std::io;

use tracing::{debug, info, warn};

use crate::binary::{Endian, EndianReader};
use crate::sink::{ArchiveSink, CompressionHint};
use crate::tape::LogicalStream;

use super::{modification_time, Chunk, DirectoryChunk, FileChunk, SnapshotChunk};

/// Parent links past this depth are treated as a corrupt cycle.
const MAX_FOLDER_DEPTH: usize = 128;

/// Counters reported after a full parse.
#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub chunks_parsed:        usize,
    /// Bytes the scanner stepped over without recognizing a chunk.
    pub bytes_skipped:        u64,
    /// Fork/Continue records whose target buffer was unknown.
    pub sync_errors:          usize,
    pub files_written:        usize,
    pub directories_created: usize,
    pub snapshots_written:    usize,
    pub forced_closes:        usize,
    pub size_mismatches:      usize,
    /// Logical blocks reported missing across the parsed region.
    pub missing_blocks:       u64,
}

/// Handle into the parser's chunk arena.
type ChunkHandle = usize;

pub struct RetrospectParser<S: LogicalStream> {
    reader:          EndianReader<S>,
    /// Definition chunks seen so far; handles index into this arena.
    chunks:          Vec<Chunk>,
    /// remember_id → handle of the chunk that issued it.
    tracked:         HashMap<u32, ChunkHandle>,
    /// Open byte buffers, in definition order.
    unfinished:      Vec<(ChunkHandle, Vec<u8>)>,
    /// Target of a bare Continue record.
    last_definition: Option<ChunkHandle>,
    stats:           ParseStats,
}

impl<S: LogicalStream> RetrospectParser<S> {
    /// Wrap a logical stream positioned at the first byte to scan.
    pub fn new(stream: S) -> io::Result<Self> {
        Ok(Self {
            reader: EndianReader::new(stream, Endian::Big)?,
            chunks: Vec::new(),
            tracked: HashMap::new(),
            unfinished: Vec::new(),
            last_definition: None,
            stats: ParseStats::default(),
        })
    }

    /// Scan to end-of-stream, sending live files to `files` and snapshot
    /// metadata to `snapshots`.  Open buffers are force-closed at the end.
    pub fn run(
        &mut self,
        files: &mut dyn ArchiveSink,
        snapshots: &mut dyn ArchiveSink,
    ) -> io::Result<ParseStats> {
        let len = self.reader.len()?;
        let mut pending_skip = 0u64;
        let mut damage_checked_to = self.reader.index();

        while self.reader.index() < len {
            let start = self.reader.index();
            match Chunk::read(&mut self.reader) {
                Ok(chunk) => {
                    if pending_skip > 0 {
                        debug!("resynchronized at offset {start} after skipping {pending_skip} byte(s)");
                        self.stats.bytes_skipped += pending_skip;
                        pending_skip = 0;
                    }
                    let end = self.reader.index();
                    let missing = self.reader.get_ref().missing_blocks_in(damage_checked_to..end);
                    if missing > 0 {
                        info!("{missing} tape block(s) missing");
                        self.stats.missing_blocks += missing;
                    }
                    damage_checked_to = end;

                    if chunk.is_loggable() {
                        debug!("offset {start}: {}", chunk.describe());
                    }
                    self.stats.chunks_parsed += 1;
                    self.apply(chunk, files, snapshots)?;
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::NotFound
                        && e.kind() != io::ErrorKind::UnexpectedEof
                    {
                        debug!("chunk parse failed at offset {start}: {e}");
                    }
                    pending_skip += 1;
                    let mut next = start + 1;
                    // Hop over wholly-missing regions; zero fill can never
                    // hold a record signature.
                    let resumed = self.reader.get_ref().skip_missing(next);
                    if resumed > next {
                        next = resumed;
                    }
                    if next >= len {
                        break;
                    }
                    self.reader.set_index(next)?;
                }
            }
        }

        if pending_skip > 0 {
            self.stats.bytes_skipped += pending_skip;
        }
        self.force_close_all(files, snapshots)?;
        Ok(self.stats.clone())
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    // ── Assembly ─────────────────────────────────────────────────────────────

    fn apply(
        &mut self,
        chunk: Chunk,
        files: &mut dyn ArchiveSink,
        snapshots: &mut dyn ArchiveSink,
    ) -> io::Result<()> {
        match chunk {
            Chunk::Directory(d) => {
                self.create_directory_entry(&d, files)?;
                self.store(Chunk::Directory(d));
                self.last_definition = None;
            }
            Chunk::File(f) => {
                let handle = self.store(Chunk::File(f));
                self.unfinished.push((handle, Vec::new()));
                self.last_definition = Some(handle);
            }
            Chunk::Snapshot(s) => {
                let handle = self.store(Chunk::Snapshot(s));
                self.unfinished.push((handle, Vec::new()));
                self.last_definition = Some(handle);
            }
            Chunk::Fork(fork) => {
                let starter = self
                    .tracked
                    .get(&fork.resource_id)
                    .copied()
                    .filter(|&h| self.unfinished.iter().any(|(open, _)| *open == h));
                match starter {
                    Some(starter) => {
                        if let Some(buffer) = self.buffer_mut(starter) {
                            buffer.extend_from_slice(&fork.data);
                        }
                        self.last_definition = Some(starter);
                    }
                    None => {
                        warn!(
                            "fork for resource {:#x} has no open file; {} byte(s) dropped",
                            fork.resource_id,
                            fork.data.len()
                        );
                        self.stats.sync_errors += 1;
                    }
                }
            }
            Chunk::Continue(cont) => {
                let target = self.last_definition.and_then(|h| self.buffer_mut(h).map(|_| h));
                match target {
                    Some(handle) => {
                        if let Some(buffer) = self.buffer_mut(handle) {
                            buffer.extend_from_slice(&cont.data);
                        }
                    }
                    None => {
                        warn!("continuation with no open stream; {} byte(s) dropped", cont.data.len());
                        self.stats.sync_errors += 1;
                    }
                }
            }
            Chunk::Tail(tail) => {
                match self.tracked.get(&tail.resource_id).copied() {
                    Some(starter) => self.finalize(starter, false, files, snapshots)?,
                    None => {
                        warn!("tail for unknown resource {:#x}", tail.resource_id);
                        self.stats.sync_errors += 1;
                    }
                }
                self.last_definition = None;
            }
        }
        Ok(())
    }

    fn store(&mut self, chunk: Chunk) -> ChunkHandle {
        let handle = self.chunks.len();
        if let Some(id) = chunk.remember_id() {
            self.tracked.insert(id, handle);
        }
        self.chunks.push(chunk);
        handle
    }

    fn buffer_mut(&mut self, handle: ChunkHandle) -> Option<&mut Vec<u8>> {
        self.unfinished
            .iter_mut()
            .find(|(h, _)| *h == handle)
            .map(|(_, buffer)| buffer)
    }

    // ── Path resolution ──────────────────────────────────────────────────────

    /// Ascend parent links, innermost folder last.  A missing parent yields
    /// the partial path; ids at or below 1 are the synthetic root.
    fn folder_prefix(&self, folder_id: u32) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let mut current = folder_id;
        while current > 1 {
            if parts.len() >= MAX_FOLDER_DEPTH {
                warn!("folder chain for id {folder_id:#x} exceeds {MAX_FOLDER_DEPTH} levels; truncated");
                break;
            }
            match self.tracked.get(&current).map(|&h| &self.chunks[h]) {
                Some(Chunk::Directory(d)) => {
                    parts.push(&d.name);
                    if d.parent_id == current {
                        warn!("folder {current:#x} is its own parent; chain truncated");
                        break;
                    }
                    current = d.parent_id;
                }
                _ => {
                    warn!("parent folder {current:#x} was never seen; using partial path");
                    break;
                }
            }
        }
        parts.reverse();
        let mut prefix = String::new();
        for part in parts {
            prefix.push_str(&sanitize_name(part));
            prefix.push('/');
        }
        prefix
    }

    fn directory_path(&self, dir: &DirectoryChunk) -> String {
        format!("{}{}/", self.folder_prefix(dir.parent_id), sanitize_name(&dir.name))
    }

    fn file_path(&self, file: &FileChunk) -> String {
        format!("{}{}", self.folder_prefix(file.folder_id), sanitize_name(&file.name))
    }

    fn snapshot_path(snapshot: &SnapshotChunk) -> String {
        format!(
            "{}/{}",
            sanitize_name(&snapshot.parent_folder_name),
            sanitize_name(&snapshot.folder_name)
        )
    }

    // ── Emission ─────────────────────────────────────────────────────────────

    fn create_directory_entry(
        &mut self,
        dir: &DirectoryChunk,
        files: &mut dyn ArchiveSink,
    ) -> io::Result<()> {
        let path = self.directory_path(dir);
        let entry = files.create_entry(&path, CompressionHint::Default)?;
        if let Some(mtime) = modification_time(dir.last_modified, dir.backup_time) {
            files.set_last_write_time(entry, mtime)?;
        }
        files.close(entry)?;
        self.stats.directories_created += 1;
        Ok(())
    }

    fn finalize<'a>(
        &mut self,
        handle: ChunkHandle,
        forced: bool,
        files: &'a mut dyn ArchiveSink,
        snapshots: &'a mut dyn ArchiveSink,
    ) -> io::Result<()> {
        let Some(slot) = self.unfinished.iter().position(|(h, _)| *h == handle) else {
            warn!("tail for a file that is already closed");
            self.stats.sync_errors += 1;
            return Ok(());
        };
        let (_, data) = self.unfinished.remove(slot);

        let (path, declared, mtime, label, is_snapshot) = match &self.chunks[handle] {
            Chunk::File(f) => (
                self.file_path(f),
                f.file_size,
                modification_time(f.last_modified, f.backup_time),
                f.name.clone(),
                false,
            ),
            Chunk::Snapshot(s) => (
                Self::snapshot_path(s),
                s.file_size,
                modification_time(0, s.backup_time),
                s.folder_name.clone(),
                true,
            ),
            _ => return Ok(()),
        };

        let sink = if is_snapshot { snapshots } else { files };
        let entry = sink.create_entry(&path, CompressionHint::Default)?;
        if let Some(mtime) = mtime {
            sink.set_last_write_time(entry, mtime)?;
        }
        sink.write(entry, &data)?;
        sink.close(entry)?;

        if forced {
            warn!("\"{label}\" was still open at end of stream; closed with {} byte(s)", data.len());
            self.stats.forced_closes += 1;
        }
        if data.len() as u64 != u64::from(declared) {
            warn!(
                "\"{label}\": recovered {} byte(s) but the backup declared {declared}",
                data.len()
            );
            self.stats.size_mismatches += 1;
        }
        if is_snapshot {
            self.stats.snapshots_written += 1;
        } else {
            self.stats.files_written += 1;
        }
        Ok(())
    }

    fn force_close_all(
        &mut self,
        files: &mut dyn ArchiveSink,
        snapshots: &mut dyn ArchiveSink,
    ) -> io::Result<()> {
        while let Some(&(handle, _)) = self.unfinished.first() {
            self.finalize(handle, true, files, snapshots)?;
        }
        Ok(())
    }
}

/// Entry names use `/` as the archive separator; a `/` inside a Mac name
/// (legal there) is swapped out.
fn sanitize_name(name: &str) -> String {
    name.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use std::io::Cursor;

    use crate::retrospect::{
        CONTINUE_SIGNATURE, DIRECTORY_SIGNATURE, FILE_SIGNATURE, FORK_SIGNATURE,
        SNAPSHOT_SIGNATURE, TAIL_SIGNATURE,
    };

    // 1998-06-15-ish, comfortably past the 1980 plausibility floor.
    const MODERN: u32 = 2_980_000_000;

    fn pstr(out: &mut Vec<u8>, name: &str) {
        out.push(name.len() as u8);
        out.extend(name.bytes());
    }

    fn directory(out: &mut Vec<u8>, folder_id: u32, parent_id: u32, name: &str) {
        out.extend(DIRECTORY_SIGNATURE.to_be_bytes());
        out.extend(folder_id.to_be_bytes());
        out.extend(parent_id.to_be_bytes());
        out.extend(MODERN.to_be_bytes());
        out.extend(MODERN.to_be_bytes());
        pstr(out, name);
    }

    fn file(out: &mut Vec<u8>, resource_id: u32, folder_id: u32, size: u32, name: &str) {
        out.extend(FILE_SIGNATURE.to_be_bytes());
        out.extend(resource_id.to_be_bytes());
        out.extend(folder_id.to_be_bytes());
        out.extend(size.to_be_bytes());
        out.extend(MODERN.to_be_bytes());
        out.extend(MODERN.to_be_bytes());
        pstr(out, name);
    }

    fn fork(out: &mut Vec<u8>, resource_id: u32, data: &[u8]) {
        out.extend(FORK_SIGNATURE.to_be_bytes());
        out.extend(resource_id.to_be_bytes());
        out.extend((data.len() as u32).to_be_bytes());
        out.extend(data);
    }

    fn cont(out: &mut Vec<u8>, data: &[u8]) {
        out.extend(CONTINUE_SIGNATURE.to_be_bytes());
        out.extend((data.len() as u32).to_be_bytes());
        out.extend(data);
    }

    fn tail(out: &mut Vec<u8>, resource_id: u32) {
        out.extend(TAIL_SIGNATURE.to_be_bytes());
        out.extend(resource_id.to_be_bytes());
    }

    fn snapshot(out: &mut Vec<u8>, remember_id: u32, size: u32, parent: &str, name: &str) {
        out.extend(SNAPSHOT_SIGNATURE.to_be_bytes());
        out.extend(remember_id.to_be_bytes());
        out.extend(u32::from_be_bytes(*b"rBak").to_be_bytes());
        out.extend(MODERN.to_be_bytes());
        out.extend(size.to_be_bytes());
        pstr(out, parent);
        pstr(out, name);
    }

    fn parse(stream: Vec<u8>) -> (ParseStats, MemorySink, MemorySink) {
        let mut parser = RetrospectParser::new(Cursor::new(stream)).unwrap();
        let mut files = MemorySink::new();
        let mut snapshots = MemorySink::new();
        let stats = parser.run(&mut files, &mut snapshots).unwrap();
        (stats, files, snapshots)
    }

    #[test]
    fn file_inside_nested_directories() {
        let mut s = Vec::new();
        directory(&mut s, 2, 1, "HD");
        directory(&mut s, 3, 2, "Games");
        file(&mut s, 0x10, 3, 5, "frog.dat");
        fork(&mut s, 0x10, b"hello");
        tail(&mut s, 0x10);

        let (stats, files, _) = parse(s);
        assert_eq!(stats.files_written, 1);
        assert_eq!(stats.directories_created, 2);
        assert_eq!(stats.size_mismatches, 0);
        let entry = files.entry("HD/Games/frog.dat").unwrap();
        assert_eq!(entry.data, b"hello");
        assert!(entry.mtime.is_some());
    }

    #[test]
    fn resync_skips_garbage_and_recovers_chunks() {
        let mut s = vec![0x51u8; 7]; // garbage
        directory(&mut s, 2, 1, "Root");
        s.extend([0x52u8, 0x53, 0x54]); // more garbage
        file(&mut s, 0x20, 2, 5, "a.bin");
        fork(&mut s, 0x20, &[1, 2, 3, 4, 5]);
        tail(&mut s, 0x20);

        let (stats, files, _) = parse(s);
        assert_eq!(stats.bytes_skipped, 10);
        assert_eq!(stats.files_written, 1);
        assert_eq!(files.entry("Root/a.bin").unwrap().data, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn continue_extends_the_most_recent_stream() {
        let mut s = Vec::new();
        file(&mut s, 0x30, 1, 6, "b.bin");
        fork(&mut s, 0x30, b"abc");
        cont(&mut s, b"def");
        tail(&mut s, 0x30);

        let (stats, files, _) = parse(s);
        assert_eq!(stats.sync_errors, 0);
        assert_eq!(files.entry("b.bin").unwrap().data, b"abcdef");
    }

    #[test]
    fn orphan_continue_is_dropped_with_a_sync_error() {
        let mut s = Vec::new();
        cont(&mut s, b"zzz");
        let (stats, files, _) = parse(s);
        assert_eq!(stats.sync_errors, 1);
        assert!(files.entries.is_empty());
    }

    #[test]
    fn fork_interleaving_by_resource_id() {
        // Two files open at once; forks address them by id.
        let mut s = Vec::new();
        file(&mut s, 0x41, 1, 4, "one");
        file(&mut s, 0x42, 1, 4, "two");
        fork(&mut s, 0x41, b"AA");
        fork(&mut s, 0x42, b"BB");
        fork(&mut s, 0x41, b"aa");
        fork(&mut s, 0x42, b"bb");
        tail(&mut s, 0x41);
        tail(&mut s, 0x42);

        let (_, files, _) = parse(s);
        assert_eq!(files.entry("one").unwrap().data, b"AAaa");
        assert_eq!(files.entry("two").unwrap().data, b"BBbb");
    }

    #[test]
    fn dangling_file_is_force_closed_with_warning_counters() {
        let mut s = Vec::new();
        file(&mut s, 0x50, 1, 100, "cut-short.bin");
        fork(&mut s, 0x50, b"only this much");

        let (stats, files, _) = parse(s);
        assert_eq!(stats.forced_closes, 1);
        assert_eq!(stats.size_mismatches, 1);
        assert_eq!(files.entry("cut-short.bin").unwrap().data, b"only this much");
    }

    #[test]
    fn snapshots_go_to_the_second_archive() {
        let mut s = Vec::new();
        snapshot(&mut s, 0x60, 3, "Backups", "Set A");
        fork(&mut s, 0x60, b"xyz");
        tail(&mut s, 0x60);

        let (stats, files, snapshots) = parse(s);
        assert_eq!(stats.snapshots_written, 1);
        assert!(files.entries.is_empty());
        assert_eq!(snapshots.entry("Backups/Set A").unwrap().data, b"xyz");
    }

    #[test]
    fn missing_parent_yields_partial_path() {
        let mut s = Vec::new();
        file(&mut s, 0x70, 99, 1, "lost.bin"); // folder 99 never defined
        fork(&mut s, 0x70, b"x");
        tail(&mut s, 0x70);

        let (_, files, _) = parse(s);
        assert!(files.entry("lost.bin").is_some());
    }

    #[test]
    fn slash_in_names_is_sanitized() {
        let mut s = Vec::new();
        file(&mut s, 0x80, 1, 1, "a/b");
        fork(&mut s, 0x80, b"x");
        tail(&mut s, 0x80);
        let (_, files, _) = parse(s);
        assert!(files.entry("a_b").is_some());
    }
}
