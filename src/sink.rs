//! Archive sinks — where recovered entries go.
//!
//! The extraction pipeline only ever talks to the [`ArchiveSink`] trait:
//! create an entry at a path, stream bytes into it, stamp a modification
//! time, close it.  Paths use `/` as separator; an entry path ending in `/`
//! is a directory.  Container formats (zip et al.) are deliberately behind
//! this seam — [`DirectorySink`] materializes entries as a plain directory
//! tree, [`NullSink`] discards everything while counting, and
//! [`MemorySink`] captures entries for assertions.

use std::collections::HashSet;
use std::fs::{self, File, FileTimes};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::debug;

/// Advisory compression hint for sinks that compress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionHint {
    /// Whatever the sink defaults to.
    Default,
    /// Store verbatim; the payload is already dense or tiny.
    Store,
}

pub type EntryHandle = usize;

pub trait ArchiveSink {
    fn create_entry(&mut self, path: &str, hint: CompressionHint) -> io::Result<EntryHandle>;
    fn set_last_write_time(&mut self, entry: EntryHandle, time: DateTime<Utc>) -> io::Result<()>;
    fn write(&mut self, entry: EntryHandle, bytes: &[u8]) -> io::Result<()>;
    fn close(&mut self, entry: EntryHandle) -> io::Result<()>;
    fn close_archive(&mut self) -> io::Result<()>;
}

fn stale_handle(entry: EntryHandle) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("entry handle {entry} is not open"))
}

/// Normalize an archive path into safe relative components.
fn sanitize_components(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .map(|c| c.to_string())
        .collect()
}

// ── DirectorySink ────────────────────────────────────────────────────────────

struct DirEntry {
    path:   PathBuf,
    file:   Option<File>,
    mtime:  Option<DateTime<Utc>>,
    is_dir: bool,
}

/// Materializes entries as files under a root directory.
pub struct DirectorySink {
    root:    PathBuf,
    entries: Vec<DirEntry>,
}

impl DirectorySink {
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)?;
        Ok(Self { root, entries: Vec::new() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn finish_entry(&mut self, entry: EntryHandle) -> io::Result<()> {
        let state = self.entries.get_mut(entry).ok_or_else(|| stale_handle(entry))?;
        if let Some(file) = state.file.take() {
            if let Some(mtime) = state.mtime {
                let times = FileTimes::new().set_modified(SystemTime::from(mtime));
                file.set_times(times)?;
            }
            file.sync_all()?;
        }
        Ok(())
    }
}

impl ArchiveSink for DirectorySink {
    fn create_entry(&mut self, path: &str, _hint: CompressionHint) -> io::Result<EntryHandle> {
        let is_dir = path.ends_with('/');
        let components = sanitize_components(path);
        let mut full = self.root.clone();
        for c in &components {
            full.push(c);
        }

        let file = if is_dir || components.is_empty() {
            fs::create_dir_all(&full)?;
            None
        } else {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            Some(File::create(&full)?)
        };
        debug!("entry created: {}", full.display());

        self.entries.push(DirEntry { path: full, file, mtime: None, is_dir });
        Ok(self.entries.len() - 1)
    }

    fn set_last_write_time(&mut self, entry: EntryHandle, time: DateTime<Utc>) -> io::Result<()> {
        let state = self.entries.get_mut(entry).ok_or_else(|| stale_handle(entry))?;
        state.mtime = Some(time);
        Ok(())
    }

    fn write(&mut self, entry: EntryHandle, bytes: &[u8]) -> io::Result<()> {
        let state = self.entries.get_mut(entry).ok_or_else(|| stale_handle(entry))?;
        match &mut state.file {
            Some(file) => file.write_all(bytes),
            None if state.is_dir => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write bytes into directory entry {}", state.path.display()),
            )),
            None => Err(stale_handle(entry)),
        }
    }

    fn close(&mut self, entry: EntryHandle) -> io::Result<()> {
        self.finish_entry(entry)
    }

    fn close_archive(&mut self) -> io::Result<()> {
        for entry in 0..self.entries.len() {
            self.finish_entry(entry)?;
        }
        Ok(())
    }
}

// ── NullSink ─────────────────────────────────────────────────────────────────

/// Discards all content, counting entries and bytes.
#[derive(Debug, Default)]
pub struct NullSink {
    pub entries_created: usize,
    pub bytes_written:   u64,
    open:                HashSet<EntryHandle>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArchiveSink for NullSink {
    fn create_entry(&mut self, _path: &str, _hint: CompressionHint) -> io::Result<EntryHandle> {
        let handle = self.entries_created;
        self.entries_created += 1;
        self.open.insert(handle);
        Ok(handle)
    }

    fn set_last_write_time(&mut self, entry: EntryHandle, _time: DateTime<Utc>) -> io::Result<()> {
        if !self.open.contains(&entry) {
            return Err(stale_handle(entry));
        }
        Ok(())
    }

    fn write(&mut self, entry: EntryHandle, bytes: &[u8]) -> io::Result<()> {
        if !self.open.contains(&entry) {
            return Err(stale_handle(entry));
        }
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn close(&mut self, entry: EntryHandle) -> io::Result<()> {
        self.open.remove(&entry);
        Ok(())
    }

    fn close_archive(&mut self) -> io::Result<()> {
        self.open.clear();
        Ok(())
    }
}

// ── MemorySink ───────────────────────────────────────────────────────────────

/// Captured archive entry.
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub path:   String,
    pub data:   Vec<u8>,
    pub mtime:  Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub closed: bool,
}

/// Keeps every entry in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub entries: Vec<MemoryEntry>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, path: &str) -> Option<&MemoryEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

impl ArchiveSink for MemorySink {
    fn create_entry(&mut self, path: &str, _hint: CompressionHint) -> io::Result<EntryHandle> {
        self.entries.push(MemoryEntry {
            path: path.to_string(),
            data: Vec::new(),
            mtime: None,
            is_dir: path.ends_with('/'),
            closed: false,
        });
        Ok(self.entries.len() - 1)
    }

    fn set_last_write_time(&mut self, entry: EntryHandle, time: DateTime<Utc>) -> io::Result<()> {
        let e = self.entries.get_mut(entry).ok_or_else(|| stale_handle(entry))?;
        e.mtime = Some(time);
        Ok(())
    }

    fn write(&mut self, entry: EntryHandle, bytes: &[u8]) -> io::Result<()> {
        let e = self.entries.get_mut(entry).ok_or_else(|| stale_handle(entry))?;
        e.data.extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self, entry: EntryHandle) -> io::Result<()> {
        let e = self.entries.get_mut(entry).ok_or_else(|| stale_handle(entry))?;
        e.closed = true;
        Ok(())
    }

    fn close_archive(&mut self) -> io::Result<()> {
        for e in &mut self.entries {
            e.closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn directory_sink_writes_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path()).unwrap();

        let d = sink.create_entry("Projects/Art/", CompressionHint::Default).unwrap();
        sink.close(d).unwrap();
        let f = sink.create_entry("Projects/Art/logo.pict", CompressionHint::Default).unwrap();
        sink.write(f, b"pict bytes").unwrap();
        let mtime = Utc.with_ymd_and_hms(1999, 4, 1, 12, 0, 0).unwrap();
        sink.set_last_write_time(f, mtime).unwrap();
        sink.close(f).unwrap();
        sink.close_archive().unwrap();

        let written = dir.path().join("Projects/Art/logo.pict");
        assert_eq!(fs::read(&written).unwrap(), b"pict bytes");
        let modified = fs::metadata(&written).unwrap().modified().unwrap();
        assert_eq!(modified, SystemTime::from(mtime));
    }

    #[test]
    fn directory_sink_neutralizes_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::new(dir.path()).unwrap();
        let f = sink.create_entry("../escape.txt", CompressionHint::Default).unwrap();
        sink.write(f, b"x").unwrap();
        sink.close(f).unwrap();
        assert!(dir.path().join("escape.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn null_sink_counts() {
        let mut sink = NullSink::new();
        let a = sink.create_entry("a", CompressionHint::Store).unwrap();
        sink.write(a, &[0u8; 10]).unwrap();
        sink.write(a, &[0u8; 5]).unwrap();
        sink.close(a).unwrap();
        assert_eq!(sink.entries_created, 1);
        assert_eq!(sink.bytes_written, 15);
        assert!(sink.write(a, &[0u8]).is_err());
    }

    #[test]
    fn memory_sink_captures_entries() {
        let mut sink = MemorySink::new();
        let f = sink.create_entry("dir/file.bin", CompressionHint::Default).unwrap();
        sink.write(f, &[1, 2, 3]).unwrap();
        sink.close(f).unwrap();
        let e = sink.entry("dir/file.bin").unwrap();
        assert_eq!(e.data, vec![1, 2, 3]);
        assert!(e.closed);
    }
}
