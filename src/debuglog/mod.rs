//! Thread-safe binary debug/trace log (spec §4.11).
//!
//! This is the VMM's own post-mortem instrument: a process-wide, lock-free-on-the-hot-path append
//! log that [`reader::Reader`] can index and search offline. It is deliberately separate from the
//! ad hoc `eprintln!` progress lines the rest of this crate emits (see `SPEC_FULL.md` §10.1) — those
//! are for a human watching stderr; this is for reconstructing what happened after the fact.
//!
//! # Wire format
//!
//! Each record is a fixed 16-byte header followed by `src_len` source bytes and `data_len` payload
//! bytes:
//!
//! ```text
//! kind:u16 | src_len:u16 | data_len:u32 | unix_nanos:u64 | source bytes | payload bytes
//! ```
//!
//! `kind == 0` ([`Kind::Invalid`]) is reserved so a reader scanning past the logical end of a file
//! (e.g. a truncated tail from a crashed process) sees zeroed bytes and can tell it has run off the
//! end rather than decoding garbage as a record.
//!
//! # Concurrency
//!
//! Writers reserve their slot with a single `fetch_add` on an atomic byte offset, then write header,
//! source, and payload with positional (`pwrite`-style) writes at that slot. Two concurrent writers
//! never contend on a lock and never overlap in the file; ordering between their records is defined
//! by which one reserved the lower offset, not by wall-clock time. The installed writer handle is
//! itself swapped through an atomic pointer so that [`Logger::open`] can be called while writers are
//! in flight without those writers ever observing a torn or null handle mid-write. Swapping leaks the
//! previously-installed handle rather than freeing it — `open` is expected to run a handful of times
//! per process lifetime (log rotation, not a hot path), so the one-time leak is an acceptable trade
//! for not needing a reclamation scheme to make the swap sound.

pub mod reader;

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub use reader::{Reader, SearchOptions};

/// Size of the fixed record header in bytes.
pub const HEADER_LEN: u64 = 16;

#[derive(Error, Debug)]
pub enum DebugLogError {
    #[error("debug log io error: {0}")]
    Io(#[from] io::Error),

    #[error("debug log search cannot set both LimitStart and LimitEnd")]
    ConflictingLimits,

    #[error("source name too long: {0} bytes (max {1})")]
    SourceTooLong(usize, u16),

    #[error("payload too long: {0} bytes (max {1})")]
    PayloadTooLong(usize, u32),
}

/// Discriminates the payload of a record. `Invalid` (0) is never written by [`Logger::write`]; it is
/// the value a reader sees when it scans past the logical end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Kind {
    Invalid = 0,
    Bytes = 1,
    String = 2,
}

impl Kind {
    pub(crate) fn from_u16(v: u16) -> Option<Kind> {
        match v {
            0 => Some(Kind::Invalid),
            1 => Some(Kind::Bytes),
            2 => Some(Kind::String),
            _ => None,
        }
    }
}

/// A sink that a [`Logger`] can append framed records into at arbitrary, non-overlapping offsets.
///
/// Implemented for [`std::fs::File`] on unix via `pwrite`; tests use an in-memory implementation
/// backed by a mutex-guarded `Vec<u8>` (contention there is irrelevant — it only matters that the
/// production path, `File`, never takes a lock).
pub trait LogWriter: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
}

#[cfg(unix)]
impl LogWriter for std::fs::File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        FileExt::write_all_at(self, buf, offset)
    }
}

/// Open a debug log file for writing, truncating any stale tail bytes from a prior run so they can
/// never be misread as a valid record by a later scan.
pub fn open_file(path: impl AsRef<std::path::Path>) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// Process-wide debug log handle. There is normally exactly one of these (see [`global`]), but the
/// type itself has no global state baked in so tests can each own a private instance.
pub struct Logger {
    writer: AtomicPtr<Arc<dyn LogWriter>>,
    offset: AtomicU64,
}

impl Logger {
    pub const fn new() -> Self {
        Self {
            writer: AtomicPtr::new(ptr::null_mut()),
            offset: AtomicU64::new(0),
        }
    }

    /// Install `writer` as the backing sink and reset the monotonic offset counter. Safe to call
    /// while other threads are calling [`Logger::write`] concurrently.
    pub fn open(&self, writer: Arc<dyn LogWriter>) {
        let boxed = Box::into_raw(Box::new(writer));
        self.offset.store(0, Ordering::Relaxed);
        let old = self.writer.swap(boxed, Ordering::AcqRel);
        if !old.is_null() {
            // Intentionally leaked: see module docs. A concurrent writer may still hold a raw
            // reference to `*old`; without a hazard-pointer scheme we cannot prove it is safe to
            // free, and `open` is not expected to run often enough for the leak to matter.
        }
    }

    /// Detach the writer. Subsequent writes become no-ops until `open` is called again.
    pub fn close(&self) {
        let old = self.writer.swap(ptr::null_mut(), Ordering::AcqRel);
        let _ = old; // leaked, see `open`
    }

    fn current_writer(&self) -> Option<Arc<dyn LogWriter>> {
        let ptr = self.writer.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // Safe: once installed via `open`, the pointee is never freed (only ever replaced and
        // leaked), so dereferencing a non-null pointer we just loaded is always valid.
        Some(unsafe { &*ptr }.clone())
    }

    /// Append a record. A no-op if no writer has been installed (consumers of this crate cannot
    /// observe the difference between "no logger" and "logger exists but writer gone").
    pub fn write(&self, kind: Kind, source: &str, data: &[u8]) -> Result<(), DebugLogError> {
        let Some(writer) = self.current_writer() else {
            return Ok(());
        };
        if source.len() > u16::MAX as usize {
            return Err(DebugLogError::SourceTooLong(source.len(), u16::MAX));
        }
        if data.len() > u32::MAX as usize {
            return Err(DebugLogError::PayloadTooLong(data.len(), u32::MAX));
        }
        let src_len = source.len() as u16;
        let data_len = data.len() as u32;
        let total = HEADER_LEN + src_len as u64 + data_len as u64;
        let offset = self.offset.fetch_add(total, Ordering::Relaxed);

        let mut header = [0u8; HEADER_LEN as usize];
        header[0..2].copy_from_slice(&(kind as u16).to_le_bytes());
        header[2..4].copy_from_slice(&src_len.to_le_bytes());
        header[4..8].copy_from_slice(&data_len.to_le_bytes());
        header[8..16].copy_from_slice(&now_unix_nanos().to_le_bytes());

        writer.write_at(&header, offset)?;
        if !source.is_empty() {
            writer.write_at(source.as_bytes(), offset + HEADER_LEN)?;
        }
        if !data.is_empty() {
            writer.write_at(data, offset + HEADER_LEN + src_len as u64)?;
        }
        Ok(())
    }

    /// Convenience wrapper around [`Logger::write`] for string payloads.
    pub fn write_str(&self, source: &str, data: &str) -> Result<(), DebugLogError> {
        self.write(Kind::String, source, data.as_bytes())
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// FNV-1a over the raw bytes of a record's source string, used for the reader's per-source index
/// and for the `Sources` filter in [`SearchOptions`] (hand-rolled: no crate in this pack's manifests
/// depends on an `fnv` crate, and the algorithm is a handful of lines).
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory `LogWriter` for tests: grows on demand, writes are not actually concurrent-safe
    /// beyond "doesn't panic", which is all tests need.
    #[derive(Default)]
    pub struct MemWriter(Mutex<Vec<u8>>);

    impl LogWriter for MemWriter {
        fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
            let mut guard = self.0.lock().unwrap();
            let end = offset as usize + buf.len();
            if guard.len() < end {
                guard.resize(end, 0);
            }
            guard[offset as usize..end].copy_from_slice(buf);
            Ok(())
        }
    }

    impl MemWriter {
        pub fn snapshot(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn write_reserves_disjoint_slots() {
        let logger = Logger::new();
        let mem = Arc::new(MemWriter::default());
        logger.open(mem.clone());

        logger.write_str("a", "hello").unwrap();
        logger.write_str("bb", "world!").unwrap();

        let bytes = mem.snapshot();
        // first record: 16 + 1 + 5 = 22 bytes; second starts right after.
        assert_eq!(bytes.len(), 22 + 16 + 2 + 6);
        assert_eq!(Kind::from_u16(u16::from_le_bytes([bytes[0], bytes[1]])), Some(Kind::String));
    }

    #[test]
    fn write_without_writer_is_noop() {
        let logger = Logger::new();
        assert!(logger.write_str("a", "hello").is_ok());
    }

    #[test]
    fn fnv1a_is_deterministic_and_distinct() {
        assert_eq!(fnv1a(b"serial"), fnv1a(b"serial"));
        assert_ne!(fnv1a(b"serial"), fnv1a(b"ioapic"));
    }
}
