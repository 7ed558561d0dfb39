//! Offline reader for the binary debug log written by [`super::Logger`].
//!
//! The reader performs one sequential pass over the log at construction time to build an index
//! (per-source offsets keyed by FNV-1a hash, plus the earliest/latest timestamp seen), then answers
//! [`Reader::search`]/[`Reader::count`] queries against that index without re-scanning the file.
//! Record bodies are re-fetched through a positional [`ReadAt`] at query time rather than cached, so
//! the index itself stays small even for a log with a large payload volume.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};

use super::{fnv1a, Kind, DebugLogError, HEADER_LEN};

/// Sequential-read-plus-seek source the index pass consumes. Implemented for anything that is
/// `Read`; callers typically hand in a `BufReader<File>`.
pub trait IndexSource: Read {}
impl<T: Read> IndexSource for T {}

/// Positional reader used to re-fetch a record's bytes once its offset is known from the index.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
}

#[cfg(unix)]
impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        FileExt::read_exact_at(self, buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for std::sync::Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read_at(buf, offset)
    }
}

const INDEX_BUF_CAPACITY: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    unix_nanos: u64,
    source_hash: u64,
}

/// A fully-indexed debug log, ready for [`Reader::search`]/[`Reader::count`].
pub struct Reader<A: ReadAt> {
    reader_at: A,
    entries: Vec<IndexEntry>,
    source_names: HashMap<u64, String>,
    earliest: Option<u64>,
    latest: Option<u64>,
}

/// A single decoded record handed to a [`Reader::search`] callback.
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: Kind,
    pub source: String,
    pub unix_nanos: u64,
    pub data: Vec<u8>,
}

/// Filters and bounds for [`Reader::search`]/[`Reader::count`]. Default selects everything.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub time_start: Option<u64>,
    pub time_end: Option<u64>,
    /// Restrict to these source names. `None` matches every source.
    pub sources: Option<Vec<String>>,
    /// Keep only the first `limit_start` matches in timestamp order. Mutually exclusive with
    /// `limit_end`.
    pub limit_start: Option<usize>,
    /// Keep only the last `limit_end` matches in timestamp order. Mutually exclusive with
    /// `limit_start`.
    pub limit_end: Option<usize>,
}

impl<A: ReadAt> Reader<A> {
    /// Build a `Reader` by indexing `seekable` (consumed in full, sequentially) and keeping
    /// `reader_at` around to re-fetch record bytes during `search`.
    pub fn new(seekable: impl Read, reader_at: A) -> Result<Self, DebugLogError> {
        let mut buffered = BufReader::with_capacity(INDEX_BUF_CAPACITY, seekable);
        let mut entries = Vec::new();
        let mut source_names = HashMap::new();
        let mut earliest = None;
        let mut latest = None;
        let mut offset: u64 = 0;

        loop {
            let mut header = [0u8; HEADER_LEN as usize];
            match read_exact_or_eof(&mut buffered, &mut header)? {
                false => break,
                true => {}
            }
            let kind_raw = u16::from_le_bytes([header[0], header[1]]);
            if kind_raw == Kind::Invalid as u16 {
                // Zeroed tail from a process that stopped mid-reservation; nothing valid follows.
                break;
            }
            let src_len = u16::from_le_bytes([header[2], header[3]]) as usize;
            let data_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let unix_nanos = u64::from_le_bytes(header[8..16].try_into().unwrap());

            let mut source = vec![0u8; src_len];
            buffered.read_exact(&mut source)?;
            let mut skipped = 0usize;
            let mut scratch = [0u8; 4096];
            while skipped < data_len {
                let want = (data_len - skipped).min(scratch.len());
                buffered.read_exact(&mut scratch[..want])?;
                skipped += want;
            }

            let source_hash = fnv1a(&source);
            source_names
                .entry(source_hash)
                .or_insert_with(|| String::from_utf8_lossy(&source).into_owned());

            entries.push(IndexEntry {
                offset,
                unix_nanos,
                source_hash,
            });
            earliest = Some(earliest.map_or(unix_nanos, |e: u64| e.min(unix_nanos)));
            latest = Some(latest.map_or(unix_nanos, |l: u64| l.max(unix_nanos)));

            offset += HEADER_LEN + src_len as u64 + data_len as u64;
        }

        Ok(Self {
            reader_at,
            entries,
            source_names,
            earliest,
            latest,
        })
    }

    pub fn earliest(&self) -> Option<u64> {
        self.earliest
    }

    pub fn latest(&self) -> Option<u64> {
        self.latest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of indexed records matching `opts` (ignores `limit_start`/`limit_end`, which only
    /// trim the result set `search` returns, not the logical match count).
    pub fn count(&self, opts: &SearchOptions) -> Result<usize, DebugLogError> {
        self.matching(opts).map(|v| v.len())
    }

    /// Invoke `f` once per matching record, oldest to newest, after applying `opts`'s head/tail
    /// truncation.
    pub fn search(
        &self,
        opts: &SearchOptions,
        mut f: impl FnMut(Record) -> Result<(), DebugLogError>,
    ) -> Result<(), DebugLogError> {
        let mut matched = self.matching(opts)?;
        matched.sort_by_key(|e| e.unix_nanos);

        if let (Some(_), Some(_)) = (opts.limit_start, opts.limit_end) {
            return Err(DebugLogError::ConflictingLimits);
        }
        if let Some(n) = opts.limit_start {
            matched.truncate(n);
        }
        if let Some(n) = opts.limit_end {
            let start = matched.len().saturating_sub(n);
            matched = matched.split_off(start);
        }

        for entry in matched {
            f(self.fetch(&entry)?)?;
        }
        Ok(())
    }

    fn matching(&self, opts: &SearchOptions) -> Result<Vec<IndexEntry>, DebugLogError> {
        if opts.limit_start.is_some() && opts.limit_end.is_some() {
            return Err(DebugLogError::ConflictingLimits);
        }
        let wanted_hashes: Option<Vec<u64>> = opts
            .sources
            .as_ref()
            .map(|names| names.iter().map(|n| fnv1a(n.as_bytes())).collect());

        Ok(self
            .entries
            .iter()
            .copied()
            .filter(|e| opts.time_start.map_or(true, |t| e.unix_nanos >= t))
            .filter(|e| opts.time_end.map_or(true, |t| e.unix_nanos <= t))
            .filter(|e| {
                wanted_hashes
                    .as_ref()
                    .map_or(true, |hashes| hashes.contains(&e.source_hash))
            })
            .collect())
    }

    fn fetch(&self, entry: &IndexEntry) -> Result<Record, DebugLogError> {
        let mut header = [0u8; HEADER_LEN as usize];
        self.reader_at.read_at(&mut header, entry.offset)?;
        let kind = Kind::from_u16(u16::from_le_bytes([header[0], header[1]])).unwrap_or(Kind::Invalid);
        let src_len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let data_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut body = vec![0u8; src_len + data_len];
        if !body.is_empty() {
            self.reader_at.read_at(&mut body, entry.offset + HEADER_LEN)?;
        }
        let source = String::from_utf8_lossy(&body[..src_len]).into_owned();
        let data = body[src_len..].to_vec();

        Ok(Record {
            kind,
            source,
            unix_nanos: entry.unix_nanos,
            data,
        })
    }

    /// Source name registered for `hash`, if the index has seen it.
    pub fn source_name(&self, hash: u64) -> Option<&str> {
        self.source_names.get(&hash).map(|s| s.as_str())
    }
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` on a clean EOF before any byte is read
/// and an error on a partial record (the underlying `read_exact` semantics, surfaced explicitly so
/// the index loop can tell "end of log" apart from "truncated record").
fn read_exact_or_eof(r: &mut impl BufRead, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let chunk = r.fill_buf()?;
        if chunk.is_empty() {
            return if filled == 0 {
                Ok(false)
            } else {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated debug log record"))
            };
        }
        let n = chunk.len().min(buf.len() - filled);
        buf[filled..filled + n].copy_from_slice(&chunk[..n]);
        r.consume(n);
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debuglog::{Logger};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MemBackend(Mutex<Vec<u8>>);

    impl crate::debuglog::LogWriter for MemBackend {
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

    impl ReadAt for MemBackend {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
            let guard = self.0.lock().unwrap();
            let end = offset as usize + buf.len();
            buf.copy_from_slice(&guard[offset as usize..end]);
            Ok(())
        }
    }

    impl MemBackend {
        fn snapshot(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn indexes_and_filters_by_source_and_time() {
        let logger = Logger::new();
        let mem = Arc::new(MemBackend::default());
        logger.open(mem.clone());

        logger.write_str("ioapic", "a").unwrap();
        logger.write_str("serial", "b").unwrap();
        logger.write_str("ioapic", "c").unwrap();

        let bytes = mem.snapshot();
        let reader = Reader::new(Cursor::new(bytes), mem.clone()).unwrap();
        assert_eq!(reader.len(), 3);

        let mut seen = Vec::new();
        reader
            .search(
                &SearchOptions {
                    sources: Some(vec!["ioapic".into()]),
                    ..Default::default()
                },
                |rec| {
                    seen.push(rec.data);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn conflicting_limits_rejected() {
        let logger = Logger::new();
        let mem = Arc::new(MemBackend::default());
        logger.open(mem.clone());
        logger.write_str("x", "1").unwrap();

        let bytes = mem.snapshot();
        let reader = Reader::new(Cursor::new(bytes), mem.clone()).unwrap();
        let opts = SearchOptions {
            limit_start: Some(1),
            limit_end: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            reader.search(&opts, |_| Ok(())),
            Err(DebugLogError::ConflictingLimits)
        ));
    }
}
