//! In-memory key → byte offset index over the backing file.
//!
//! The index is a cache. It is rebuilt wholesale after every mutation and
//! whenever the file on disk no longer matches the stamp taken at scan time.

use crate::codec;
use crate::error::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, Read};
use std::path::Path;
use std::time::SystemTime;

/// Maximum size for a single record line (64MB); longer lines are treated as corrupt.
pub(crate) const MAX_LINE_BYTES: u64 = 64 * 1024 * 1024;

/// Identity of the backing file at the moment it was scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

impl FileStamp {
    /// Stamp of the file at `path`, or `None` if it does not exist.
    pub fn of(path: &Path) -> Result<Option<Self>> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt as _;
            meta.ino()
        };
        #[cfg(not(unix))]
        let inode = 0;
        Ok(Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            inode,
        }))
    }
}

/// Counters gathered while scanning the backing file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Distinct keys indexed.
    pub records: usize,
    /// Lines that could not be read or decoded.
    pub malformed: usize,
    /// Keys seen more than once; the last occurrence wins.
    pub duplicates: usize,
    /// Total bytes scanned.
    pub bytes: u64,
}

impl ScanReport {
    /// True when the file holds exactly one readable line per key.
    pub const fn is_clean(&self) -> bool {
        self.malformed == 0 && self.duplicates == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    offsets: HashMap<String, u64>,
    stamp: Option<FileStamp>,
}

impl KeyIndex {
    /// Index the file at `path`. A missing file yields an empty index.
    pub fn scan_path(path: &Path) -> Result<(Self, ScanReport)> {
        let stamp = FileStamp::of(path)?;
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Self::default(), ScanReport::default()));
            }
            Err(err) => return Err(err.into()),
        };
        let (mut index, report) = Self::scan(std::io::BufReader::new(file))?;
        index.stamp = stamp;
        Ok((index, report))
    }

    /// Index lines from `reader`, reading only the leading key of each line.
    pub fn scan<R: BufRead>(reader: R) -> Result<(Self, ScanReport)> {
        let mut offsets = HashMap::new();
        let mut report = ScanReport::default();

        let bytes = scan_lines(reader, |offset, line| match line {
            ScannedLine::Text(text) => match codec::decode_key(text) {
                Ok(key) => {
                    if offsets.insert(key.clone(), offset).is_some() {
                        report.duplicates += 1;
                        tracing::warn!(key = %key, offset, "duplicate key in record file; later line wins");
                    }
                }
                Err(err) => {
                    report.malformed += 1;
                    tracing::warn!(offset, error = %err, "skipping malformed record line");
                }
            },
            ScannedLine::Unreadable(reason) => {
                report.malformed += 1;
                tracing::warn!(offset, reason, "skipping unreadable record line");
            }
        })?;

        report.records = offsets.len();
        report.bytes = bytes;
        Ok((Self { offsets, stamp: None }, report))
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.offsets.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.offsets.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.offsets.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Whether the file at `path` is still the one this index was built from.
    pub fn matches(&self, path: &Path) -> Result<bool> {
        Ok(FileStamp::of(path)? == self.stamp)
    }
}

pub(crate) enum ScannedLine<'a> {
    /// Line content without its terminator.
    Text(&'a str),
    /// Oversized or not UTF-8.
    Unreadable(&'static str),
}

/// Walk `reader` line by line, calling `visit` with each non-blank line and
/// its starting byte offset. Returns the total number of bytes consumed.
pub(crate) fn scan_lines<R, F>(mut reader: R, mut visit: F) -> Result<u64>
where
    R: BufRead,
    F: FnMut(u64, ScannedLine<'_>),
{
    let mut offset = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        let mut consumed = read as u64;

        if read as u64 == MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
            consumed += reader.skip_until(b'\n')? as u64;
            visit(offset, ScannedLine::Unreadable("line exceeds size limit"));
            offset += consumed;
            continue;
        }

        match std::str::from_utf8(&buf) {
            Ok(text) => {
                let text = text.trim_end_matches(['\n', '\r']);
                if !text.trim().is_empty() {
                    visit(offset, ScannedLine::Text(text));
                }
            }
            Err(_) => visit(offset, ScannedLine::Unreadable("line is not valid UTF-8")),
        }
        offset += consumed;
    }
    Ok(offset)
}

/// Outcome of reading the single line that starts at a byte offset.
pub(crate) enum LineAt {
    Eof,
    Text(String),
    Unreadable,
}

pub(crate) fn read_line_at(path: &Path, offset: u64) -> Result<LineAt> {
    use std::io::{Seek, SeekFrom};

    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(LineAt::Eof),
        Err(err) => return Err(err.into()),
    };
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = std::io::BufReader::new(file).take(MAX_LINE_BYTES);
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(LineAt::Eof);
    }
    if reader.limit() == 0 && buf.last() != Some(&b'\n') {
        return Ok(LineAt::Unreadable);
    }
    Ok(String::from_utf8(buf).map_or(LineAt::Unreadable, LineAt::Text))
}
