//! Single-file versioned record store.
//!
//! The backing file holds one `{key: record}` JSON object per line with at
//! most one line per key. Reads seek straight to a line through the in-memory
//! [`KeyIndex`]; every mutation rewrites the whole file through a temporary
//! file and an atomic rename, then rebuilds the index.
//!
//! Lock order is always: writer mutex, index lock, file lock.

use crate::codec;
use crate::error::{Error, Result};
use crate::history;
use crate::index::{KeyIndex, LineAt, ScanReport, ScannedLine, read_line_at, scan_lines};
use crate::lock::FileLock;
use crate::record::Record;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Tunables for a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on waiting for the advisory lock; `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Sub-fields removed from incoming data before merging.
    pub strip_fields: Vec<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Some(Duration::from_secs(10)),
            strip_fields: codec::DEFAULT_STRIP_FIELDS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    lock: FileLock,
    options: StoreOptions,
    writer: Mutex<()>,
    index: RwLock<KeyIndex>,
}

/// What a single indexed lookup found.
enum Probe {
    Found(Record),
    Absent,
    /// File changed since the index was built.
    Stale,
    /// Offset no longer starts this key's line.
    Moved,
    Corrupt(Error),
}

/// Result of a rewrite pass.
struct Rewrite {
    existed: bool,
    record: Option<Record>,
    report: ScanReport,
}

impl RecordStore {
    /// Open (creating if needed) the store backed by `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(Error::validation("record store path must not be empty"));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        secure_open_options()
            .create(true)
            .append(true)
            .open(&path)?;

        let store = Self {
            lock: FileLock::for_data_file(&path, options.lock_timeout),
            path,
            options,
            writer: Mutex::new(()),
            index: RwLock::new(KeyIndex::default()),
        };
        let report = store.rebuild_index()?;
        if !report.is_clean() {
            tracing::warn!(
                path = %store.path.display(),
                malformed = report.malformed,
                duplicates = report.duplicates,
                "record file needs repair; affected lines are dropped on the next write"
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Merge `fields` into the record for `key`, creating it if needed.
    pub fn write(&self, key: &str, fields: Map<String, Value>) -> Result<()> {
        validate_key(key)?;
        let fields = codec::sanitize_fields(fields, &self.options.strip_fields);
        let rewrite = self.rewrite(Some(key), |existing| {
            Some(history::merge(existing.as_ref(), &fields, Utc::now()))
        })?;
        tracing::debug!(
            key = %key,
            created = !rewrite.existed,
            fields = fields.len(),
            "wrote record"
        );
        Ok(())
    }

    /// Current record for `key`, or `None`.
    ///
    /// A record whose line cannot be decoded is deleted and reported as absent.
    pub fn read(&self, key: &str) -> Result<Option<Record>> {
        match self.probe(key)? {
            Probe::Found(record) => return Ok(Some(record)),
            Probe::Absent => return Ok(None),
            Probe::Stale | Probe::Moved | Probe::Corrupt(_) => {}
        }

        // Another process may have rewritten the file; retry on a fresh index.
        match self.probe_fresh(key)? {
            Probe::Found(record) => Ok(Some(record)),
            Probe::Absent | Probe::Stale | Probe::Moved => Ok(None),
            Probe::Corrupt(err) => {
                tracing::warn!(key = %key, error = %err, "record line is corrupt; deleting it");
                self.heal(key)
            }
        }
    }

    /// Remove the record for `key`. Returns whether a record was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let rewrite = self.rewrite(Some(key), |_| None)?;
        tracing::debug!(key = %key, removed = rewrite.existed, "deleted record");
        Ok(rewrite.existed)
    }

    /// Append an access event to the record's `searched` list.
    ///
    /// Returns the updated record, or `None` when `key` is not stored.
    pub fn record_search(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;
        let rewrite = self.rewrite(Some(key), |existing| {
            existing.map(|record| history::record_search(&record, Utc::now()))
        })?;
        Ok(rewrite.record)
    }

    /// Drop malformed lines and collapse duplicate keys.
    pub fn repair(&self) -> Result<ScanReport> {
        let rewrite = self.rewrite(None, |existing| existing)?;
        tracing::debug!(
            path = %self.path.display(),
            malformed = rewrite.report.malformed,
            duplicates = rewrite.report.duplicates,
            "repaired record file"
        );
        Ok(rewrite.report)
    }

    /// Rescan the backing file and replace the in-memory index.
    pub fn rebuild_index(&self) -> Result<ScanReport> {
        let mut index = self.index_write();
        let _guard = self.lock.shared()?;
        let (fresh, report) = KeyIndex::scan_path(&self.path)?;
        *index = fresh;
        tracing::debug!(path = %self.path.display(), records = report.records, "rebuilt record index");
        Ok(report)
    }

    /// Scan the backing file without touching the index.
    pub fn check(&self) -> Result<ScanReport> {
        let _guard = self.lock.shared()?;
        let (_, report) = KeyIndex::scan_path(&self.path)?;
        Ok(report)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index_read().contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.index_read().keys()
    }

    pub fn len(&self) -> usize {
        self.index_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_read().is_empty()
    }

    fn index_read(&self) -> RwLockReadGuard<'_, KeyIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_write(&self) -> RwLockWriteGuard<'_, KeyIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look `key` up through the current index.
    fn probe(&self, key: &str) -> Result<Probe> {
        let index = self.index_read();
        let _guard = self.lock.shared()?;
        if !index.matches(&self.path)? {
            return Ok(Probe::Stale);
        }
        probe_line(&self.path, &index, key)
    }

    /// Rescan the file and look `key` up without releasing the file lock.
    fn probe_fresh(&self, key: &str) -> Result<Probe> {
        let mut index = self.index_write();
        let _guard = self.lock.shared()?;
        let (fresh, _) = KeyIndex::scan_path(&self.path)?;
        *index = fresh;
        probe_line(&self.path, &index, key)
    }

    /// Drop the corrupt line for `key`.
    ///
    /// The rewrite pass discards every line that does not decode, so a record
    /// that turns out to be valid under the exclusive lock is kept and returned.
    fn heal(&self, key: &str) -> Result<Option<Record>> {
        let rewrite = self.rewrite(Some(key), |existing| existing)?;
        tracing::debug!(
            key = %key,
            kept = rewrite.existed,
            malformed = rewrite.report.malformed,
            "healed record file"
        );
        Ok(rewrite.record)
    }

    /// Rewrite the backing file under the exclusive lock.
    ///
    /// Every line is fully decoded; malformed lines are dropped and duplicate
    /// keys collapse to their last occurrence. When `target` is set, its
    /// current record (if any) is passed to `update` and the returned record
    /// is appended as the last line.
    fn rewrite<F>(&self, target: Option<&str>, update: F) -> Result<Rewrite>
    where
        F: FnOnce(Option<Record>) -> Option<Record>,
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index = self.index_write();
        let _guard = self.lock.exclusive()?;

        let mut lines: Vec<Option<String>> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut existing: Option<Record> = None;
        let mut report = ScanReport::default();

        match fs::File::open(&self.path) {
            Ok(file) => {
                let bytes = scan_lines(BufReader::new(file), |offset, line| {
                    let text = match line {
                        ScannedLine::Text(text) => text,
                        ScannedLine::Unreadable(reason) => {
                            report.malformed += 1;
                            tracing::warn!(offset, reason, "dropping unreadable record line");
                            return;
                        }
                    };
                    match codec::decode(text) {
                        Ok((key, record)) if target == Some(key.as_str()) => {
                            if existing.replace(record).is_some() {
                                report.duplicates += 1;
                            }
                        }
                        Ok((key, _)) => {
                            if let Some(previous) = positions.insert(key, lines.len()) {
                                lines[previous] = None;
                                report.duplicates += 1;
                            }
                            lines.push(Some(text.to_string()));
                        }
                        Err(err) => {
                            report.malformed += 1;
                            tracing::warn!(offset, error = %err, "dropping malformed record line");
                        }
                    }
                })?;
                report.bytes = bytes;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let existed = existing.is_some();
        let record = match target {
            Some(_) => update(existing),
            None => None,
        };
        if let (Some(key), Some(record)) = (target, record.as_ref()) {
            lines.push(Some(codec::encode(key, record)?));
        }
        report.records = lines.iter().flatten().count();

        if existed || record.is_some() || !report.is_clean() {
            write_lines_atomic(&self.path, lines.iter().flatten())?;
        }

        let (fresh, _) = KeyIndex::scan_path(&self.path)?;
        *index = fresh;
        Ok(Rewrite {
            existed,
            record,
            report,
        })
    }
}

fn probe_line(path: &Path, index: &KeyIndex, key: &str) -> Result<Probe> {
    let Some(offset) = index.get(key) else {
        return Ok(Probe::Absent);
    };
    let line = match read_line_at(path, offset)? {
        LineAt::Eof => return Ok(Probe::Moved),
        LineAt::Unreadable => {
            return Ok(Probe::Corrupt(Error::decode(format!(
                "unreadable line at offset {offset}"
            ))));
        }
        LineAt::Text(line) => line,
    };

    Ok(match codec::decode(&line) {
        Ok((found, record)) if found == key => Probe::Found(record),
        Ok((found, _)) => {
            tracing::debug!(key = %key, found = %found, offset, "index offset points at another key");
            Probe::Moved
        }
        Err(err) => Probe::Corrupt(err),
    })
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("record key must not be empty"));
    }
    Ok(())
}

fn secure_open_options() -> OpenOptions {
    let mut opts = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts
}

/// Replace `path` with `lines` via a synced temporary file and rename.
fn write_lines_atomic<'a>(path: &Path, lines: impl Iterator<Item = &'a String>) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        for line in lines {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|err| {
        tracing::warn!(path = %path.display(), error = %err.error, "failed to replace record file");
        Error::Io(Box::new(err.error))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Field, SEARCHED};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn open_store() -> (TempDir, RecordStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path().join("db.jsonl")).expect("open store");
        (dir, store)
    }

    #[test]
    fn open_creates_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("db.jsonl");
        let store = RecordStore::open(&path).expect("open");
        assert!(path.exists());
        assert!(store.is_empty());
        assert_eq!(store.read("ABC123").expect("read"), None);
    }

    #[test]
    fn write_then_read() {
        let (_dir, store) = open_store();
        store
            .write("ABC123", fields(json!({"owner": "John Doe", "model": "Toyota"})))
            .expect("write");
        store
            .write("XYZ789", fields(json!({"owner": "Jane Smith", "model": "Honda"})))
            .expect("write");

        let record = store.read("ABC123").expect("read").expect("present");
        assert_eq!(record.latest("owner"), Some(&json!("John Doe")));
        assert_eq!(record.latest("model"), Some(&json!("Toyota")));
        assert!(record.searched.is_empty());
        assert_eq!(store.keys(), vec!["ABC123".to_string(), "XYZ789".to_string()]);
        assert_eq!(store.read("NONEXISTENT").expect("read"), None);
    }

    #[test]
    fn updating_a_key_moves_it_to_the_end() {
        let (_dir, store) = open_store();
        store.write("A", fields(json!({"n": 1}))).expect("write");
        store.write("B", fields(json!({"n": 1}))).expect("write");
        store.write("A", fields(json!({"colour": "Red"}))).expect("write");

        let content = fs::read_to_string(store.path()).expect("read file");
        let keys: Vec<String> = content
            .lines()
            .map(|line| codec::decode_key(line).expect("key"))
            .collect();
        assert_eq!(keys, vec!["B".to_string(), "A".to_string()]);
        assert!(content.ends_with('\n'));

        let a = store.read("A").expect("read").expect("present");
        assert_eq!(a.latest("n"), Some(&json!(1)));
        assert_eq!(a.latest("colour"), Some(&json!("Red")));
    }

    #[test]
    fn strip_fields_never_reach_disk() {
        let (_dir, store) = open_store();
        store
            .write(
                "ABC123",
                fields(json!({
                    "rfrAndComments": [{"text": "advisory"}],
                    "basicDetails_imageUrl": "https://img.example/a.png",
                    "motTests": [{"result": "PASS", "rfrAndComments": []}]
                })),
            )
            .expect("write");

        let record = store.read("ABC123").expect("read").expect("present");
        assert!(record.field("rfrAndComments").is_none());
        assert!(record.field("basicDetails_imageUrl").is_none());
        assert_eq!(
            record.field("motTests"),
            Some(&Field::Raw(vec![json!({"result": "PASS"})]))
        );
        let content = fs::read_to_string(store.path()).expect("read file");
        assert!(!content.contains("rfrAndComments"));
    }

    #[test]
    fn custom_strip_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = StoreOptions {
            strip_fields: vec!["secret".to_string()],
            ..StoreOptions::default()
        };
        let store = RecordStore::open_with(dir.path().join("db.jsonl"), options).expect("open");
        store
            .write("K", fields(json!({"secret": 1, "rfrAndComments": "kept"})))
            .expect("write");
        let record = store.read("K").expect("read").expect("present");
        assert!(record.field("secret").is_none());
        assert_eq!(record.latest("rfrAndComments"), Some(&json!("kept")));
    }

    #[test]
    fn delete_removes_record_and_index_entry() {
        let (_dir, store) = open_store();
        store.write("DEL111", fields(json!({"note": "To be deleted"}))).expect("write");
        store.write("KEEP", fields(json!({"note": "stays"}))).expect("write");

        assert!(store.delete("DEL111").expect("delete"));
        assert_eq!(store.read("DEL111").expect("read"), None);
        assert!(!store.contains("DEL111"));
        assert!(store.read("KEEP").expect("read").is_some());

        assert!(!store.delete("DEL111").expect("second delete"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let (_dir, store) = open_store();
        assert!(matches!(store.write("", Map::new()), Err(Error::Validation(_))));
        assert!(matches!(store.delete(""), Err(Error::Validation(_))));
    }

    #[test]
    fn record_search_appends_events() {
        let (_dir, store) = open_store();
        assert_eq!(store.record_search("ABC123").expect("search"), None);

        store.write("ABC123", fields(json!({"owner": "A"}))).expect("write");
        let before = store.read("ABC123").expect("read").expect("present");
        for _ in 0..3 {
            store.record_search("ABC123").expect("search");
        }
        let after = store.read("ABC123").expect("read").expect("present");
        assert_eq!(after.search_count(), 3);
        assert_eq!(after.searched[2].value, json!(3));
        assert_eq!(after.updated_at, before.updated_at);
        assert!(after.field(SEARCHED).is_none());
    }

    #[test]
    fn corrupt_line_is_deleted_on_read() {
        let (_dir, store) = open_store();
        store.write("GOOD", fields(json!({"n": 1}))).expect("write");
        store.write("BAD", fields(json!({"n": 2}))).expect("write");

        // Key still parses, record body does not.
        let content = fs::read_to_string(store.path()).expect("read file");
        let damaged: String = content
            .lines()
            .map(|line| {
                if line.starts_with("{\"BAD\"") {
                    "{\"BAD\":{\"created_at\":\"yesterday\"}}\n".to_string()
                } else {
                    format!("{line}\n")
                }
            })
            .collect();
        fs::write(store.path(), damaged).expect("damage file");

        assert_eq!(store.read("BAD").expect("read"), None);
        assert!(!store.contains("BAD"));
        let content = fs::read_to_string(store.path()).expect("read file");
        assert!(!content.contains("BAD"));
        assert!(store.read("GOOD").expect("read").is_some());
    }

    #[test]
    fn repair_drops_garbage_and_duplicates() {
        let (_dir, store) = open_store();
        store.write("A", fields(json!({"n": 1}))).expect("write");
        let line = fs::read_to_string(store.path()).expect("read file");
        fs::write(store.path(), format!("{line}not json\n{line}")).expect("damage file");

        let report = store.check().expect("check");
        assert_eq!(report.malformed, 1);
        assert_eq!(report.duplicates, 1);

        let repaired = store.repair().expect("repair");
        assert_eq!(repaired.malformed, 1);
        assert_eq!(repaired.duplicates, 1);
        assert_eq!(repaired.records, 1);
        assert!(store.check().expect("check").is_clean());
        assert_eq!(fs::read_to_string(store.path()).expect("read file"), line);
    }

    #[test]
    fn clean_delete_of_missing_key_leaves_file_untouched() {
        let (_dir, store) = open_store();
        store.write("A", fields(json!({"n": 1}))).expect("write");
        let before = crate::index::FileStamp::of(store.path()).expect("stamp");
        assert!(!store.delete("B").expect("delete"));
        let after = crate::index::FileStamp::of(store.path()).expect("stamp");
        assert_eq!(before, after);
    }
}
