#![no_main]

//! Fuzz harness for opening, reading and rewriting an arbitrary record file.

use libfuzzer_sys::fuzz_target;
use serde_json::{Map, Value};
use tempfile::tempdir;
use vehicle_store::RecordStore;

const MAX_BODY_BYTES: usize = 256 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_BODY_BYTES {
        return;
    }
    let Ok(dir) = tempdir() else {
        return;
    };
    let path = dir.path().join("db.jsonl");
    if std::fs::write(&path, data).is_err() {
        return;
    }
    let Ok(store) = RecordStore::open(&path) else {
        return;
    };

    for key in store.keys() {
        let _ = store.read(&key);
    }

    // Any write leaves a clean file behind.
    let mut fields = Map::new();
    fields.insert("fuzz".to_string(), Value::Bool(true));
    if store.write("FUZZ", fields).is_ok() {
        let report = store.check().expect("check after write");
        assert!(report.is_clean(), "write left problems: {report:?}");
    }
});
