//! Shared fixtures for `vehicle_store` integration tests.

#![allow(dead_code)]

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use vehicle_store::{RecordStore, StoreOptions};

/// Temporary directory holding one record file.
pub struct TestStore {
    temp_dir: TempDir,
    pub store: RecordStore,
}

impl TestStore {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = RecordStore::open_with(temp_dir.path().join("db.jsonl"), test_options())
            .expect("open record store");
        Self { temp_dir, store }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A second, independent handle on the same file, as another process would have.
    pub fn reopen(&self) -> RecordStore {
        RecordStore::open_with(self.path(), test_options()).expect("reopen record store")
    }

    pub fn lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.path())
            .expect("read record file")
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    pub fn data_path(&self) -> PathBuf {
        self.path().to_path_buf()
    }
}

pub fn test_options() -> StoreOptions {
    StoreOptions {
        lock_timeout: Some(Duration::from_secs(5)),
        ..StoreOptions::default()
    }
}

/// Unwrap a `json!({...})` literal into a field map.
pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
