//! Cached vehicle lookups on top of the record store.
//!
//! A [`VehicleLookup`] serves a stored record while it is younger than the
//! freshness window and otherwise asks every [`FieldSource`] for new data,
//! merges it into the store, and returns the updated record.

use crate::codec::{FLATTEN_SEPARATOR, flatten_fields};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::store::RecordStore;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Upstream provider of field data for a key.
pub trait FieldSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fields known for `key`. Nested objects are flattened by the caller.
    fn fetch(&self, key: &str) -> Result<Map<String, Value>>;
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Cached(Record),
    Refreshed(Record),
}

impl Lookup {
    pub const fn record(&self) -> &Record {
        match self {
            Self::Cached(record) | Self::Refreshed(record) => record,
        }
    }

    pub fn into_record(self) -> Record {
        match self {
            Self::Cached(record) | Self::Refreshed(record) => record,
        }
    }

    pub const fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }
}

pub struct VehicleLookup {
    store: Arc<RecordStore>,
    sources: Vec<Box<dyn FieldSource>>,
    max_age: Duration,
    track_searches: bool,
}

impl VehicleLookup {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            sources: Vec::new(),
            max_age: Duration::from_secs(24 * 60 * 60),
            track_searches: false,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl FieldSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Append an access event to `searched` on every lookup.
    #[must_use]
    pub fn with_search_tracking(mut self, enabled: bool) -> Self {
        self.track_searches = enabled;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Stored record for `raw_key` if fresh, otherwise a refreshed one.
    pub fn get(&self, raw_key: &str) -> Result<Lookup> {
        let key = canonical_key(raw_key)?;
        if let Some(record) = self.store.read(&key)? {
            if self.is_fresh(&record) {
                tracing::debug!(key = %key, updated_at = %record.updated_at, "serving cached record");
                return Ok(Lookup::Cached(self.track(&key, record)?));
            }
        }
        self.refresh_canonical(&key).map(Lookup::Refreshed)
    }

    /// Fetch from every source and merge into the store regardless of age.
    pub fn refresh(&self, raw_key: &str) -> Result<Record> {
        let key = canonical_key(raw_key)?;
        self.refresh_canonical(&key)
    }

    fn refresh_canonical(&self, key: &str) -> Result<Record> {
        let fields = self.fetch_all(key)?;
        self.store.write(key, fields)?;
        let record = self.store.read(key)?.ok_or_else(|| {
            Error::validation(format!("record for {key} vanished right after it was written"))
        })?;
        self.track(key, record)
    }

    fn fetch_all(&self, key: &str) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        for source in &self.sources {
            let fetched = source.fetch(key).map_err(|err| match err {
                err @ Error::Source { .. } => err,
                other => Error::upstream(source.name(), other.to_string()),
            })?;
            tracing::debug!(key = %key, source = source.name(), fields = fetched.len(), "fetched fields");
            fields.extend(flatten_fields(fetched, FLATTEN_SEPARATOR));
        }
        Ok(fields)
    }

    fn is_fresh(&self, record: &Record) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(self.max_age) else {
            return true;
        };
        Utc::now().signed_duration_since(record.updated_at) < max_age
    }

    fn track(&self, key: &str, record: Record) -> Result<Record> {
        if !self.track_searches {
            return Ok(record);
        }
        Ok(self.store.record_search(key)?.unwrap_or(record))
    }
}

/// Normalize a registration: whitespace removed, upper-cased.
pub fn canonical_key(raw: &str) -> Result<String> {
    let key: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();
    if key.is_empty() {
        return Err(Error::validation(format!("{raw:?} is not a usable key")));
    }
    Ok(key)
}
