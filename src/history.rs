//! History merging.
//!
//! Folds a flat field map into a record. Scalar and object values are tracked
//! as change-deduplicated history; list values are stored raw and replaced.

use crate::record::{CREATED_AT, Field, HistoryEntry, Record, SEARCHED, UPDATED_AT};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Merge `fields` into `existing`, returning the updated record.
///
/// `existing` is never modified. `updated_at` is bumped on every call even
/// when no field value changed; a merge is itself a touch.
pub fn merge(existing: Option<&Record>, fields: &Map<String, Value>, now: DateTime<Utc>) -> Record {
    let mut record = existing.cloned().unwrap_or_else(|| Record::new(now));

    for (name, value) in fields {
        match name.as_str() {
            CREATED_AT | UPDATED_AT => {
                tracing::debug!(field = %name, "ignoring store-managed timestamp in merge input");
                continue;
            }
            SEARCHED => {
                match serde_json::from_value::<Vec<HistoryEntry>>(value.clone()) {
                    Ok(searched) => record.searched = searched,
                    Err(err) => {
                        tracing::debug!(error = %err, "ignoring non-history searched value in merge input");
                    }
                }
                continue;
            }
            _ => {}
        }

        if let Value::Array(items) = value {
            record.fields.insert(name.clone(), Field::Raw(items.clone()));
            continue;
        }

        let slot = record
            .fields
            .entry(name.clone())
            .or_insert_with(|| Field::History(Vec::new()));
        match slot {
            Field::History(entries) => append_if_changed(entries, value, now),
            // A field that used to be a list starts a fresh history.
            raw @ Field::Raw(_) => *raw = Field::History(vec![HistoryEntry::new(value.clone(), now)]),
        }
    }

    record.updated_at = existing.map_or(now, |prev| now.max(prev.updated_at));
    record
}

/// Append `value` unless it equals the last recorded value.
fn append_if_changed(entries: &mut Vec<HistoryEntry>, value: &Value, now: DateTime<Utc>) {
    if entries.last().is_some_and(|last| &last.value == value) {
        return;
    }
    entries.push(HistoryEntry::new(value.clone(), now));
}

/// Record one access event on `record`. The event value is the new search count.
pub fn record_search(record: &Record, now: DateTime<Utc>) -> Record {
    let mut record = record.clone();
    let count = record.searched.len() + 1;
    record.searched.push(HistoryEntry::new(Value::from(count), now));
    record
}
