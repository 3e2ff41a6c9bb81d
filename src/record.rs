//! Record data model.
//!
//! A record is a mapping from field name to either a history list of
//! `{value, created_at}` entries or a raw list stored verbatim, plus three
//! reserved fields maintained by the store (`created_at`, `updated_at`,
//! `searched`).

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const SEARCHED: &str = "searched";

/// Field names the store manages itself.
pub const RESERVED_FIELDS: [&str; 3] = [CREATED_AT, UPDATED_AT, SEARCHED];

/// One observed value of a field and when it was first seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryEntry {
    pub value: Value,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub const fn new(value: Value, created_at: DateTime<Utc>) -> Self {
        Self { value, created_at }
    }

    /// Read a stored list element as a history entry.
    ///
    /// The element must be exactly `{value, created_at}`. A timestamp with an
    /// offset must already be in the form this crate writes; anything else is
    /// list data and stays raw. Offset-less timestamps are legacy entries.
    fn from_value(item: &Value) -> Option<Self> {
        let obj = item.as_object()?;
        if obj.len() != 2 {
            return None;
        }
        let value = obj.get("value")?;
        let text = obj.get(CREATED_AT)?.as_str()?;
        let created_at = match timestamp::parse_legacy(text) {
            Some(created_at) => created_at,
            None => {
                let created_at = DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc);
                if timestamp::format(&created_at) != text {
                    return None;
                }
                created_at
            }
        };
        Some(Self::new(value.clone(), created_at))
    }
}

/// RFC 3339 timestamps, written in UTC with `Z`.
///
/// Reading also accepts offset-less ISO 8601 text (`2024-05-01T10:00:00.123456`)
/// as UTC, which is how older record files stored every timestamp.
mod timestamp {
    use super::{DateTime, Deserialize, Deserializer, NaiveDateTime, SecondsFormat, Serializer, Utc};

    const LEGACY_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub(super) fn format(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    pub(super) fn parse_legacy(text: &str) -> Option<DateTime<Utc>> {
        LEGACY_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub(super) fn parse(text: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|at| at.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_legacy(text))
    }

    pub(super) fn serialize<S>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(at))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid timestamp {text:?}"))
        })
    }
}

/// Stored representation of a non-reserved field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Field {
    /// Change-deduplicated history, oldest first.
    History(Vec<HistoryEntry>),
    /// A list value stored verbatim and replaced on every merge.
    Raw(Vec<Value>),
}

impl Field {
    /// Classify a stored JSON array.
    ///
    /// A non-empty array whose every element is exactly `{value, created_at}`
    /// is a history list; anything else is raw.
    pub fn from_items(items: Vec<Value>) -> Self {
        if items.is_empty() {
            return Self::Raw(items);
        }
        let history: Option<Vec<HistoryEntry>> = items.iter().map(HistoryEntry::from_value).collect();
        match history {
            Some(entries) => Self::History(entries),
            None => Self::Raw(items),
        }
    }

    /// Most recent value of a history list. Raw lists have no history.
    pub fn latest(&self) -> Option<&Value> {
        match self {
            Self::History(entries) => entries.last().map(|entry| &entry.value),
            Self::Raw(_) => None,
        }
    }

    pub fn history(&self) -> Option<&[HistoryEntry]> {
        match self {
            Self::History(entries) => Some(entries),
            Self::Raw(_) => None,
        }
    }

    /// Current value as plain JSON: last history value, or the raw list itself.
    pub fn current_value(&self) -> Value {
        match self {
            Self::History(entries) => entries
                .last()
                .map_or(Value::Null, |entry| entry.value.clone()),
            Self::Raw(items) => Value::Array(items.clone()),
        }
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = Vec::<Value>::deserialize(deserializer)?;
        Ok(Self::from_items(items))
    }
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub searched: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Field>,
}

impl Record {
    /// Empty record first written at `now`.
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            searched: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn latest(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).and_then(Field::latest)
    }

    /// Number of recorded access events.
    pub fn search_count(&self) -> usize {
        self.searched.len()
    }

    /// Flat view of the record with every field at its current value.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut out: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, field)| (name.clone(), field.current_value()))
            .collect();
        out.insert(CREATED_AT.to_string(), Value::String(timestamp::format(&self.created_at)));
        out.insert(UPDATED_AT.to_string(), Value::String(timestamp::format(&self.updated_at)));
        out.insert(SEARCHED.to_string(), Value::from(self.searched.len()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn history_shaped_arrays_decode_as_history() {
        let field: Field = serde_json::from_value(json!([
            {"value": "Red", "created_at": "2024-05-01T10:00:00Z"},
            {"value": "Blue", "created_at": "2024-06-01T10:00:00Z"}
        ]))
        .expect("decode field");
        let entries = field.history().expect("history list");
        assert_eq!(entries.len(), 2);
        assert_eq!(field.latest(), Some(&json!("Blue")));
    }

    #[test]
    fn other_arrays_decode_as_raw() {
        let field: Field =
            serde_json::from_value(json!([{"value": 1}, {"value": 2}])).expect("decode field");
        assert_eq!(field, Field::Raw(vec![json!({"value": 1}), json!({"value": 2})]));

        let extra_key: Field = serde_json::from_value(json!([
            {"value": 1, "created_at": "2024-05-01T10:00:00Z", "source": "dvsa"}
        ]))
        .expect("decode field");
        assert!(matches!(extra_key, Field::Raw(_)));

        let empty: Field = serde_json::from_value(json!([])).expect("decode field");
        assert_eq!(empty, Field::Raw(Vec::new()));
    }

    #[test]
    fn non_array_field_is_rejected() {
        let err = serde_json::from_value::<Field>(json!("John Doe"));
        assert!(err.is_err());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = Record::new(at(0));
        record.updated_at = at(60);
        record.searched.push(HistoryEntry::new(json!(1), at(30)));
        record.fields.insert(
            "owner".to_string(),
            Field::History(vec![HistoryEntry::new(json!("John Doe"), at(0))]),
        );
        record
            .fields
            .insert("keepers".to_string(), Field::Raw(vec![json!("a"), json!(2)]));

        let text = serde_json::to_string(&record).expect("encode");
        let back: Record = serde_json::from_str(&text).expect("decode");
        assert_eq!(back, record);
    }

    #[test]
    fn missing_searched_defaults_to_empty() {
        let record: Record = serde_json::from_value(json!({
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        }))
        .expect("decode");
        assert!(record.searched.is_empty());
        assert!(record.fields.is_empty());
    }

    #[test]
    fn snapshot_flattens_current_values() {
        let mut record = Record::new(at(0));
        record.fields.insert(
            "colour".to_string(),
            Field::History(vec![
                HistoryEntry::new(json!("Red"), at(0)),
                HistoryEntry::new(json!("Blue"), at(10)),
            ]),
        );
        record
            .fields
            .insert("tags".to_string(), Field::Raw(vec![json!("import")]));

        let snapshot = record.snapshot();
        assert_eq!(snapshot["colour"], json!("Blue"));
        assert_eq!(snapshot["tags"], json!(["import"]));
        assert_eq!(snapshot[SEARCHED], json!(0));
    }

    #[test]
    fn list_with_foreign_timestamps_stays_raw() {
        let items = vec![json!({"value": 1, "created_at": "2024-01-01T00:00:00+01:00"})];
        let field: Field = serde_json::from_value(Value::Array(items.clone())).expect("decode field");
        assert_eq!(field, Field::Raw(items.clone()));
        assert_eq!(serde_json::to_value(&field).expect("encode"), Value::Array(items));

        let padded: Field = serde_json::from_value(json!([
            {"value": 1, "created_at": "2024-01-01T00:00:00.000Z"}
        ]))
        .expect("decode field");
        assert!(matches!(padded, Field::Raw(_)));
    }

    #[test]
    fn offset_less_timestamps_are_read_as_utc() {
        let record: Record = serde_json::from_value(json!({
            "created_at": "2024-05-01T10:00:00.123456",
            "updated_at": "2024-05-02T08:00:00",
            "searched": [{"value": 1, "created_at": "2024-05-02T08:00:00"}],
            "owner": [{"value": "John Doe", "created_at": "2024-05-01T10:00:00.120000"}]
        }))
        .expect("decode legacy record");

        let created = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("date")
            + chrono::Duration::microseconds(123_456);
        assert_eq!(record.created_at, created);
        assert_eq!(record.search_count(), 1);
        assert_eq!(record.latest("owner"), Some(&json!("John Doe")));

        let text = serde_json::to_string(&record).expect("encode");
        assert!(text.contains(r#""created_at":"2024-05-01T10:00:00.123456Z""#));
        let back: Record = serde_json::from_str(&text).expect("decode");
        assert_eq!(back, record);
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        let err = serde_json::from_value::<Record>(json!({
            "created_at": "yesterday",
            "updated_at": "2024-05-01T10:00:00Z"
        }));
        assert!(err.is_err());
    }
}
