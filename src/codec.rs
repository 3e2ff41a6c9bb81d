//! Line codec for stored records.
//!
//! Each line of the backing file is one compact JSON object with exactly one
//! top-level key (the external key) mapping to the record.

use crate::error::{Error, Result};
use crate::record::Record;
use serde::de::{self, DeserializeOwned, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;

/// Sub-fields dropped from incoming data before merging.
pub const DEFAULT_STRIP_FIELDS: [&str; 2] = ["rfrAndComments", "basicDetails_imageUrl"];

/// Separator used when flattening nested provider payloads.
pub const FLATTEN_SEPARATOR: &str = "_";

struct KeyedRecord<'a> {
    key: &'a str,
    record: &'a Record,
}

impl Serialize for KeyedRecord<'_> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.key, self.record)?;
        map.end()
    }
}

/// `{key: value}` with exactly one entry.
struct SingleEntry<V>(String, V);

impl<'de, V> Deserialize<'de> for SingleEntry<V>
where
    V: DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SingleEntryVisitor<V>(PhantomData<V>);

        impl<'de, V> Visitor<'de> for SingleEntryVisitor<V>
        where
            V: DeserializeOwned,
        {
            type Value = SingleEntry<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object with exactly one key")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let Some(key) = map.next_key::<String>()? else {
                    return Err(de::Error::custom("record line has no key"));
                };
                let value = map.next_value::<V>()?;
                if map.next_key::<IgnoredAny>()?.is_some() {
                    return Err(de::Error::custom("record line has more than one key"));
                }
                Ok(SingleEntry(key, value))
            }
        }

        deserializer.deserialize_map(SingleEntryVisitor(PhantomData))
    }
}

/// Serialize `{key: record}` as one newline-free line.
pub fn encode(key: &str, record: &Record) -> Result<String> {
    Ok(serde_json::to_string(&KeyedRecord { key, record })?)
}

/// Parse a line produced by [`encode`].
pub fn decode(line: &str) -> Result<(String, Record)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let SingleEntry(key, record) = serde_json::from_str::<SingleEntry<Record>>(line)
        .map_err(|err| Error::decode(err.to_string()))?;
    Ok((key, record))
}

/// Read only the leading key of a line, skipping over the record body.
pub fn decode_key(line: &str) -> Result<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let SingleEntry(key, IgnoredAny) = serde_json::from_str::<SingleEntry<IgnoredAny>>(line)
        .map_err(|err| Error::decode(err.to_string()))?;
    Ok(key)
}

/// Remove the default noisy sub-fields from a value tree.
pub fn sanitize(value: Value) -> Value {
    sanitize_with(value, &DEFAULT_STRIP_FIELDS)
}

/// Remove every object entry named in `strip` at any depth, including
/// objects nested inside lists.
pub fn sanitize_with<S: AsRef<str>>(value: Value, strip: &[S]) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_fields(map, strip)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_with(item, strip))
                .collect(),
        ),
        other => other,
    }
}

/// [`sanitize_with`] applied to a top-level field map.
pub fn sanitize_fields<S: AsRef<str>>(fields: Map<String, Value>, strip: &[S]) -> Map<String, Value> {
    fields
        .into_iter()
        .filter(|(name, _)| !strip.iter().any(|s| s.as_ref() == name))
        .map(|(name, value)| (name, sanitize_with(value, strip)))
        .collect()
}

/// Flatten nested objects into `parent{sep}child` keys. Lists are kept as-is.
pub fn flatten_fields(fields: Map<String, Value>, sep: &str) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(&mut out, None, fields, sep);
    out
}

fn flatten_into(out: &mut Map<String, Value>, prefix: Option<&str>, fields: Map<String, Value>, sep: &str) {
    for (name, value) in fields {
        let key = match prefix {
            Some(prefix) => format!("{prefix}{sep}{name}"),
            None => name,
        };
        match value {
            Value::Object(nested) => flatten_into(out, Some(&key), nested, sep),
            other => {
                out.insert(key, other);
            }
        }
    }
}
