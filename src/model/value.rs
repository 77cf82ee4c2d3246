//! Attribute values
//!
//! Entity attribute bags arrive as untyped JSON. They are lifted into a
//! tagged value so that comparison happens on the semantic type: numbers
//! compare numerically and timestamps compare as instants, whatever textual
//! form the extractor produced. Integers are never routed through `f64`, and
//! timestamps keep the text they arrived as so stored payloads round-trip.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Attribute map keyed by attribute name. Key order carries no meaning.
pub type AttributeMap = BTreeMap<String, AttrValue>;

/// A single attribute value
#[derive(Debug, Clone)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Unsigned values above `i64::MAX` (e.g. MySQL `BIGINT UNSIGNED`)
    UInteger(u64),
    Float(f64),
    Text(String),
    /// Parsed instant plus the original text
    Timestamp(DateTime<Utc>, String),
    List(Vec<AttrValue>),
    Map(AttributeMap),
}

impl AttrValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    /// Convert back to plain JSON
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Null => serde_json::Value::Null,
            AttrValue::Bool(b) => serde_json::Value::Bool(*b),
            AttrValue::Integer(i) => serde_json::Value::from(*i),
            AttrValue::UInteger(u) => serde_json::Value::from(*u),
            AttrValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttrValue::Text(s) => serde_json::Value::String(s.clone()),
            AttrValue::Timestamp(_, raw) => serde_json::Value::String(raw.clone()),
            AttrValue::List(items) => {
                serde_json::Value::Array(items.iter().map(AttrValue::to_json).collect())
            }
            AttrValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Parse the timestamp forms emitted by catalog extractors.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    // Cheap rejection before handing the string to chrono
    let bytes = s.as_bytes();
    if bytes.len() < 19 || !bytes[..4].iter().all(u8::is_ascii_digit) || bytes[4] != b'-' {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    // PostgreSQL text output, e.g. "2024-03-01 10:00:00.123+00"
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

impl From<serde_json::Value> for AttrValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttrValue::Null,
            serde_json::Value::Bool(b) => AttrValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttrValue::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    AttrValue::UInteger(u)
                } else {
                    AttrValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => match parse_timestamp(&s) {
                Some(ts) => AttrValue::Timestamp(ts, s),
                None => AttrValue::Text(s),
            },
            serde_json::Value::Array(items) => {
                AttrValue::List(items.into_iter().map(AttrValue::from).collect())
            }
            serde_json::Value::Object(map) => AttrValue::Map(
                map.into_iter().map(|(k, v)| (k, AttrValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::from(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::from(serde_json::Value::String(s))
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Integer(i)
    }
}

impl From<f64> for AttrValue {
    fn from(f: f64) -> Self {
        AttrValue::Float(f)
    }
}

impl From<u64> for AttrValue {
    fn from(u: u64) -> Self {
        match i64::try_from(u) {
            Ok(i) => AttrValue::Integer(i),
            Err(_) => AttrValue::UInteger(u),
        }
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(ts: DateTime<Utc>) -> Self {
        AttrValue::Timestamp(ts, ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

impl AttrValue {
    /// Exact integer view of an integral value
    fn as_i128(&self) -> Option<i128> {
        match self {
            AttrValue::Integer(i) => Some(i128::from(*i)),
            AttrValue::UInteger(u) => Some(i128::from(*u)),
            _ => None,
        }
    }
}

/// A float equals an integer only when it is integral and exactly that integer.
fn float_equals_integer(float: f64, integer: i128) -> bool {
    // 2^127: beyond this the cast saturates
    const LIMIT: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;
    float.is_finite() && float.fract() == 0.0 && float.abs() < LIMIT && float as i128 == integer
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        use AttrValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Float(f), n) | (n, Float(f)) => match n.as_i128() {
                Some(i) => float_equals_integer(*f, i),
                None => false,
            },
            (Integer(_) | UInteger(_), Integer(_) | UInteger(_)) => {
                self.as_i128() == other.as_i128()
            }
            (Text(a), Text(b)) => a == b,
            (Timestamp(a, _), Timestamp(b, _)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttrValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(AttrValue::from)
    }
}

/// Build an attribute map from a JSON object (anything else yields an empty map).
pub fn attribute_map_from_json(value: serde_json::Value) -> AttributeMap {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (k, AttrValue::from(v)))
            .collect(),
        _ => AttributeMap::new(),
    }
}

/// Render an attribute map as a JSON object.
pub fn attribute_map_to_json(map: &AttributeMap) -> serde_json::Value {
    serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}
