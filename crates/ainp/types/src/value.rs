use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tagged payload value: the canonical form of open wire maps.
///
/// Envelope payloads and negotiation `custom_terms` are open maps on the
/// wire. Representing them as this sum type keeps persistence and signing
/// loss-free: maps are ordered (`BTreeMap`), so serialization is stable and
/// canonical bytes are reproducible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaggedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<TaggedValue>),
    Map(BTreeMap<String, TaggedValue>),
}

impl TaggedValue {
    /// Empty map value.
    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, TaggedValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Fetch a key from a map value.
    pub fn get(&self, key: &str) -> Option<&TaggedValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl Default for TaggedValue {
    fn default() -> Self {
        Self::Null
    }
}

impl From<serde_json::Value> for TaggedValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<TaggedValue> for serde_json::Value {
    fn from(value: TaggedValue) -> Self {
        match value {
            TaggedValue::Null => serde_json::Value::Null,
            TaggedValue::Bool(b) => serde_json::Value::Bool(b),
            TaggedValue::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            TaggedValue::String(s) => serde_json::Value::String(s),
            TaggedValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Self::from).collect())
            }
            TaggedValue::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}
