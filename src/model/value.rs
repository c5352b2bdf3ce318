use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered mapping backing [`Value::Object`].
///
/// Insertion order is preserved end to end so that the same normalization
/// steps, run in the same order, always produce byte-identical serialized
/// output — the property the change detector's fingerprint relies on.
pub type Map = IndexMap<String, Value>;

/// A dynamically-typed, order-preserving value tree.
///
/// The registry accepts many optional fields the engine never interprets;
/// rather than model the payload as a closed record, normalization works
/// over this tagged-variant tree and forwards whatever it doesn't
/// recognize verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    String(String),
    Array(Vec<Value>),
    Object(Map),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(i: impl Into<i64>) -> Self {
        Value::Integer(i.into())
    }

    pub fn object() -> Self {
        Value::Object(Map::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the nested value at a dotted path (e.g. `connect.sidecar_service`),
    /// descending through `Object` variants only.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = self;
        for segment in path {
            cur = cur.as_object()?.get(*segment)?;
        }
        Some(cur)
    }

    /// Ensures an `Object` exists at the dotted path, creating empty
    /// objects along the way, and returns a mutable reference to it.
    pub fn ensure_object_path(&mut self, path: &[&str]) -> &mut Map {
        let mut cur = self;
        for segment in path {
            let slot = cur
                .as_object_mut()
                .expect("ensure_object_path called on a non-object")
                .entry((*segment).to_string())
                .or_insert_with(Value::object);
            if !matches!(slot, Value::Object(_)) {
                *slot = Value::object();
            }
            cur = slot;
        }
        cur.as_object_mut().unwrap()
    }

    /// Canonical serialized form used both for registry dispatch and for
    /// fingerprinting. Because `Map` preserves insertion order and we
    /// serialize straight from this tree (never via an intermediate
    /// `serde_json::Value`), the same normalized payload always produces
    /// the same bytes.
    pub fn to_canonical_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Value serialization is infallible")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}
