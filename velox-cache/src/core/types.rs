use super::convert::ValueSerializer;
use super::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// Schema-less cached value
///
/// The variant set is closed so the payload format stays exhaustively
/// matchable. Arbitrary `Serialize` data enters through [`Value::from_serialize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Convert any serializable application value into a cache value
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        value.serialize(ValueSerializer)
    }

    /// Convert back into an application type
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(self.clone())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(n) => Some(*n),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Seq(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self::Map(fields)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = CacheError;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        Ok(match json {
            serde_json::Value::Null => Self::Nil,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if n.is_u64() {
                    return Err(CacheError::Serialization(format!(
                        "integer {} does not fit in i64",
                        n
                    )));
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => Self::Seq(
                items
                    .into_iter()
                    .map(Self::try_from)
                    .collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(fields) => Self::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::try_from(v)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(n) => serde_json::Value::from(n),
            // Non-finite floats have no JSON form
            Value::Float(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Seq(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// Named bag of values; the unit the codec serializes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entry(BTreeMap<String, Value>);

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-field entry, the shape every stored cache value takes
    pub fn single(field: impl Into<String>, value: Value) -> Self {
        let mut entry = Self::new();
        entry.insert(field, value);
        entry
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Entry {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Entry {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Outcome of one compaction pass on the embedded store
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CompactionReport {
    /// Share of on-disk bytes estimated reclaimable before the pass
    pub reclaimable_ratio: f64,
    /// Whether a compaction actually ran
    pub compacted: bool,
    /// Total SST bytes before the pass
    pub size_before: u64,
    /// Total SST bytes after the pass
    pub size_after: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Profile {
        name: String,
        age: u32,
        tags: Vec<String>,
    }

    #[test]
    fn test_from_serialize_struct() {
        let profile = Profile {
            name: "ana".to_string(),
            age: 31,
            tags: vec!["admin".to_string()],
        };

        let value = Value::from_serialize(&profile).unwrap();
        let Value::Map(fields) = &value else {
            panic!("expected map, got {:?}", value);
        };
        assert_eq!(fields.get("name"), Some(&Value::from("ana")));
        assert_eq!(fields.get("age"), Some(&Value::Int(31)));

        let back: Profile = value.deserialize_into().unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_from_serialize_rejects_non_string_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "x");

        let err = Value::from_serialize(&map).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_from_serialize_rejects_huge_unsigned() {
        let err = Value::from_serialize(&u64::MAX).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Gauge {
        label: String,
        reading: f64,
    }

    #[test]
    fn test_from_serialize_non_finite_float() {
        let nan = Value::from_serialize(&f64::NAN).unwrap();
        assert!(matches!(nan, Value::Float(n) if n.is_nan()));
        assert!(nan.deserialize_into::<f64>().unwrap().is_nan());

        let inf = Value::from_serialize(&f64::INFINITY).unwrap();
        assert_eq!(inf, Value::Float(f64::INFINITY));
        assert_eq!(inf.deserialize_into::<f64>().unwrap(), f64::INFINITY);

        let seq = Value::from_serialize(&vec![1.0, f64::NEG_INFINITY]).unwrap();
        assert_eq!(
            seq,
            Value::Seq(vec![Value::Float(1.0), Value::Float(f64::NEG_INFINITY)])
        );

        let gauge = Gauge {
            label: "overflow".to_string(),
            reading: f64::INFINITY,
        };
        let back: Gauge = Value::from_serialize(&gauge)
            .unwrap()
            .deserialize_into()
            .unwrap();
        assert_eq!(back, gauge);
    }

    #[test]
    fn test_deserialize_type_mismatch() {
        let value = Value::from("not a number");
        let err = value.deserialize_into::<i64>().unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Nil);
        assert_eq!(Value::from(Some("x")), Value::Str("x".to_string()));
    }

    #[test]
    fn test_entry_single() {
        let entry = Entry::single("k", Value::Bool(true));
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.get("k").and_then(Value::as_bool), Some(true));
    }
}
