//! Recipe arguments
//!
//! Recipes are identified by arbitrary JSON-like structures. [`ArgValue`]
//! restricts them to values with a canonical serialization: map keys are
//! kept in a `BTreeMap`, so two maps with the same content always encode to
//! the same bytes regardless of insertion order.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A hashable recipe argument
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Absent value
    #[default]
    Null,
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Ordered sequence
    List(Vec<ArgValue>),
    /// Map with deterministic key order
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    /// Build a map value from key/value pairs
    pub fn map<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Canonical JSON encoding used for hashing and storage
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization(format!("Failed to encode recipe arguments: {e}")))
    }

    /// Decode a value previously produced by [`ArgValue::to_canonical_json`]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::serialization(format!("Failed to decode recipe arguments: {e}")))
    }

    /// Look up a key when this value is a map
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Borrow the string payload, if any
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is [`ArgValue::Null`]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        // Values beyond i64 keep their magnitude as a float.
        i64::try_from(value).map_or(Self::Float(value as f64), Self::Int)
    }
}

impl From<usize> for ArgValue {
    fn from(value: usize) -> Self {
        Self::from(value as u64)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&Path> for ArgValue {
    fn from(value: &Path) -> Self {
        Self::Str(value.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ArgValue {
    fn from(value: PathBuf) -> Self {
        Self::from(value.as_path())
    }
}

impl<T: Into<Self>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Self>> From<Vec<T>> for ArgValue {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Self>> From<BTreeMap<K, V>> for ArgValue {
    fn from(value: BTreeMap<K, V>) -> Self {
        Self::map(value)
    }
}
