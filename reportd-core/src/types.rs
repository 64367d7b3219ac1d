//! Core domain types for reportd
//!
//! An [`Interaction`] is one report sent by a managed host: an ordered map of
//! string keys to JSON values. The collector never inspects the payload beyond
//! the `hostname` key, which it uses for logging.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Key naming the host an interaction came from.
pub const HOSTNAME_KEY: &str = "hostname";

/// Placeholder used in logs when an interaction has no hostname.
pub const UNKNOWN_HOST: &str = "<unknown>";

/// One reported event flowing from a transport to a storage backend.
///
/// Keys are unique. The underlying map is sorted by key, so two interactions
/// with the same fields encode (and digest) identically regardless of the
/// order the fields were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interaction(Map<String, Value>);

impl Interaction {
    /// Create an empty interaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON object
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Builder-style helper to set the hostname
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.insert(HOSTNAME_KEY, Value::String(hostname.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a field, returning the previous value for that key
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// The reporting host, if the interaction carries a string hostname
    pub fn hostname(&self) -> Option<&str> {
        self.0.get(HOSTNAME_KEY).and_then(Value::as_str)
    }

    /// Hostname for log lines, or [`UNKNOWN_HOST`]
    pub fn label(&self) -> &str {
        self.hostname().unwrap_or(UNKNOWN_HOST)
    }

    /// Hex SHA-256 of the canonical JSON encoding.
    pub fn digest(&self) -> String {
        // Serializing a string-keyed map cannot fail.
        let encoded = serde_json::to_vec(&self.0).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Interaction {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Interaction {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(format!(
                "interaction must be a JSON object, got {}",
                json_kind(&other)
            )),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
