//! Key and value representations shared by readers, writers and the
//! comparator.
//!
//! A [`KeyValue`] is a snapshot of one key taken from a store: its type,
//! its value (typed, or an opaque DUMP payload), its absolute expiry and
//! optionally its memory footprint. Snapshots are immutable once built.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Data type of a key, as reported by TYPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// The key does not exist.
    None,
    String,
    List,
    Set,
    #[serde(rename = "zset")]
    ZSet,
    Hash,
    Stream,
    /// RedisJSON documents. Read as type only.
    Json,
    /// RedisTimeSeries keys. Read as type only.
    TimeSeries,
    /// Anything else a module may register.
    Unknown,
}

impl DataType {
    /// Maps a TYPE reply (or a user-supplied type name) to a variant.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "none" => DataType::None,
            "string" => DataType::String,
            "list" => DataType::List,
            "set" => DataType::Set,
            "zset" => DataType::ZSet,
            "hash" => DataType::Hash,
            "stream" => DataType::Stream,
            "rejson-rl" | "json" => DataType::Json,
            "tsdb-type" | "timeseries" => DataType::TimeSeries,
            _ => DataType::Unknown,
        }
    }

    /// The name the store uses for this type (what TYPE and SCAN TYPE use).
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::None => "none",
            DataType::String => "string",
            DataType::List => "list",
            DataType::Set => "set",
            DataType::ZSet => "zset",
            DataType::Hash => "hash",
            DataType::Stream => "stream",
            DataType::Json => "ReJSON-RL",
            DataType::TimeSeries => "TSDB-TYPE",
            DataType::Unknown => "unknown",
        }
    }

    /// Whether riptide can read and write values of this type
    /// structurally. Other types can still move as DUMP payloads.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            DataType::String
                | DataType::List
                | DataType::Set
                | DataType::ZSet
                | DataType::Hash
                | DataType::Stream
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match DataType::from_name(s) {
            DataType::Unknown => Err(format!(
                "unknown data type '{s}'. valid options: string, list, set, zset, hash, stream, json, timeseries"
            )),
            t => Ok(t),
        }
    }
}

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: Bytes,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<Bytes>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// One entry of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Entry id, e.g. `1700000000000-0`.
    pub id: String,
    /// Field/value pairs in insertion order.
    pub fields: Vec<(Bytes, Bytes)>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>, fields: Vec<(Bytes, Bytes)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// The value of a key.
///
/// Sets and hashes use ordered collections so that two snapshots with the
/// same members compare equal regardless of the order the store returned
/// them in. Lists and streams keep store order, which is significant.
#[derive(Debug, Clone)]
pub enum Value {
    String(Bytes),
    List(Vec<Bytes>),
    Set(BTreeSet<Bytes>),
    /// Members in the order ZRANGE returned them (ascending score).
    ZSet(Vec<ScoredMember>),
    Hash(BTreeMap<Bytes, Bytes>),
    Stream(Vec<StreamMessage>),
    /// Serialized payload from DUMP, restorable with RESTORE.
    Dump(Bytes),
}

impl Value {
    /// The data type this value belongs to. Dumps carry no type of their own.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::String(_) => Some(DataType::String),
            Value::List(_) => Some(DataType::List),
            Value::Set(_) => Some(DataType::Set),
            Value::ZSet(_) => Some(DataType::ZSet),
            Value::Hash(_) => Some(DataType::Hash),
            Value::Stream(_) => Some(DataType::Stream),
            Value::Dump(_) => None,
        }
    }

    /// Number of elements (1 for strings and dumps).
    pub fn len(&self) -> usize {
        match self {
            Value::String(_) | Value::Dump(_) => 1,
            Value::List(v) => v.len(),
            Value::Set(v) => v.len(),
            Value::ZSet(v) => v.len(),
            Value::Hash(v) => v.len(),
            Value::Stream(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::ZSet(a), Value::ZSet(b)) => zset_eq(a, b),
            (Value::Hash(a), Value::Hash(b)) => a == b,
            (Value::Stream(a), Value::Stream(b)) => a == b,
            (Value::Dump(a), Value::Dump(b)) => a == b,
            _ => false,
        }
    }
}

/// Sorted sets are equal when they map the same members to the same
/// scores. Ties in score can come back in either order, so positions
/// are not compared.
fn zset_eq(a: &[ScoredMember], b: &[ScoredMember]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let scores: HashMap<&Bytes, f64> = a.iter().map(|m| (&m.member, m.score)).collect();
    b.iter()
        .all(|m| scores.get(&m.member).is_some_and(|s| *s == m.score))
}

/// Snapshot of a single key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: Bytes,
    pub data_type: DataType,
    /// `None` when the key is missing, when its type can't be read
    /// structurally, or when it exceeded the memory-usage limit.
    pub value: Option<Value>,
    /// Absolute expiry in unix milliseconds; `None` for persistent keys.
    pub ttl: Option<i64>,
    /// Bytes reported by MEMORY USAGE, when it was requested.
    pub mem_usage: Option<u64>,
}

impl KeyValue {
    pub fn new(key: impl Into<Bytes>, value: Value) -> Self {
        let data_type = value.data_type().unwrap_or(DataType::Unknown);
        Self {
            key: key.into(),
            data_type,
            value: Some(value),
            ttl: None,
            mem_usage: None,
        }
    }

    /// Snapshot of a key that does not exist.
    pub fn missing(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            data_type: DataType::None,
            value: None,
            ttl: None,
            mem_usage: None,
        }
    }

    pub fn with_ttl(mut self, expire_at_ms: i64) -> Self {
        self.ttl = Some(expire_at_ms);
        self
    }

    pub fn exists(&self) -> bool {
        self.data_type != DataType::None
    }

    /// True when the snapshot carries an expiry that is already past.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl.is_some_and(|t| t <= now_ms)
    }

    /// The key rendered for logs and reports.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(members: &[&str]) -> Value {
        Value::Set(members.iter().map(|m| Bytes::copy_from_slice(m.as_bytes())).collect())
    }

    #[test]
    fn type_names_round_trip() {
        for t in [
            DataType::String,
            DataType::List,
            DataType::Set,
            DataType::ZSet,
            DataType::Hash,
            DataType::Stream,
            DataType::Json,
            DataType::TimeSeries,
        ] {
            assert_eq!(DataType::from_name(t.as_str()), t);
        }
        assert_eq!(DataType::from_name("ZSET"), DataType::ZSet);
        assert_eq!(DataType::from_name("graphdata"), DataType::Unknown);
        assert!("nope".parse::<DataType>().is_err());
    }

    #[test]
    fn set_equality_ignores_order() {
        assert_eq!(set(&["a", "b", "c"]), set(&["c", "a", "b"]));
        assert_ne!(set(&["a", "b"]), set(&["a", "b", "c"]));
    }

    #[test]
    fn list_equality_is_ordered() {
        let a = Value::List(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
        let b = Value::List(vec![Bytes::from_static(b"2"), Bytes::from_static(b"1")]);
        assert_ne!(a, b);
    }

    #[test]
    fn zset_equality_by_member_score() {
        let a = Value::ZSet(vec![ScoredMember::new("x", 1.0), ScoredMember::new("y", 1.0)]);
        let b = Value::ZSet(vec![ScoredMember::new("y", 1.0), ScoredMember::new("x", 1.0)]);
        let c = Value::ZSet(vec![ScoredMember::new("x", 1.0), ScoredMember::new("y", 2.0)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn different_variants_never_equal() {
        let s = Value::String(Bytes::from_static(b"a"));
        let l = Value::List(vec![Bytes::from_static(b"a")]);
        assert_ne!(s, l);
    }

    #[test]
    fn key_value_expiry() {
        let kv = KeyValue::new("k", Value::String(Bytes::from_static(b"v"))).with_ttl(1_000);
        assert!(kv.is_expired(1_000));
        assert!(!kv.is_expired(999));
        assert!(!KeyValue::missing("k").exists());
        assert_eq!(kv.data_type, DataType::String);
    }
}
