//! Random test data.
//!
//! Fills a store with keys of every supported type so replication and
//! comparison can be exercised without production data. Keys are named
//! `{prefix}:{type}:{index}` with a per-type index, so a run with the
//! same settings and seed reproduces the same keyspace.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::executor::PooledExecutor;
use crate::operation::write::KeyValueWrite;
use crate::time::now_ms;
use crate::types::{DataType, KeyValue, ScoredMember, StreamMessage, Value};

/// What to generate.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub prefix: String,
    /// Total number of keys.
    pub count: usize,
    /// Types to pick from, uniformly.
    pub types: Vec<DataType>,
    /// Element count range for collections, inclusive.
    pub collection_size: (usize, usize),
    /// Byte length range for string values, inclusive.
    pub string_size: (usize, usize),
    /// Score range for sorted-set members.
    pub zset_score: (f64, f64),
    /// When set, every key expires this far in the future, inclusive.
    pub ttl: Option<(Duration, Duration)>,
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            prefix: "gen".into(),
            count: 100,
            types: vec![
                DataType::Hash,
                DataType::List,
                DataType::Set,
                DataType::Stream,
                DataType::String,
                DataType::ZSet,
            ],
            collection_size: (10, 10),
            string_size: (100, 100),
            zset_score: (0.0, 100.0),
            ttl: None,
            seed: None,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.types.is_empty() {
            return Err(Error::Config("at least one data type is required".into()));
        }
        if let Some(t) = self.types.iter().find(|t| !t.is_structured()) {
            return Err(Error::Config(format!("cannot generate {t} values")));
        }
        if self.collection_size.0 == 0 || self.collection_size.0 > self.collection_size.1 {
            return Err(Error::Config("invalid collection size range".into()));
        }
        if self.string_size.0 > self.string_size.1 {
            return Err(Error::Config("invalid string size range".into()));
        }
        if self.zset_score.0 > self.zset_score.1 {
            return Err(Error::Config("invalid score range".into()));
        }
        Ok(())
    }
}

/// Produces random [`KeyValue`]s.
pub struct DataGenerator {
    config: GeneratorConfig,
    rng: StdRng,
    indexes: BTreeMap<DataType, usize>,
    produced: usize,
}

impl DataGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            config,
            rng,
            indexes: BTreeMap::new(),
            produced: 0,
        })
    }

    /// Generates every key and writes it to `target`, `chunk_size` keys
    /// per batch. Returns the number of keys written.
    pub async fn write_to(mut self, target: ConnectionConfig, chunk_size: usize) -> Result<u64> {
        target.validate()?;
        let executor = PooledExecutor::new(target, KeyValueWrite::new());
        let chunk_size = chunk_size.max(1);
        let mut written = 0u64;
        loop {
            let chunk: Vec<KeyValue> = self.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            written += executor.execute(chunk).await?.len() as u64;
        }
        executor.close();
        info!(keys = written, prefix = %self.config.prefix, "generated data");
        Ok(written)
    }

    fn next_key_value(&mut self) -> KeyValue {
        let types = &self.config.types;
        let data_type = types[self.rng.random_range(0..types.len())];
        let index = self.indexes.entry(data_type).or_insert(1);
        let key = format!("{}:{}:{}", self.config.prefix, data_type.as_str(), index);
        *index += 1;

        let value = self.value(data_type);
        let mut kv = KeyValue::new(key, value);
        if let Some((min, max)) = self.config.ttl {
            let (min, max) = (min.as_millis() as i64, max.as_millis() as i64);
            let ttl = self.rng.random_range(min..=max.max(min));
            kv.ttl = Some(now_ms() + ttl);
        }
        kv
    }

    fn cardinality(&mut self) -> usize {
        let (min, max) = self.config.collection_size;
        self.rng.random_range(min..=max)
    }

    fn members(&mut self) -> Vec<Bytes> {
        let n = self.cardinality();
        (0..n).map(|i| Bytes::from(i.to_string())).collect()
    }

    fn value(&mut self, data_type: DataType) -> Value {
        match data_type {
            DataType::String => {
                let (min, max) = self.config.string_size;
                let len = self.rng.random_range(min..=max);
                let s: String = (0..len)
                    .map(|_| self.rng.sample(rand::distr::Alphanumeric) as char)
                    .collect();
                Value::String(Bytes::from(s))
            }
            DataType::List => Value::List(self.members()),
            DataType::Set => Value::Set(self.members().into_iter().collect::<BTreeSet<_>>()),
            DataType::ZSet => {
                let (lo, hi) = self.config.zset_score;
                let members = self.members();
                Value::ZSet(
                    members
                        .into_iter()
                        .map(|m| {
                            let score = if lo == hi { lo } else { self.rng.random_range(lo..hi) };
                            ScoredMember { member: m, score }
                        })
                        .collect(),
                )
            }
            DataType::Stream => {
                let n = self.cardinality();
                let base = now_ms();
                Value::Stream(
                    (0..n)
                        .map(|seq| StreamMessage::new(format!("{base}-{seq}"), sample_fields()))
                        .collect(),
                )
            }
            // validated away; any other type becomes a hash
            _ => Value::Hash(sample_fields().into_iter().collect()),
        }
    }
}

fn sample_fields() -> Vec<(Bytes, Bytes)> {
    vec![
        (Bytes::from_static(b"field1"), Bytes::from_static(b"value1")),
        (Bytes::from_static(b"field2"), Bytes::from_static(b"value2")),
    ]
}

impl Iterator for DataGenerator {
    type Item = KeyValue;

    fn next(&mut self) -> Option<KeyValue> {
        if self.produced >= self.config.count {
            return None;
        }
        self.produced += 1;
        Some(self.next_key_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(count: usize) -> GeneratorConfig {
        GeneratorConfig {
            count,
            seed: Some(7),
            ..GeneratorConfig::default()
        }
    }

    #[test]
    fn produces_count_keys_with_unique_names() {
        let keys: BTreeSet<Bytes> = DataGenerator::new(seeded(60))
            .unwrap()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys.len(), 60);
        assert!(keys.iter().all(|k| k.starts_with(b"gen:")));
    }

    #[test]
    fn same_seed_same_keys() {
        let a: Vec<Bytes> = DataGenerator::new(seeded(20)).unwrap().map(|kv| kv.key).collect();
        let b: Vec<Bytes> = DataGenerator::new(seeded(20)).unwrap().map(|kv| kv.key).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn respects_sizes_and_types() {
        let config = GeneratorConfig {
            types: vec![DataType::List, DataType::String],
            collection_size: (3, 5),
            string_size: (8, 8),
            ..seeded(40)
        };
        for kv in DataGenerator::new(config).unwrap() {
            match kv.value.unwrap() {
                Value::List(items) => assert!((3..=5).contains(&items.len())),
                Value::String(s) => assert_eq!(s.len(), 8),
                other => panic!("unexpected value {other:?}"),
            }
            assert!(kv.ttl.is_none());
        }
    }

    #[test]
    fn ttl_range() {
        let config = GeneratorConfig {
            ttl: Some((Duration::from_secs(60), Duration::from_secs(120))),
            ..seeded(10)
        };
        let now = now_ms();
        for kv in DataGenerator::new(config).unwrap() {
            let ttl = kv.ttl.unwrap();
            assert!(ttl >= now + 60_000 && ttl <= now_ms() + 120_000);
        }
    }

    #[test]
    fn rejects_bad_config() {
        let mut config = GeneratorConfig::default();
        config.types = vec![DataType::Json];
        assert!(DataGenerator::new(config).is_err());
        let config = GeneratorConfig {
            collection_size: (5, 1),
            ..GeneratorConfig::default()
        };
        assert!(DataGenerator::new(config).is_err());
    }
}
