//! Configuration for connections, readers, writers and comparisons.
//!
//! Every struct deserializes from TOML with all fields optional; missing
//! fields take the defaults below. Durations are written in milliseconds:
//!
//! ```toml
//! [source]
//! host = "10.0.0.5"
//! command_timeout = 30000
//!
//! [reader]
//! key_pattern = "user:*"
//! chunk_size = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::operation::read::ReadMode;
use crate::reader::stream::AckPolicy;
use crate::types::DataType;

/// Where and how to reach one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Aggregate deadline for all replies of one batch.
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    pub pool_size: usize,
    /// How long to wait for a free pooled connection.
    #[serde(with = "duration_ms")]
    pub pool_acquire_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
            database: 0,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
            pool_size: 8,
            pool_acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port`, for logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::Config("command_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Key source and pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Glob pattern keys must match; all keys when unset.
    pub key_pattern: Option<String>,
    /// Only keys of this type are read.
    pub key_type: Option<DataType>,
    /// COUNT hint passed to SCAN.
    pub scan_count: Option<usize>,
    pub mode: ReadMode,
    pub chunk_size: usize,
    /// Number of chunk workers.
    pub threads: usize,
    /// Capacity of the pipeline's output queue.
    pub queue_capacity: usize,
    /// Capacity of the notification reader's key queue.
    pub notification_queue_capacity: usize,
    /// Period of the live workers' partial-chunk flush.
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
    /// Live readers finish after this long without a notification.
    #[serde(with = "option_duration_ms")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "duration_ms")]
    pub poll_timeout: Duration,
    /// Keys whose MEMORY USAGE exceeds this many bytes are read without
    /// a value. No MEMORY USAGE calls are made when unset.
    pub mem_usage_limit: Option<u64>,
    /// Sample count passed to MEMORY USAGE.
    pub mem_usage_samples: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            key_pattern: None,
            key_type: None,
            scan_count: None,
            mode: ReadMode::Struct,
            chunk_size: 50,
            threads: 1,
            queue_capacity: 10_000,
            notification_queue_capacity: 10_000,
            flush_interval: Duration::from_millis(50),
            idle_timeout: None,
            poll_timeout: Duration::from_millis(100),
            mem_usage_limit: None,
            mem_usage_samples: 0,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".into()));
        }
        if self.threads == 0 {
            return Err(Error::Config("threads must be at least 1".into()));
        }
        if self.queue_capacity == 0 || self.notification_queue_capacity == 0 {
            return Err(Error::Config("queue capacities must be at least 1".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::Config("flush_interval must be positive".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::Config("poll_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Target-side write settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Merge collections into existing target keys instead of replacing
    /// them.
    pub merge: bool,
    /// Extra attempts for chunks that fail with a transient error.
    pub retry_limit: u32,
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            merge: false,
            retry_limit: 0,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Comparison settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    /// Absolute TTL difference tolerated before a key is reported as a
    /// TTL mismatch.
    #[serde(with = "duration_ms")]
    pub ttl_tolerance: Duration,
    /// Compare mismatching keys a second time before reporting them.
    pub recheck: bool,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            ttl_tolerance: Duration::from_millis(100),
            recheck: false,
        }
    }
}

/// Consumer-group reader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub key: String,
    pub group: String,
    pub consumer: String,
    pub ack_policy: AckPolicy,
    /// Id to resume pending-entry recovery after; `0-0` when unset.
    pub offset: Option<String>,
    /// Maximum entries per XREADGROUP.
    pub count: usize,
    /// How long a live read blocks waiting for new entries.
    #[serde(with = "duration_ms")]
    pub block: Duration,
    /// Id the group starts from when it has to be created.
    pub group_start: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            group: String::new(),
            consumer: String::new(),
            ack_policy: AckPolicy::Auto,
            offset: None,
            count: 50,
            block: Duration::from_millis(100),
            group_start: "$".into(),
        }
    }
}

impl StreamConfig {
    pub fn new(key: impl Into<String>, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            consumer: consumer.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() || self.group.is_empty() || self.consumer.is_empty() {
            return Err(Error::Config(
                "stream key, group and consumer are required".into(),
            ));
        }
        if self.count == 0 {
            return Err(Error::Config("stream count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiptideConfig {
    pub source: ConnectionConfig,
    pub target: ConnectionConfig,
    pub reader: ReaderConfig,
    pub writer: WriterConfig,
    pub compare: CompareConfig,
    pub stream: StreamConfig,
}

impl RiptideConfig {
    /// Loads a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Renders the configuration as TOML, e.g. to print a template.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serializes an optional `Duration` as integer milliseconds.
pub mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = RiptideConfig::default();
        assert_eq!(cfg.source.port, 6379);
        assert_eq!(cfg.source.command_timeout, Duration::from_secs(60));
        assert_eq!(cfg.reader.chunk_size, 50);
        assert_eq!(cfg.reader.queue_capacity, 10_000);
        assert_eq!(cfg.reader.poll_timeout, Duration::from_millis(100));
        assert_eq!(cfg.compare.ttl_tolerance, Duration::from_millis(100));
        assert_eq!(cfg.stream.ack_policy, AckPolicy::Auto);
        assert_eq!(cfg.stream.count, 50);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = RiptideConfig::from_toml(
            r#"
            [source]
            host = "10.0.0.5"
            command_timeout = 2500

            [reader]
            key_pattern = "user:*"
            key_type = "hash"
            idle_timeout = 500
            mode = "dump"

            [stream]
            ack_policy = "manual"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.source.host, "10.0.0.5");
        assert_eq!(cfg.source.port, 6379);
        assert_eq!(cfg.source.command_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.reader.key_pattern.as_deref(), Some("user:*"));
        assert_eq!(cfg.reader.key_type, Some(DataType::Hash));
        assert_eq!(cfg.reader.idle_timeout, Some(Duration::from_millis(500)));
        assert_eq!(cfg.reader.mode, ReadMode::Dump);
        assert_eq!(cfg.stream.ack_policy, AckPolicy::Manual);
        assert_eq!(cfg.target, ConnectionConfig::default());
    }

    #[test]
    fn template_parses_back() {
        let mut cfg = RiptideConfig::default();
        cfg.reader.idle_timeout = Some(Duration::from_secs(3));
        let text = cfg.to_toml().unwrap();
        assert_eq!(RiptideConfig::from_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("riptide.toml");
        std::fs::write(&path, "[target]\nport = 6380\n").unwrap();
        let cfg = RiptideConfig::from_file(&path).unwrap();
        assert_eq!(cfg.target.port, 6380);
        assert_eq!(cfg.source.port, 6379);

        let missing = RiptideConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(RiptideConfig::from_toml("[reader]\nkey_type = \"graph\"").is_err());
    }

    #[test]
    fn validation() {
        let mut reader = ReaderConfig::default();
        assert!(reader.validate().is_ok());
        reader.chunk_size = 0;
        assert!(matches!(reader.validate(), Err(Error::Config(_))));

        let reader = ReaderConfig {
            poll_timeout: Duration::ZERO,
            ..ReaderConfig::default()
        };
        assert!(matches!(reader.validate(), Err(Error::Config(_))));

        let mut conn = ConnectionConfig::default();
        conn.pool_size = 0;
        assert!(conn.validate().is_err());

        assert!(StreamConfig::default().validate().is_err());
        assert!(StreamConfig::new("s", "g", "c").validate().is_ok());
    }
}
