//! Keyspace comparison between a source and a target store.
//!
//! Keys come from a source [`KeySource`]; each chunk is read from the
//! source through the pipeline's batch and from the target through a
//! second executor, and every key is classified by [`compare`].
//!
//! Comparison is a pure function of two snapshots taken at slightly
//! different times, so a key changing between the two reads can show
//! up as a mismatch. Enabling `recheck` compares mismatching keys once
//! more before reporting them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{CompareConfig, ConnectionConfig, ReaderConfig};
use crate::error::{Error, Result};
use crate::executor::{Batch, Operation, PooledExecutor};
use crate::operation::read::KeyValueRead;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::reader::KeySource;
use crate::types::KeyValue;

/// Classification of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Ok,
    /// Present on the source, absent on the target.
    Missing,
    /// Data types differ (including a key present only on the target).
    Type,
    Value,
    /// Expiries differ by more than the tolerance, or only one side has
    /// one.
    Ttl,
    /// One of the reads failed, so nothing can be said about the key.
    Inconclusive,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Ok,
        Status::Missing,
        Status::Type,
        Status::Value,
        Status::Ttl,
        Status::Inconclusive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Missing => "missing",
            Status::Type => "type",
            Status::Value => "value",
            Status::Ttl => "ttl",
            Status::Inconclusive => "inconclusive",
        }
    }

    /// True for statuses that describe real drift.
    pub fn is_mismatch(&self) -> bool {
        !matches!(self, Status::Ok | Status::Inconclusive)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both snapshots of a key and how they compare.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyComparison {
    pub key: Bytes,
    pub source: Option<KeyValue>,
    pub target: Option<KeyValue>,
    pub status: Status,
    /// Why the comparison was inconclusive.
    pub error: Option<String>,
}

impl KeyComparison {
    fn inconclusive(key: Bytes, error: &Error) -> Self {
        Self {
            key,
            source: None,
            target: None,
            status: Status::Inconclusive,
            error: Some(error.to_string()),
        }
    }
}

/// Classifies a key from its two snapshots.
pub fn compare(source: &KeyValue, target: &KeyValue, ttl_tolerance: Duration) -> Status {
    if !source.exists() {
        return if target.exists() {
            Status::Type
        } else {
            Status::Ok
        };
    }
    if !target.exists() {
        return Status::Missing;
    }
    if source.data_type != target.data_type {
        return Status::Type;
    }
    // values withheld by a memory limit can't be compared
    if let (Some(a), Some(b)) = (&source.value, &target.value) {
        if a != b {
            return Status::Value;
        }
    }
    match (source.ttl, target.ttl) {
        (None, None) => Status::Ok,
        (Some(a), Some(b)) if a.abs_diff(b) <= ttl_tolerance.as_millis() as u64 => Status::Ok,
        _ => Status::Ttl,
    }
}

/// Reads each chunk on both sides and compares key by key.
pub struct CompareOperation {
    read: KeyValueRead,
    target: Arc<PooledExecutor<KeyValueRead>>,
    ttl_tolerance: Duration,
}

impl CompareOperation {
    pub fn new(
        read: KeyValueRead,
        target: Arc<PooledExecutor<KeyValueRead>>,
        ttl_tolerance: Duration,
    ) -> Self {
        Self {
            read,
            target,
            ttl_tolerance,
        }
    }
}

impl Operation for CompareOperation {
    type Input = Bytes;
    type Output = KeyComparison;

    async fn execute(&self, batch: &mut Batch, keys: Vec<Bytes>) -> Result<Vec<KeyComparison>> {
        let (sources, targets) = tokio::join!(
            self.read.execute(batch, keys.clone()),
            self.target.execute(keys.clone())
        );
        let pairs = match (sources, targets) {
            (Ok(s), Ok(t)) => s.into_iter().zip(t),
            (Err(e), _) | (_, Err(e)) => {
                warn!(keys = keys.len(), "comparison read failed: {e}");
                return Ok(keys
                    .into_iter()
                    .map(|key| KeyComparison::inconclusive(key, &e))
                    .collect());
            }
        };
        Ok(pairs
            .map(|(source, target)| KeyComparison {
                key: source.key.clone(),
                status: compare(&source, &target, self.ttl_tolerance),
                source: Some(source),
                target: Some(target),
                error: None,
            })
            .collect())
    }
}

/// Totals for a whole comparison run.
#[derive(Debug, Default)]
pub struct KeyspaceComparison {
    pub counts: BTreeMap<Status, u64>,
    /// Every key whose status is a mismatch or inconclusive.
    pub mismatches: Vec<KeyComparison>,
    /// Worker failures; keys handled by a failed worker are not counted.
    pub errors: Vec<Error>,
}

impl KeyspaceComparison {
    pub fn count(&self, status: Status) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// True when every compared key matched and nothing failed.
    pub fn is_identical(&self) -> bool {
        self.errors.is_empty() && self.count(Status::Ok) == self.total()
    }

    fn record(&mut self, comparison: KeyComparison) {
        *self.counts.entry(comparison.status).or_default() += 1;
        if comparison.status != Status::Ok {
            self.mismatches.push(comparison);
        }
    }
}

/// Streams [`KeyComparison`]s for every key from a source.
pub struct ComparisonEngine {
    pipeline: Pipeline<CompareOperation>,
    recheck: bool,
}

impl ComparisonEngine {
    /// Starts comparing the keys produced by `keys`.
    pub async fn start(
        keys: KeySource,
        source: ConnectionConfig,
        target: ConnectionConfig,
        reader: &ReaderConfig,
        config: &CompareConfig,
    ) -> Result<Self> {
        reader.validate()?;
        source.validate()?;
        target.validate()?;
        let read = KeyValueRead::new(reader.mode)
            .mem_usage_limit(reader.mem_usage_limit, reader.mem_usage_samples);
        let target = Arc::new(PooledExecutor::new(target, read.clone()));
        let operation = CompareOperation::new(read, target, config.ttl_tolerance);
        let executor = PooledExecutor::new(source, operation);
        let pipeline = Pipeline::start(keys, executor, PipelineOptions::from_reader(reader)).await?;
        Ok(Self {
            pipeline,
            recheck: config.recheck,
        })
    }

    /// The next comparison, or `None` when every key has been compared.
    pub async fn next(&self) -> Option<KeyComparison> {
        let mut comparison = self.pipeline.read().await?;
        if self.recheck && comparison.status.is_mismatch() {
            comparison = self.recheck(comparison).await;
        }
        crate::metrics::record_comparison(comparison.status);
        Some(comparison)
    }

    async fn recheck(&self, first: KeyComparison) -> KeyComparison {
        match self.pipeline.executor().execute(vec![first.key.clone()]).await {
            Ok(mut again) if again.len() == 1 => {
                let second = again.remove(0);
                if second.status != first.status {
                    debug!(
                        key = %String::from_utf8_lossy(&second.key),
                        first = %first.status,
                        second = %second.status,
                        "status changed on recheck"
                    );
                }
                second
            }
            Ok(_) => first,
            Err(e) => KeyComparison::inconclusive(first.key, &e),
        }
    }

    /// Compares every key and returns the totals.
    pub async fn run(self) -> KeyspaceComparison {
        let mut report = KeyspaceComparison::default();
        while let Some(comparison) = self.next().await {
            report.record(comparison);
        }
        let summary = self.pipeline.close().await;
        report.errors = summary.errors;
        info!(
            keys = report.total(),
            mismatches = report.mismatches.len(),
            "comparison finished"
        );
        report
    }

    /// Stops early, e.g. to end a live comparison.
    pub async fn close(&self) -> Vec<Error> {
        self.pipeline.close().await.errors
    }

    pub async fn close_source(&self) -> Result<()> {
        self.pipeline.close_source().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    const TOL: Duration = Duration::from_millis(100);

    fn string(key: &str, v: &str) -> KeyValue {
        KeyValue::new(
            Bytes::copy_from_slice(key.as_bytes()),
            Value::String(Bytes::copy_from_slice(v.as_bytes())),
        )
    }

    #[test]
    fn identical() {
        assert_eq!(compare(&string("k", "v"), &string("k", "v"), TOL), Status::Ok);
    }

    #[test]
    fn missing_and_extra() {
        let src = string("k", "v");
        let gone = KeyValue::missing("k");
        assert_eq!(compare(&src, &gone, TOL), Status::Missing);
        assert_eq!(compare(&gone, &src, TOL), Status::Type);
        assert_eq!(compare(&gone, &gone, TOL), Status::Ok);
    }

    #[test]
    fn type_and_value() {
        let list = KeyValue::new("k", Value::List(vec![Bytes::from_static(b"v")]));
        assert_eq!(compare(&string("k", "v"), &list, TOL), Status::Type);
        assert_eq!(compare(&string("k", "v"), &string("k", "w"), TOL), Status::Value);
    }

    #[test]
    fn ttl_tolerance() {
        let a = string("k", "v").with_ttl(10_000);
        assert_eq!(compare(&a, &string("k", "v").with_ttl(10_100), TOL), Status::Ok);
        assert_eq!(compare(&a, &string("k", "v").with_ttl(9_899), TOL), Status::Ttl);
        assert_eq!(compare(&a, &string("k", "v"), TOL), Status::Ttl);
        assert_eq!(compare(&string("k", "v"), &a, TOL), Status::Ttl);
    }

    #[test]
    fn value_mismatch_wins_over_ttl() {
        let a = string("k", "v").with_ttl(1);
        let b = string("k", "w");
        assert_eq!(compare(&a, &b, TOL), Status::Value);
    }

    #[test]
    fn withheld_values_compare_metadata_only() {
        let mut a = string("k", "v");
        a.value = None;
        assert_eq!(compare(&a, &string("k", "w"), TOL), Status::Ok);
    }

    #[test]
    fn report_totals() {
        let mut report = KeyspaceComparison::default();
        let ok = KeyComparison {
            key: Bytes::from_static(b"a"),
            source: None,
            target: None,
            status: Status::Ok,
            error: None,
        };
        let mut ttl = ok.clone();
        ttl.status = Status::Ttl;
        report.record(ok.clone());
        report.record(ok);
        report.record(ttl);
        assert_eq!(report.total(), 3);
        assert_eq!(report.count(Status::Ok), 2);
        assert_eq!(report.count(Status::Ttl), 1);
        assert_eq!(report.mismatches.len(), 1);
        assert!(!report.is_identical());
        assert!(Status::Ttl.is_mismatch());
        assert!(!Status::Inconclusive.is_mismatch());
    }
}
