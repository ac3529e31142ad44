//! Source-to-target replication.
//!
//! A [`Replicator`] reads key snapshots from the source through a
//! [`Pipeline`] and writes them to the target with [`KeyValueWrite`].
//! In live mode the notification subscription is opened before the
//! scan starts, so keys changed while the scan runs are replicated
//! again afterwards instead of being missed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{ConnectionConfig, ReaderConfig, WriterConfig};
use crate::error::Result;
use crate::executor::PooledExecutor;
use crate::operation::read::KeyValueRead;
use crate::operation::write::{KeyValueWrite, WriteStatus};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::reader::{KeyNotificationReader, KeySource, MetricsListener, NotificationConfig, ScanKeyReader};
use crate::types::KeyValue;

/// Which keys get replicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// One pass over the existing keyspace.
    #[default]
    Scan,
    /// A scan followed by change capture until stopped.
    Live,
    /// Change capture only.
    LiveOnly,
}

/// Totals for a replication run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Snapshots read from the source.
    pub read: u64,
    pub written: u64,
    pub deleted: u64,
    pub skipped: u64,
    /// One entry per chunk that could not be written and per failed
    /// reader worker.
    pub failures: Vec<String>,
}

impl ReplicationSummary {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Replicator {
    source: ConnectionConfig,
    target: ConnectionConfig,
    reader: ReaderConfig,
    writer: WriterConfig,
    mode: ReplicationMode,
}

impl Replicator {
    pub fn new(
        source: ConnectionConfig,
        target: ConnectionConfig,
        reader: ReaderConfig,
        writer: WriterConfig,
        mode: ReplicationMode,
    ) -> Self {
        Self {
            source,
            target,
            reader,
            writer,
            mode,
        }
    }

    /// Replicates until the keyspace has been copied (scan mode), the
    /// live reader goes idle or is closed, or `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<ReplicationSummary> {
        self.reader.validate()?;
        self.source.validate()?;
        self.target.validate()?;
        tokio::pin!(shutdown);

        let read = KeyValueRead::new(self.reader.mode)
            .mem_usage_limit(self.reader.mem_usage_limit, self.reader.mem_usage_samples);
        let writer = PooledExecutor::new(
            self.target.clone(),
            KeyValueWrite::new().merge(self.writer.merge),
        );
        let options = PipelineOptions::from_reader(&self.reader);
        let mut summary = ReplicationSummary::default();

        // subscribe before scanning so nothing changed mid-scan is lost
        let live = match self.mode {
            ReplicationMode::Scan => None,
            ReplicationMode::Live | ReplicationMode::LiveOnly => {
                let mut reader = KeyNotificationReader::new(NotificationConfig::from_reader(
                    self.source.clone(),
                    &self.reader,
                ));
                reader.add_listener(MetricsListener);
                let source = Arc::new(KeySource::Live(reader));
                source.open().await?;
                Some(source)
            }
        };

        let mut stopped = false;
        if self.mode != ReplicationMode::LiveOnly {
            let scan = KeySource::Scan(ScanKeyReader::from_reader(self.source.clone(), &self.reader));
            let executor = PooledExecutor::new(self.source.clone(), read.clone());
            let pipeline = Pipeline::start(scan, executor, options.clone()).await?;
            info!(source = %self.source.addr(), target = %self.target.addr(), "scan replication started");
            stopped = self
                .drain(&pipeline, &writer, &mut summary, shutdown.as_mut())
                .await;
            let result = if stopped {
                pipeline.close().await
            } else {
                pipeline.join().await
            };
            summary
                .failures
                .extend(result.errors.iter().map(|e| format!("scan reader: {e}")));
            info!(read = summary.read, written = summary.written, "scan replication finished");
        }

        if let Some(source) = live {
            if stopped {
                if let Err(e) = source.close().await {
                    summary.failures.push(format!("live reader: {e}"));
                }
            } else {
                let executor = PooledExecutor::new(self.source.clone(), read);
                let pipeline = Pipeline::start_shared(source, Arc::new(executor), options).await?;
                info!("live replication started");
                self.drain(&pipeline, &writer, &mut summary, shutdown.as_mut())
                    .await;
                let result = pipeline.close().await;
                summary
                    .failures
                    .extend(result.errors.iter().map(|e| format!("live reader: {e}")));
                info!(read = summary.read, written = summary.written, "live replication finished");
            }
        }

        writer.close();
        Ok(summary)
    }

    /// Writes everything the pipeline produces. Returns true when
    /// `shutdown` fired before the pipeline finished.
    async fn drain(
        &self,
        pipeline: &Pipeline<KeyValueRead>,
        writer: &PooledExecutor<KeyValueWrite>,
        summary: &mut ReplicationSummary,
        mut shutdown: std::pin::Pin<&mut impl Future<Output = ()>>,
    ) -> bool {
        let chunk_size = self.reader.chunk_size.max(1);
        loop {
            let first = tokio::select! {
                item = pipeline.read() => item,
                _ = shutdown.as_mut() => return true,
            };
            let Some(first) = first else {
                return false;
            };
            let mut chunk = Vec::with_capacity(chunk_size);
            chunk.push(first);
            chunk.extend(pipeline.read_chunk(chunk_size - 1).await);
            self.write(writer, chunk, summary).await;
        }
    }

    async fn write(
        &self,
        writer: &PooledExecutor<KeyValueWrite>,
        mut chunk: Vec<KeyValue>,
        summary: &mut ReplicationSummary,
    ) {
        let n = chunk.len();
        summary.read += n as u64;
        let mut attempt = 0;
        let mut backoff = self.writer.retry_backoff;
        loop {
            let items = if attempt < self.writer.retry_limit {
                chunk.clone()
            } else {
                std::mem::take(&mut chunk)
            };
            match writer.execute(items).await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome.status {
                            WriteStatus::Written => summary.written += 1,
                            WriteStatus::Deleted => summary.deleted += 1,
                            WriteStatus::Skipped => summary.skipped += 1,
                        }
                    }
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.writer.retry_limit => {
                    attempt += 1;
                    warn!(attempt, keys = n, "write failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(30));
                }
                Err(e) => {
                    error!(keys = n, "write failed: {e}");
                    crate::metrics::record_write_failures(n);
                    summary.failures.push(format!("{n} keys: {e}"));
                    return;
                }
            }
        }
    }
}
