//! riptide-core: moving and verifying data between Redis-compatible stores.
//!
//! Keys come from a [`ScanKeyReader`] (the existing keyspace) or a
//! [`KeyNotificationReader`] (keyspace notifications). A [`Pipeline`]
//! groups them into chunks and runs each chunk through a
//! [`PooledExecutor`], which pipelines an [`Operation`]'s commands over
//! one pooled connection under a single deadline. [`Replicator`] and
//! [`ComparisonEngine`] are built from those pieces; [`StreamConsumer`]
//! reads a stream through a consumer group with recovery of pending
//! entries.

pub mod compare;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod generate;
mod metrics;
pub mod operation;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod reader;
pub mod replicate;
pub mod time;
pub mod types;

pub use compare::{compare, ComparisonEngine, KeyComparison, KeyspaceComparison, Status};
pub use config::{
    CompareConfig, ConnectionConfig, ReaderConfig, RiptideConfig, StreamConfig, WriterConfig,
};
pub use error::{Error, Result};
pub use executor::{Batch, Operation, PooledExecutor, Reply};
pub use generate::{DataGenerator, GeneratorConfig};
pub use operation::{KeyValueRead, KeyValueWrite, ReadMode, WriteOutcome, WriteStatus};
pub use pipeline::{Pipeline, PipelineOptions, PipelineSummary};
pub use pool::{ConnectionPool, PooledConnection};
pub use queue::{InFlightQueue, Offer};
pub use reader::{
    AckPolicy, KeyEvent, KeyEventListener, KeyEventStatus, KeyNotificationReader, KeySource,
    NotificationConfig, ScanKeyReader, StreamConsumer,
};
pub use replicate::{ReplicationMode, ReplicationSummary, Replicator};
pub use types::{DataType, KeyValue, ScoredMember, StreamMessage, Value};
