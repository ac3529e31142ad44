//! Key sources and the stream consumer.

pub mod notification;
pub mod scan;
pub mod stream;

use bytes::Bytes;

use crate::error::Result;

pub use notification::{
    KeyEvent, KeyEventListener, KeyEventStatus, KeyNotificationReader, MetricsListener,
    NotificationConfig,
};
pub use scan::ScanKeyReader;
pub use stream::{AckPolicy, StreamConsumer};

/// Where a pipeline gets its keys from.
pub enum KeySource {
    /// Every key currently in the store, once.
    Scan(ScanKeyReader),
    /// Keys as they change, until closed or idle.
    Live(KeyNotificationReader),
}

impl KeySource {
    /// Prepares the source. Safe to call more than once.
    pub async fn open(&self) -> Result<()> {
        match self {
            KeySource::Scan(_) => Ok(()),
            KeySource::Live(reader) => reader.open().await,
        }
    }

    /// Next key, or `None` when the source is exhausted.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        match self {
            KeySource::Scan(reader) => reader.read().await,
            KeySource::Live(reader) => reader.read().await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            KeySource::Scan(reader) => {
                reader.close().await;
                Ok(())
            }
            KeySource::Live(reader) => reader.close(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, KeySource::Live(_))
    }
}

impl From<ScanKeyReader> for KeySource {
    fn from(reader: ScanKeyReader) -> Self {
        KeySource::Scan(reader)
    }
}

impl From<KeyNotificationReader> for KeySource {
    fn from(reader: KeyNotificationReader) -> Self {
        KeySource::Live(reader)
    }
}
