//! Consumer-group stream reader.
//!
//! A [`StreamConsumer`] reads a stream as one named consumer of a
//! consumer group. On open it first replays the consumer's pending
//! entries (delivered earlier but never acknowledged) starting after
//! the configured offset, then switches to blocking reads of new
//! entries. Pending entries live in the store, so a consumer that
//! crashed picks up exactly what it had not acknowledged.
//!
//! With [`AckPolicy::Auto`] every delivered entry is acknowledged as it
//! is read, and replayed pending entries are acknowledged and skipped
//! rather than returned. With [`AckPolicy::Manual`] the caller
//! acknowledges with [`StreamConsumer::ack`].

use std::time::Duration;

use riptide_protocol::{Cmd, Frame};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ConnectionConfig, StreamConfig};
use crate::error::{Error, Result};
use crate::operation::read::decode_stream_entries;
use crate::pool::ConnectionPool;
use crate::types::StreamMessage;

/// When delivered entries are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Closed,
    /// Replaying this consumer's pending entries after `offset`.
    Recovering { offset: String },
    /// Reading never-delivered entries.
    Live,
}

pub struct StreamConsumer {
    config: StreamConfig,
    pool: ConnectionPool,
    timeout: Duration,
    phase: Phase,
}

impl StreamConsumer {
    pub fn new(connection: ConnectionConfig, config: StreamConfig) -> Self {
        let timeout = connection.command_timeout;
        Self {
            config,
            pool: ConnectionPool::with_size(1, connection),
            timeout,
            phase: Phase::Closed,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Creates the group (and the stream) if needed and starts pending
    /// recovery.
    pub async fn open(&mut self) -> Result<()> {
        self.config.validate()?;
        let create = Cmd::new("XGROUP")
            .arg("CREATE")
            .arg(self.config.key.as_str())
            .arg(self.config.group.as_str())
            .arg(self.config.group_start.as_str())
            .arg("MKSTREAM");
        match self.send(&create, Duration::ZERO).await {
            Ok(_) => info!(key = %self.config.key, group = %self.config.group, "created consumer group"),
            Err(Error::Command(msg)) if msg.starts_with("BUSYGROUP") => {}
            Err(e) => return Err(e),
        }
        let offset = self
            .config
            .offset
            .clone()
            .unwrap_or_else(|| "0-0".to_string());
        debug!(consumer = %self.config.consumer, %offset, "recovering pending entries");
        self.phase = Phase::Recovering { offset };
        Ok(())
    }

    /// Returns the next entries for this consumer.
    ///
    /// During recovery returns pending entries (manual acknowledgement
    /// only); afterwards waits up to the configured block time for new
    /// entries and returns an empty list when none arrived.
    pub async fn read_messages(&mut self) -> Result<Vec<StreamMessage>> {
        self.read_up_to(self.config.count).await
    }

    /// Like [`read_messages`](Self::read_messages), but asks the store for
    /// at most `max` entries per read. Under [`AckPolicy::Auto`] whatever
    /// is delivered is acknowledged, so a caller that only wants `max`
    /// entries must not read more than that.
    pub async fn read_up_to(&mut self, max: usize) -> Result<Vec<StreamMessage>> {
        let count = max.min(self.config.count).max(1);
        loop {
            match self.phase.clone() {
                Phase::Closed => return Err(Error::Interrupted),
                Phase::Recovering { offset } => {
                    let messages = self.read_group(&offset, count, None).await?;
                    let Some(last) = messages.last().map(|m| m.id.clone()) else {
                        debug!(consumer = %self.config.consumer, "pending entries drained");
                        self.phase = Phase::Live;
                        continue;
                    };
                    self.phase = Phase::Recovering { offset: last };
                    match self.config.ack_policy {
                        AckPolicy::Manual => return Ok(messages),
                        AckPolicy::Auto => {
                            self.ack(&messages).await?;
                        }
                    }
                }
                Phase::Live => {
                    let messages = self.read_group(">", count, Some(self.config.block)).await?;
                    if self.config.ack_policy == AckPolicy::Auto && !messages.is_empty() {
                        self.ack(&messages).await?;
                    }
                    return Ok(messages);
                }
            }
        }
    }

    /// Acknowledges entries, removing them from the pending list.
    /// Returns how many were pending.
    pub async fn ack(&self, messages: &[StreamMessage]) -> Result<u64> {
        if messages.is_empty() {
            return Ok(0);
        }
        let cmd = Cmd::new("XACK")
            .arg(self.config.key.as_str())
            .arg(self.config.group.as_str())
            .args(messages.iter().map(|m| m.id.as_str()));
        let reply = self.send(&cmd, Duration::ZERO).await?;
        let acked = reply
            .as_integer()
            .ok_or_else(|| Error::unexpected("XACK", &reply))?;
        crate::metrics::record_stream_acks(acked as usize);
        Ok(acked.max(0) as u64)
    }

    /// Number of entries delivered to the group but not acknowledged.
    pub async fn pending_count(&self) -> Result<u64> {
        let cmd = Cmd::new("XPENDING")
            .arg(self.config.key.as_str())
            .arg(self.config.group.as_str());
        let reply = self.send(&cmd, Duration::ZERO).await?;
        reply
            .into_array()
            .and_then(|parts| parts.first().and_then(Frame::as_integer))
            .map(|n| n.max(0) as u64)
            .ok_or_else(|| Error::UnexpectedReply {
                command: "XPENDING".into(),
                reply: "missing count".into(),
            })
    }

    /// True while pending entries are still being replayed.
    pub fn is_recovering(&self) -> bool {
        matches!(self.phase, Phase::Recovering { .. })
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.pool.close();
    }

    async fn read_group(
        &self,
        id: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>> {
        let mut cmd = Cmd::new("XREADGROUP")
            .arg("GROUP")
            .arg(self.config.group.as_str())
            .arg(self.config.consumer.as_str())
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            cmd.push("BLOCK");
            cmd.push(block.as_millis() as u64);
        }
        cmd.push("STREAMS");
        cmd.push(self.config.key.as_str());
        cmd.push(id);

        let reply = self.send(&cmd, block.unwrap_or(Duration::ZERO)).await?;
        decode_read_group(reply)
    }

    /// Runs one command on the pooled connection. `extra` extends the
    /// command timeout for blocking reads.
    async fn send(&self, cmd: &Cmd, extra: Duration) -> Result<Frame> {
        let mut guard = self.pool.get().await?;
        let conn = guard.conn().ok_or(Error::Interrupted)?;
        let limit = self.timeout + extra;
        let reply = tokio::time::timeout(limit, conn.send(cmd))
            .await
            .map_err(|_| Error::Timeout(limit));
        match reply {
            Ok(Ok(frame)) => {
                guard.release();
                Ok(frame)
            }
            // the store answered; the connection is still in sync
            Ok(Err(Error::Command(msg))) => {
                guard.release();
                Err(Error::Command(msg))
            }
            Ok(Err(e)) | Err(e) => Err(e),
        }
    }
}

/// XREADGROUP replies `[[key, [entry, ...]]]` (RESP2), `{key: [entry,
/// ...]}` (RESP3), or null when a blocking read timed out.
fn decode_read_group(reply: Frame) -> Result<Vec<StreamMessage>> {
    let streams = match reply {
        Frame::Null => return Ok(Vec::new()),
        Frame::Map(pairs) => pairs.into_iter().map(|(_, entries)| entries).collect(),
        Frame::Array(streams) => {
            let mut out = Vec::with_capacity(streams.len());
            for stream in streams {
                match stream {
                    Frame::Array(mut pair) if pair.len() == 2 => {
                        out.push(pair.pop().unwrap_or(Frame::Null));
                    }
                    other => return Err(Error::unexpected("XREADGROUP", &other)),
                }
            }
            out
        }
        other => return Err(Error::unexpected("XREADGROUP", &other)),
    };

    let mut messages = Vec::new();
    for entries in streams {
        messages.extend(decode_stream_entries(entries.into_array().unwrap_or_default())?);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn entry(id: &str) -> Frame {
        Frame::Array(vec![bulk(id), Frame::Array(vec![bulk("f"), bulk("v")])])
    }

    #[test]
    fn null_reply_is_empty() {
        assert!(decode_read_group(Frame::Null).unwrap().is_empty());
    }

    #[test]
    fn resp2_reply() {
        let reply = Frame::Array(vec![Frame::Array(vec![
            bulk("s"),
            Frame::Array(vec![entry("1-0"), entry("2-0")]),
        ])]);
        let ids: Vec<String> = decode_read_group(reply)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["1-0", "2-0"]);
    }

    #[test]
    fn resp3_reply() {
        let reply = Frame::Map(vec![(bulk("s"), Frame::Array(vec![entry("3-0")]))]);
        let messages = decode_read_group(reply).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "3-0");
    }

    #[test]
    fn malformed_reply() {
        assert!(decode_read_group(Frame::Integer(1)).is_err());
        assert!(decode_read_group(Frame::Array(vec![bulk("s")])).is_err());
    }

    #[tokio::test]
    async fn read_before_open_is_interrupted() {
        let mut consumer = StreamConsumer::new(
            ConnectionConfig::new("127.0.0.1", 1),
            StreamConfig::new("s", "g", "c"),
        );
        assert!(matches!(
            consumer.read_messages().await,
            Err(Error::Interrupted)
        ));
    }
}
