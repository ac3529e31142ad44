//! Async TCP connection to a Redis-compatible store.
//!
//! A [`Connection`] buffers outgoing commands until [`Connection::flush`],
//! which is what makes pipelining work: queue N commands, flush once,
//! then read N replies in order. A connection can also be turned into a
//! [`Subscriber`] that receives pattern-subscription messages.

use bytes::{Bytes, BytesMut};
use riptide_protocol::{parse_frame, Cmd, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Initial capacity of the read and write buffers.
const BUF_SIZE: usize = 16 * 1024;

/// A TCP connection with read/write buffering.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    /// Dials the store, then runs AUTH and SELECT as configured.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let addr = config.addr();
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| Error::Connection(format!("connect to {addr} timed out")))?
        .map_err(|e| Error::Connection(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(BUF_SIZE),
            write_buf: BytesMut::with_capacity(BUF_SIZE),
        };

        if let Some(password) = &config.password {
            conn.send(&Cmd::new("AUTH").arg(password.as_str()))
                .await
                .map_err(|e| Error::Connection(format!("authentication failed: {e}")))?;
        }
        if config.database != 0 {
            conn.send(&Cmd::new("SELECT").arg(config.database)).await?;
        }

        debug!(%addr, db = config.database, "connected");
        Ok(conn)
    }

    /// Appends a command to the write buffer without sending it.
    pub fn queue(&mut self, cmd: &Cmd) {
        cmd.serialize(&mut self.write_buf);
    }

    /// Writes every queued command to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Reads one complete reply.
    ///
    /// Cancel-safe: bytes read before a cancellation stay buffered and
    /// the next call picks up where this one stopped.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if !self.read_buf.is_empty() {
                if let Some((frame, consumed)) = parse_frame(&self.read_buf)? {
                    let _ = self.read_buf.split_to(consumed);
                    return Ok(frame);
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::Disconnected);
            }
        }
    }

    /// Sends one command and waits for its reply. Error replies become
    /// [`Error::Command`].
    pub async fn send(&mut self, cmd: &Cmd) -> Result<Frame> {
        self.queue(cmd);
        self.flush().await?;
        match self.read_frame().await? {
            Frame::Error(msg) => Err(Error::Command(msg)),
            frame => Ok(frame),
        }
    }

    /// Closes the write half. Errors are ignored; the socket is being
    /// discarded anyway.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Switches the connection to subscriber mode.
    pub fn into_subscriber(self) -> Subscriber {
        Subscriber { conn: self }
    }
}

/// A message delivered to a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// The subscribed pattern that matched. Empty for plain SUBSCRIBE
    /// messages.
    pub pattern: Bytes,
    pub channel: Bytes,
    pub payload: Bytes,
}

/// A connection in pub/sub mode.
pub struct Subscriber {
    conn: Connection,
}

impl Subscriber {
    /// Subscribes to a channel pattern and waits for the confirmation.
    pub async fn psubscribe(&mut self, pattern: &str) -> Result<()> {
        self.conn.queue(&Cmd::new("PSUBSCRIBE").arg(pattern));
        self.conn.flush().await?;
        loop {
            match self.conn.read_frame().await? {
                Frame::Error(msg) => return Err(Error::Command(msg)),
                Frame::Array(items) if is_kind(&items, b"psubscribe") => return Ok(()),
                // a message racing the confirmation; ignore it
                _ => continue,
            }
        }
    }

    /// Waits for the next published message. Cancel-safe.
    pub async fn next_message(&mut self) -> Result<PushMessage> {
        loop {
            let frame = self.conn.read_frame().await?;
            let Frame::Array(items) = frame else {
                continue;
            };
            if is_kind(&items, b"pmessage") && items.len() == 4 {
                let mut it = items.into_iter().skip(1).map(Frame::into_bytes);
                if let (Some(Some(pattern)), Some(Some(channel)), Some(Some(payload))) =
                    (it.next(), it.next(), it.next())
                {
                    return Ok(PushMessage {
                        pattern,
                        channel,
                        payload,
                    });
                }
            } else if is_kind(&items, b"message") && items.len() == 3 {
                let mut it = items.into_iter().skip(1).map(Frame::into_bytes);
                if let (Some(Some(channel)), Some(Some(payload))) = (it.next(), it.next()) {
                    return Ok(PushMessage {
                        pattern: Bytes::new(),
                        channel,
                        payload,
                    });
                }
            }
        }
    }

    pub async fn shutdown(self) {
        self.conn.shutdown().await;
    }
}

fn is_kind(items: &[Frame], kind: &[u8]) -> bool {
    items
        .first()
        .and_then(Frame::as_bytes)
        .is_some_and(|k| k.eq_ignore_ascii_case(kind))
}
