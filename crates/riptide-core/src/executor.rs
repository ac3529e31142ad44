//! Pooled, pipelined batch execution.
//!
//! [`PooledExecutor::execute`] borrows one connection, hands it to an
//! [`Operation`] wrapped in a [`Batch`], and returns one output per
//! input. The operation queues its commands, flushes once per round
//! trip and resolves replies in submission order. Every reply of the
//! batch races the same deadline, so a slow early reply eats into the
//! time left for later ones.
//!
//! The connection goes back to the pool only if the batch read every
//! reply it queued. Anything else (an error reply that aborted the
//! operation, a timeout, an I/O failure, a cancelled future) leaves
//! replies in flight, and the connection is dropped rather than reused.

use std::future::Future;
use std::time::{Duration, Instant};

use riptide_protocol::{Cmd, Frame};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;

/// Handle to a queued command's reply. Resolve it with
/// [`Batch::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a queued reply must be resolved or the connection is discarded"]
pub struct Reply(usize);

/// One borrowed connection plus the batch's shared deadline.
pub struct Batch {
    conn: Connection,
    timeout: Duration,
    deadline: tokio::time::Instant,
    queued: usize,
    received: Vec<Option<Frame>>,
    unflushed: bool,
    poisoned: bool,
}

impl Batch {
    pub(crate) fn new(conn: Connection, timeout: Duration) -> Self {
        Self {
            conn,
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
            queued: 0,
            received: Vec::new(),
            unflushed: false,
            poisoned: false,
        }
    }

    /// Queues a command without sending it.
    pub fn queue(&mut self, cmd: Cmd) -> Reply {
        self.conn.queue(&cmd);
        self.unflushed = true;
        let id = self.queued;
        self.queued += 1;
        Reply(id)
    }

    /// Sends everything queued so far in one write.
    pub async fn flush(&mut self) -> Result<()> {
        let result = tokio::time::timeout_at(self.deadline, self.conn.flush()).await;
        match result {
            Ok(Ok(())) => {
                self.unflushed = false;
                Ok(())
            }
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(_) => {
                self.poisoned = true;
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    /// Waits for a reply. Error replies become [`Error::Command`].
    pub async fn resolve(&mut self, reply: Reply) -> Result<Frame> {
        match self.resolve_raw(reply).await? {
            Frame::Error(msg) => Err(Error::Command(msg)),
            frame => Ok(frame),
        }
    }

    /// Waits for a reply, returning error replies as frames.
    pub async fn resolve_raw(&mut self, reply: Reply) -> Result<Frame> {
        let Reply(id) = reply;
        if id >= self.queued {
            return Err(Error::Command(format!("reply {id} was never queued")));
        }
        if self.unflushed && id >= self.received.len() {
            self.flush().await?;
        }
        while self.received.len() <= id {
            let frame = match tokio::time::timeout_at(self.deadline, self.conn.read_frame()).await
            {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    self.poisoned = true;
                    return Err(e);
                }
                Err(_) => {
                    self.poisoned = true;
                    return Err(Error::Timeout(self.timeout));
                }
            };
            self.received.push(Some(frame));
        }
        self.received[id]
            .take()
            .ok_or_else(|| Error::Command(format!("reply {id} resolved twice")))
    }

    /// Queues, flushes and resolves a single command.
    pub async fn send(&mut self, cmd: Cmd) -> Result<Frame> {
        let reply = self.queue(cmd);
        self.flush().await?;
        self.resolve(reply).await
    }

    /// Time left before the batch deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }

    /// True when every queued reply has been read off the socket and no
    /// I/O step failed.
    pub fn is_clean(&self) -> bool {
        !self.poisoned && !self.unflushed && self.received.len() == self.queued
    }

    /// Ends the batch, handing the connection back when it can be reused.
    pub(crate) fn finish(self) -> Option<Connection> {
        self.is_clean().then_some(self.conn)
    }
}

/// A unit of pipelined work over a batch of inputs.
///
/// Implementations must return exactly one output per input, in input
/// order.
pub trait Operation: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn execute(
        &self,
        batch: &mut Batch,
        items: Vec<Self::Input>,
    ) -> impl Future<Output = Result<Vec<Self::Output>>> + Send;
}

/// Runs an [`Operation`] over connections borrowed from a pool.
pub struct PooledExecutor<O> {
    pool: ConnectionPool,
    operation: O,
    timeout: Duration,
}

impl<O: Operation> PooledExecutor<O> {
    /// Creates an executor with its own pool, sized and timed from
    /// `config`.
    pub fn new(config: ConnectionConfig, operation: O) -> Self {
        let timeout = config.command_timeout;
        Self {
            pool: ConnectionPool::new(config),
            operation,
            timeout,
        }
    }

    /// Creates an executor over an existing pool.
    pub fn with_pool(pool: ConnectionPool, operation: O, timeout: Duration) -> Self {
        Self {
            pool,
            operation,
            timeout,
        }
    }

    /// Executes the operation over `items`, returning one output per item.
    pub async fn execute(&self, items: Vec<O::Input>) -> Result<Vec<O::Output>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let expected = items.len();
        let started = Instant::now();

        let mut guard = self.pool.get().await?;
        let conn = guard.take().ok_or(Error::Interrupted)?;
        let mut batch = Batch::new(conn, self.timeout);

        let result = self.operation.execute(&mut batch, items).await;

        match batch.finish() {
            Some(conn) => {
                guard.restore(conn);
                guard.release();
            }
            None => debug!("discarding connection with unread replies"),
        }

        let outputs = result?;
        crate::metrics::record_batch(expected, started.elapsed());
        if outputs.len() != expected {
            return Err(Error::UnexpectedReply {
                command: "batch".into(),
                reply: format!("{} results for {expected} items", outputs.len()),
            });
        }
        Ok(outputs)
    }

    /// Closes the pool; waiting and later calls fail with
    /// [`Error::Interrupted`].
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn operation(&self) -> &O {
        &self.operation
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
