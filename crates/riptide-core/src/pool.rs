//! Bounded connection pool.
//!
//! A semaphore caps the number of connections checked out at once;
//! idle connections are kept in a stack and reused before new ones are
//! dialled. A checkout that waits longer than the configured acquire
//! timeout fails with [`Error::Connection`].
//!
//! Unlike a plain "return on drop" guard, a [`PooledConnection`] goes
//! back to the pool only when [`PooledConnection::release`] is called.
//! A guard dropped any other way (an error, a timeout, a cancelled task)
//! may be holding a connection with unread replies in flight, so its
//! connection is closed instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// A pool of connections to one store.
pub struct ConnectionPool {
    config: ConnectionConfig,
    idle: parking_lot::Mutex<Vec<Connection>>,
    semaphore: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Creates a pool sized by `config.pool_size`. No connection is
    /// opened until the first checkout.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_size(config.pool_size, config)
    }

    /// Creates a pool with an explicit size, ignoring `config.pool_size`.
    pub fn with_size(max_size: usize, config: ConnectionConfig) -> Self {
        let max_size = max_size.max(1);
        Self {
            acquire_timeout: config.pool_acquire_timeout,
            config,
            idle: parking_lot::Mutex::new(Vec::with_capacity(max_size)),
            semaphore: Arc::new(Semaphore::new(max_size)),
            max_size,
            closed: AtomicBool::new(false),
        }
    }

    /// Checks out a connection, dialling a new one when none is idle.
    pub async fn get(&self) -> Result<PooledConnection<'_>> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "no pooled connection available within {:?} (pool size {})",
                self.acquire_timeout, self.max_size
            ))
        })?
        .map_err(|_| Error::Interrupted)?;

        let idle = { self.idle.lock().pop() };
        let conn = match idle {
            Some(c) => c,
            None => Connection::connect(&self.config).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
            _permit: permit,
        })
    }

    /// Closes the pool. Waiting and future checkouts fail with
    /// [`Error::Interrupted`]; idle connections are dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.semaphore.close();
            let dropped = std::mem::take(&mut *self.idle.lock());
            debug!(addr = %self.config.addr(), idle = dropped.len(), "pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of connections that could be checked out right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn put_back(&self, conn: Connection) {
        if !self.is_closed() {
            self.idle.lock().push(conn);
        }
    }
}

/// A connection checked out from a [`ConnectionPool`].
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection<'_> {
    /// Takes the connection out of the guard. The permit stays held
    /// until the guard is dropped.
    pub fn take(&mut self) -> Option<Connection> {
        self.conn.take()
    }

    /// Puts a connection back into the guard after [`take`](Self::take).
    pub fn restore(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }

    /// Returns the connection to the pool for reuse. Only call this when
    /// every reply on the connection has been read.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }

    pub fn conn(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }
}
