//! Error types for the data-movement engine.

use std::time::Duration;

use riptide_protocol::ProtocolError;
use thiserror::Error;

/// Errors returned by connections, executors, readers and pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// No connection could be borrowed from the pool, or dialling the
    /// store failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Socket-level failure on an established connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The store closed the connection.
    #[error("server disconnected")]
    Disconnected,

    /// The aggregate deadline of a batch elapsed before every reply
    /// resolved.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled: its pool, reader or pipeline was
    /// closed while it was waiting.
    #[error("interrupted")]
    Interrupted,

    /// The keyspace notification subscription ended unexpectedly.
    /// The reader has to be reopened.
    #[error("subscription lost: {0}")]
    SubscriptionLost(String),

    /// A reply could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A reply parsed but had the wrong shape for the command.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// The store answered with an error reply.
    #[error("{0}")]
    Command(String),

    /// Configuration was rejected before anything was started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A worker task panicked. Retrying would panic again.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl Error {
    /// Whether the failed call may succeed if simply tried again.
    ///
    /// Connection trouble and timeouts are transient; command errors,
    /// protocol errors and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Io(_) | Error::Disconnected | Error::Timeout(_)
        )
    }

    pub(crate) fn unexpected(command: impl Into<String>, reply: &riptide_protocol::Frame) -> Self {
        Error::UnexpectedReply {
            command: command.into(),
            reply: format!("{reply:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Connection("pool exhausted".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Disconnected.is_retryable());
        assert!(!Error::Interrupted.is_retryable());
        assert!(!Error::Command("WRONGTYPE".into()).is_retryable());
        assert!(!Error::SubscriptionLost("eof".into()).is_retryable());
        assert!(!Error::WorkerPanicked("boom".into()).is_retryable());
        assert!(!Error::Config("chunk_size".into()).is_retryable());
    }

    #[test]
    fn command_error_displays_server_message() {
        let err = Error::Command("BUSYKEY Target key name already exists.".into());
        assert_eq!(err.to_string(), "BUSYKEY Target key name already exists.");
    }
}
