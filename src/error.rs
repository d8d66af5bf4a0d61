//! Crate-level error types for instrument communication.

use std::io;
use std::time::Duration;

/// Errors surfaced by the transport client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No connection is open and no previous address is known to retry.
    #[error("not connected")]
    NotConnected,

    /// Could not reach the instrument on any candidate port.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No usable response line arrived before the deadline.
    ///
    /// Unlike the other variants this does not invalidate the connection;
    /// the query can simply be retried.
    #[error("no response to '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the failure invalidated the connection, so the next
    /// operation should attempt a reconnect.
    pub fn is_disconnecting(&self) -> bool {
        !matches!(self, Error::Timeout { .. })
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
