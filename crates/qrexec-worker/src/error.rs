//! Error types for the data worker.
//!
//! Messages are lowercase and follow the `"<operation> failed: <reason>"`
//! shape so diagnostics read uniformly in the worker's log output.

use std::io;

use thiserror::Error;

/// Result type alias using the worker's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end a session.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer sent something the protocol does not allow here.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Version negotiation failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A vchan operation failed; the transport is unusable.
    #[error("vchan {op} failed: {source}")]
    Transport {
        /// The operation that failed.
        op: &'static str,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The peer closed the vchan mid-transfer.
    #[error("vchan closed by peer")]
    Disconnected,

    /// Requested ring size is not a power of two.
    #[error("invalid vchan ring size: {0}")]
    InvalidRingSize(usize),

    /// The dispatched command line violates the request contract.
    #[error("command rejected: {0}")]
    BadCommand(String),

    /// The child process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(#[source] io::Error),

    /// A descriptor-level operation failed unrecoverably.
    #[error("{op} failed: {source}")]
    Sys {
        /// The operation that failed.
        op: &'static str,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// `Sys` error from the current `errno`.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::Sys {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// `Transport` error wrapping an I/O failure.
    pub(crate) fn transport(op: &'static str, source: io::Error) -> Self {
        Self::Transport { op, source }
    }
}
