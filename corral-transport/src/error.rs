//! `corral-transport` error types.

use std::io;
use thiserror::Error;

/// Errors raised by the transport, fast-path cache and process utilities.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Core(#[from] corral_core::error::CoreError),

    /// Wrapped I/O error, with file:line context.
    #[error("io error at {file}:{line}: {source}")]
    Io {
        #[source]
        source: io::Error,
        file: &'static str,
        line: u32,
    },

    /// `Transport::clients` exceeded its accept deadline before
    /// `wait_count` connections arrived.
    #[error("timed out waiting for connections")]
    Timeout,

    /// The remote sent the `0xFFFF...FFFF` length sentinel, or a length
    /// exceeding the inline cap, or a numeric-transfer header mismatch —
    /// any of which terminates the connection.
    #[error("fatal protocol error: {0}")]
    FatalProtocol(String),

    /// A message exceeded [`crate::options::TransportOptions::inline_size_cap`].
    #[error("message of {0} bytes exceeds the inline size cap")]
    MessageTooLarge(usize),

    /// No client matched the requested id or tag filter.
    #[error("no such client: {0}")]
    NoSuchClient(String),

    /// A child process or fast-path peer failed in a way that isn't
    /// recoverable by retrying.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    #[track_caller]
    #[must_use]
    pub fn io(source: io::Error) -> Self {
        let loc = std::panic::Location::caller();
        Self::Io {
            source,
            file: loc.file(),
            line: loc.line(),
        }
    }

    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::FatalProtocol(_) | Self::Timeout)
    }
}
