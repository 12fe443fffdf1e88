//! Core error types.
//!
//! Comprehensive error handling for ring/codec operations.

use std::io;
use thiserror::Error;

/// Main error type for `corral-core` operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The ring could not accommodate the frame being written; callers
    /// should `pop_write_pos` and either grow the ring or block.
    #[error("out of buffer space: needed {needed} bytes, {available} available")]
    OutOfBuffer { needed: usize, available: usize },

    /// A value of this kind cannot be serialized in the current codec mode
    /// (e.g. userdata under `CodecMode::OutOfProcess`).
    #[error("value not serializable in this mode: {0}")]
    Unsupported(String),

    /// The byte stream was malformed: unknown tag, truncated frame, or a
    /// function chunk stream that didn't terminate correctly.
    #[error("malformed stream: {0}")]
    Malformed(String),

    /// A table (or function upvalue table) referenced an ancestor of
    /// itself during encoding.
    #[error("cyclic reference detected during encode")]
    CyclicReference,

    /// A function had more than one captured upvalue without opting in
    /// to upvalue-capture mode.
    #[error("function has {0} upvalues but upvalue capture was not requested")]
    UncapturedUpvalues(usize),

    /// The handle id referenced was never registered, or was released.
    #[error("unresolvable handle: {0:?}")]
    UnresolvableHandle(u64),

    /// Wrapped I/O error, with the file:line context `Display` prints.
    #[error("io error at {file}:{line}: {source}")]
    Io {
        #[source]
        source: io::Error,
        file: &'static str,
        line: u32,
    },
}

/// Result type alias for `corral-core` operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    #[must_use]
    pub fn out_of_buffer(needed: usize, available: usize) -> Self {
        Self::OutOfBuffer { needed, available }
    }

    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    #[must_use]
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

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

    /// Whether a retry of the same operation could plausibly succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OutOfBuffer { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
