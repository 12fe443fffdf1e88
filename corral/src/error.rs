//! Root error type composing every layer's error enum.

use thiserror::Error;

/// Top-level error for the `corral` facade: a thin `#[from]` wrapper around
/// each layer's own error enum, so callers that only touch the facade never
/// need to import `corral_core`/`corral_sync`/`corral_transport` directly
/// just to match on an error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] corral_core::error::CoreError),

    #[error(transparent)]
    Sync(#[from] corral_sync::error::SyncError),

    #[error(transparent)]
    Transport(#[from] corral_transport::error::TransportError),
}

impl Error {
    /// Whether a retry of the same operation could plausibly succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_recoverable(),
            Self::Sync(_) => false,
            Self::Transport(e) => e.is_connection_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_core_error_via_from() {
        let core_err = corral_core::error::CoreError::malformed("bad tag");
        let err: Error = core_err.into();
        assert!(matches!(err, Error::Core(_)));
    }

    #[test]
    fn wraps_transport_error_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let transport_err = corral_transport::error::TransportError::io(io_err);
        let err: Error = transport_err.into();
        assert!(err.is_recoverable());
    }
}
