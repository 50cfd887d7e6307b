//! src/error.rs
//! ============================================================================
//! # `SyncError`: Error taxonomy for the catalog sync engine
//!
//! Every fallible engine operation returns `Result<T, SyncError>`. Each
//! variant is local to the operation that raised it: a failed read belongs to
//! one cache key, a failed mutation to its caller, a validation failure to the
//! selection that produced it. Nothing here is ever broadcast across keys.

use std::io;

use compact_str::{CompactString, ToCompactString};
use thiserror::Error;

/// Convenient alias carrying the engine error type
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures reported by a [`FileService`](crate::service::FileService)
/// implementation, before the engine classifies them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Connection, DNS, TLS or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// The collaborator answered with a non-success status.
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The requested record does not exist remotely.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Engine error, grouped by the operation family that produced it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// A cache read failed; the entry stays stale and the next read retries.
    #[error("fetch for '{key}' failed: {reason}")]
    TransientFetch {
        key: CompactString,
        reason: CompactString,
    },

    /// A write failed; surfaced to the initiating caller only.
    #[error("{operation} failed: {reason}")]
    Mutation {
        operation: CompactString,
        reason: CompactString,
    },

    /// Local, pre-network rejection.
    #[error("{0}")]
    Validation(CompactString),

    /// Fetching or saving downloaded content failed.
    #[error("download of '{locator}' failed: {reason}")]
    Download {
        locator: CompactString,
        reason: CompactString,
    },

    /// Raw collaborator failure that has not been classified yet.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Configuration could not be read or is invalid.
    #[error("config error: {0}")]
    Config(CompactString),

    /// Local I/O failure (reading a selected file, for example).
    #[error("I/O error: {kind:?}: {message}")]
    Io {
        kind: io::ErrorKind,
        message: CompactString,
    },
}

impl SyncError {
    /// Create a read failure for a cache key.
    pub fn transient_fetch(key: impl ToCompactString, reason: impl ToCompactString) -> Self {
        Self::TransientFetch {
            key: key.to_compact_string(),
            reason: reason.to_compact_string(),
        }
    }

    /// Create a mutation failure.
    pub fn mutation(operation: impl ToCompactString, reason: impl ToCompactString) -> Self {
        Self::Mutation {
            operation: operation.to_compact_string(),
            reason: reason.to_compact_string(),
        }
    }

    /// Create a local validation failure.
    pub fn validation(message: impl ToCompactString) -> Self {
        Self::Validation(message.to_compact_string())
    }

    /// Create a download failure.
    pub fn download(locator: impl ToCompactString, reason: impl ToCompactString) -> Self {
        Self::Download {
            locator: locator.to_compact_string(),
            reason: reason.to_compact_string(),
        }
    }

    /// True for errors a later read may recover from by itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch { .. } | Self::Service(_))
    }

    /// True for errors raised before any network call.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_compact_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = SyncError::validation("exceeds size limit");
        assert_eq!(e.to_string(), "exceeds size limit");

        let e = SyncError::mutation("delete", "remote returned 500: boom");
        assert_eq!(e.to_string(), "delete failed: remote returned 500: boom");
    }

    #[test]
    fn test_classification() {
        assert!(SyncError::transient_fetch("files", "timeout").is_retryable());
        assert!(!SyncError::mutation("upload", "x").is_retryable());
        assert!(SyncError::validation("no file selected").is_validation());

        let io_err: SyncError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(
            io_err,
            SyncError::Io {
                kind: io::ErrorKind::NotFound,
                ..
            }
        ));
    }
}
