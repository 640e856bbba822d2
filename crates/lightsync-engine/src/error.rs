//! Error types for sync operations

use crate::events::FailureKind;
use lightsync_storage::BlockHeight;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`crate::BlockSource`] or other remote collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The request timed out
    #[error("Request timed out")]
    Timeout,

    /// The request was cancelled by the remote side
    #[error("Request cancelled")]
    Cancelled,

    /// The server answered with an error status
    #[error("Server error {code}: {message}")]
    Server {
        /// Status code
        code: i32,
        /// Server message
        message: String,
    },

    /// Anything else
    #[error("Service error: {0}")]
    Generic(String),
}

/// Error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Remote service error; retried with backoff
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Local cache or cursor storage failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote data or cache contents are inconsistent
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The note scanner reported a failure
    #[error("Scanner error: {0}")]
    Scanner(String),

    /// Hash-chain continuity broke above `height`
    #[error("Chain discontinuity at height {height}")]
    InvalidChain {
        /// Last stored height whose successor does not link to it
        height: BlockHeight,
    },

    /// Retry ceiling exceeded
    #[error("Gave up after {attempts} attempts: {last}")]
    MaxAttemptsReached {
        /// Attempts made
        attempts: u32,
        /// Last error message
        last: String,
    },

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// A deferred request was replaced by a newer one of the same kind
    #[error("Superseded by a newer request")]
    HookSuperseded,

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the cycle may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Service(_) | Error::Sync(_))
    }

    /// Whether local storage can no longer be trusted
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// How a failure is reported to subscribers
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Service(_) | Error::Sync(_) => FailureKind::Transient,
            Error::Storage(_) => FailureKind::Storage,
            Error::MaxAttemptsReached { .. } => FailureKind::RetriesExhausted,
            _ => FailureKind::Protocol,
        }
    }
}

impl From<lightsync_storage::Error> for Error {
    fn from(e: lightsync_storage::Error) -> Self {
        match e {
            lightsync_storage::Error::MalformedCacheEntry(name) => {
                Error::Protocol(format!("Malformed cache entry: {}", name))
            }
            other => Error::Storage(format!("{}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Service(ServiceError::Timeout).is_transient());
        assert!(!Error::Storage("disk".into()).is_transient());
        assert!(Error::Storage("disk".into()).is_storage());
        assert_eq!(
            Error::Protocol("bad".into()).failure_kind(),
            FailureKind::Protocol
        );
        assert_eq!(
            Error::MaxAttemptsReached {
                attempts: 3,
                last: "x".into()
            }
            .failure_kind(),
            FailureKind::RetriesExhausted
        );
    }

    #[test]
    fn test_storage_conversion() {
        let malformed = lightsync_storage::Error::MalformedCacheEntry("x-compactblock".into());
        assert!(matches!(Error::from(malformed), Error::Protocol(_)));

        let missing = lightsync_storage::Error::MissingBlock(5);
        assert!(Error::from(missing).is_storage());
    }
}
