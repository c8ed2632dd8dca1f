//! Error types for rate limiting.

use std::time::Duration;

use crate::limiter::Rejection;

/// Errors raised by a storage backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("Storage connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed a command.
    #[error("Storage query error: {0}")]
    Query(String),

    /// A stored value could not be decoded.
    #[error("Storage codec error: {0}")]
    Codec(String),
}

/// Errors raised while computing the identity of a request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    /// The header the bucket identifies on is not present.
    #[error("Missing identity header '{0}'")]
    MissingHeader(String),

    /// The header is present but not valid visible ASCII.
    #[error("Identity header '{0}' contains invalid characters")]
    InvalidHeader(String),

    /// No client address was attached to the request.
    #[error("Client IP address is not available")]
    MissingClientIp,

    /// Raised by a user supplied identifier.
    #[error("{0}")]
    Custom(String),
}

/// Outcome of a failed limiter call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    /// The identity has no remaining quota in the bucket.
    #[error("Rate limit exceeded for bucket '{}'", .0.bucket)]
    Exceeded(Rejection),

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The identity of the request could not be computed.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// The call did not finish before its deadline. The call itself keeps running.
    #[error("Limiter call timed out after {elapsed:?} (deadline {timeout:?})")]
    Timeout {
        /// Time spent waiting.
        elapsed: Duration,
        /// The configured deadline.
        timeout: Duration,
    },

    /// No rule was registered under the bucket name.
    #[error("No rate limit rule registered for bucket '{0}'")]
    UnknownBucket(String),

    /// The task running the call panicked or was cancelled.
    #[error("Limiter call aborted: {0}")]
    Aborted(String),
}

impl LimiterError {
    /// True for [`LimiterError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised while building the rate limit manager.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// A bucket definition is not usable.
    #[error("Invalid rate limit bucket '{name}': {reason}")]
    InvalidBucket {
        /// Name of the bucket.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Two buckets share a name.
    #[error("Rate limit bucket '{0}' is defined more than once")]
    DuplicateBucket(String),

    /// A reference to a bucket that does not exist.
    #[error("Unknown rate limit bucket '{0}'")]
    UnknownBucket(String),

    /// The storage backend could not be initialized.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
