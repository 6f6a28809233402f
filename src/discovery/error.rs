//! Error types for contact discovery.
//!
//! [`DiscoveryError`] is the closed taxonomy surfaced to callers of
//! [`DiscoveryManager::discover`](super::DiscoveryManager::discover). The
//! smaller error types in this module describe local failures (malformed
//! phone numbers, token state persistence) and are folded into
//! [`DiscoveryError`] at the operation boundary.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::recipient::RecipientError;

/// Errors surfaced by a discovery run.
///
/// Every variant except [`DiscoveryError::Fatal`] is retryable. Callers
/// must not re-submit a rate-limited request before
/// [`retry_after`](Self::retry_after) has elapsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The directory service rate limited this identity.
    #[error("Rate limited until {retry_after}")]
    RateLimited {
        /// Earliest instant at which the request may be re-submitted.
        retry_after: DateTime<Utc>,
    },

    /// The service rejected the submitted token.
    ///
    /// The persisted token has already been reset locally; the next
    /// incremental run starts fresh. If the reset itself fails the run
    /// reports [`DiscoveryError::Storage`] instead.
    #[error("Discovery token rejected by the service")]
    InvalidToken,

    /// Transport or protocol failure (dropped connection, malformed frame).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with a 5xx status.
    #[error("Directory service unavailable (http {status})")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Earliest suggested retry instant, when the service sent one.
        retry_after: Option<DateTime<Utc>>,
    },

    /// Local persistence failed before any state was half-written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unexpected server behavior or unrecognized failure. Not retryable.
    #[error("Fatal discovery error: {0}")]
    Fatal(String),
}

impl DiscoveryError {
    /// Returns whether the caller may retry the run.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Returns the server-provided retry-after instant, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns whether this error is a rate limit.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

impl From<StateError> for DiscoveryError {
    fn from(err: StateError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<RecipientError> for DiscoveryError {
    fn from(err: RecipientError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors from parsing an E164 phone number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum E164Error {
    /// The number does not start with `+`.
    #[error("E164 must start with '+'")]
    MissingPlus,

    /// The number contains something other than ASCII digits after `+`.
    #[error("E164 contains non-digit characters")]
    InvalidDigits,

    /// The number has too few or too many digits.
    #[error("E164 must have 1 to 15 digits, got {0}")]
    InvalidLength(usize),

    /// The country code starts with zero.
    #[error("E164 must not start with 0")]
    LeadingZero,
}

/// Errors from the persisted discovery token state.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database error from `SQLite`.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for token state operations.
pub type StateResult<T> = std::result::Result<T, StateError>;
