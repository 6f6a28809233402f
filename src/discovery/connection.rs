//! The attested directory connection, consumed as an opaque capability.
//!
//! The enclave handshake, channel encryption, and network I/O live behind
//! [`DirectoryConnector`] and [`DirectoryConnection`]. This module only
//! fixes the shape of the two round trips and the errors a connection may
//! report.
//!
//! # Ordering
//!
//! [`DirectoryConnection::complete`] takes a [`PersistedTokenHandle`], which
//! can only be minted inside this crate after the new token has been
//! durably saved. A connection cannot be asked for results before the
//! token it returned is persisted.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{Aci, DiscoveryToken, LookupRequest, Pni, E164};

/// Close code sent when the identity's quota is exhausted.
pub const CLOSE_RATE_LIMIT_EXCEEDED: u16 = 4008;

/// Close code sent when the submitted token is invalid or stale.
pub const CLOSE_INVALID_TOKEN: u16 = 4101;

/// Opens attested connections to the directory service.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Connects and completes the attestation handshake.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the connection cannot be established.
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, ConnectionError>;
}

/// An established attested channel.
#[async_trait]
pub trait DirectoryConnection: Send {
    /// Sends the lookup request and waits for the token response.
    ///
    /// The service performs the set intersection before answering, so this
    /// can take much longer than an ordinary RPC.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] on transport failure or service rejection.
    async fn submit(&mut self, request: &LookupRequest) -> Result<TokenHandle, ConnectionError>;

    /// Acknowledges the persisted token and reads every result entry.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] on transport failure or service rejection.
    async fn complete(
        &mut self,
        ack: PersistedTokenHandle,
    ) -> Result<Vec<ResultEntry>, ConnectionError>;

    /// Closes the channel after a failure. The service closes it on success.
    async fn close(&mut self) {}
}

/// Token returned by the first round trip, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHandle {
    raw: Vec<u8>,
}

impl TokenHandle {
    /// Wraps the raw token bytes returned by the service.
    #[must_use]
    pub const fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// Returns the raw token bytes. May be empty if the service misbehaved.
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub(super) fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

/// Proof that a token has gone through the persistence step.
///
/// Only the lookup operation can construct this, and only after the token
/// and its e164 set were saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTokenHandle {
    token: DiscoveryToken,
}

impl PersistedTokenHandle {
    pub(super) const fn new(token: DiscoveryToken) -> Self {
        Self { token }
    }

    /// Returns the acknowledged token.
    #[must_use]
    pub const fn token(&self) -> &DiscoveryToken {
        &self.token
    }
}

/// A raw match entry from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEntry {
    /// The matched phone number.
    pub e164: E164,
    /// Phone-number identifier; `None` means the entry is not actionable.
    pub pni: Option<Pni>,
    /// Account identifier, if revealed.
    pub aci: Option<Aci>,
}

/// Failures reported by a [`DirectoryConnection`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The service rate limited the request.
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Server hint, relative to now.
        retry_after: Option<Duration>,
    },

    /// The service rejected the submitted token.
    #[error("Invalid discovery token")]
    InvalidToken,

    /// The channel was closed with a status code.
    #[error("Connection closed with code {code}")]
    Closed {
        /// Close status code.
        code: u16,
        /// Close reason payload, if any.
        reason: Option<Vec<u8>>,
    },

    /// The HTTP upgrade failed.
    #[error("HTTP error {status}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// `Retry-After` hint, relative to now.
        retry_after: Option<Duration>,
    },

    /// Malformed frame or unexpected message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Underlying socket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The connection dropped.
    #[error("Connection dropped")]
    Disconnected,

    /// Anything else.
    #[error("Connection error: {0}")]
    Other(String),
}
