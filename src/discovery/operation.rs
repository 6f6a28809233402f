//! Two-phase directory lookup.
//!
//! ```text
//! Built ─► Submitted ─► TokenReceived ─► Acked ─► ResultsReceived ─► Done
//!              │              │
//!              └──────────────┴──► Errored
//! ```
//!
//! The new token is persisted between the two round trips. The service
//! bills quota the moment it hands out a token, so once the token is saved
//! an interrupted run can re-fetch its results without paying again.
//! [`DirectoryConnection::complete`] only accepts a [`PersistedTokenHandle`],
//! and only [`LookupOperation`] can build one, after the save.
//!
//! Errors are classified exactly once, at the end of the run. The operation
//! never retries on its own.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::connection::{
    ConnectionError, DirectoryConnection, DirectoryConnector, PersistedTokenHandle, ResultEntry,
    TokenHandle, CLOSE_INVALID_TOKEN, CLOSE_RATE_LIMIT_EXCEEDED,
};
use super::error::{DiscoveryError, Result};
use super::state::DiscoveryStateStore;
use super::types::{DiscoveryMode, DiscoveryToken, LookupRequest, LookupResult};

/// Retry-after used when the service does not provide one.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Progress of a [`LookupOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupPhase {
    /// Request built, nothing sent.
    Built,
    /// Request sent, waiting for the token.
    Submitted,
    /// Token received, not yet persisted.
    TokenReceived,
    /// Token persisted and acknowledged.
    Acked,
    /// Result entries received.
    ResultsReceived,
    /// Results mapped and returned.
    Done,
    /// The run failed.
    Errored,
}

/// Close reason payload sent with [`CLOSE_RATE_LIMIT_EXCEEDED`].
#[derive(Debug, Deserialize)]
struct QuotaExceededReason {
    retry_after: f64,
}

/// Failure before classification.
enum Failure {
    Connection(ConnectionError),
    Local(DiscoveryError),
}

impl From<ConnectionError> for Failure {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<DiscoveryError> for Failure {
    fn from(err: DiscoveryError) -> Self {
        Self::Local(err)
    }
}

/// A single lookup against the directory service.
pub struct LookupOperation<'a> {
    request: LookupRequest,
    mode: DiscoveryMode,
    state: &'a dyn DiscoveryStateStore,
    default_retry_after: Duration,
    phase: LookupPhase,
}

impl<'a> LookupOperation<'a> {
    /// Creates an operation for a built request.
    ///
    /// `state` is only written in [`DiscoveryMode::Incremental`].
    #[must_use]
    pub const fn new(
        request: LookupRequest,
        mode: DiscoveryMode,
        state: &'a dyn DiscoveryStateStore,
    ) -> Self {
        Self {
            request,
            mode,
            state,
            default_retry_after: DEFAULT_RETRY_AFTER,
            phase: LookupPhase::Built,
        }
    }

    /// Overrides the retry-after used when the service gives no hint.
    #[must_use]
    pub const fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    /// Returns the current phase.
    #[must_use]
    pub const fn phase(&self) -> LookupPhase {
        self.phase
    }

    /// Returns the request this operation sends.
    #[must_use]
    pub const fn request(&self) -> &LookupRequest {
        &self.request
    }

    /// Runs the lookup over a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns a classified [`DiscoveryError`]. An invalid token resets the
    /// persisted state before the error is returned.
    pub async fn perform(
        &mut self,
        connector: &dyn DirectoryConnector,
    ) -> Result<Vec<LookupResult>> {
        let mut connection = match connector.connect().await {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(Failure::Connection(e))),
        };

        match self.run(connection.as_mut()).await {
            Ok(results) => Ok(results),
            Err(failure) => {
                connection.close().await;
                Err(self.fail(failure))
            }
        }
    }

    async fn run(
        &mut self,
        connection: &mut dyn DirectoryConnection,
    ) -> std::result::Result<Vec<LookupResult>, Failure> {
        self.phase = LookupPhase::Submitted;
        let handle = connection.submit(&self.request).await?;

        self.phase = LookupPhase::TokenReceived;
        let ack = self.persist_token(handle)?;

        self.phase = LookupPhase::Acked;
        let entries = connection.complete(ack).await?;

        self.phase = LookupPhase::ResultsReceived;
        let results = Self::map_entries(entries);

        self.phase = LookupPhase::Done;
        tracing::info!(matched = results.len(), "Directory lookup finished");
        Ok(results)
    }

    /// Persists the new token and the e164s it covers.
    fn persist_token(&self, handle: TokenHandle) -> Result<PersistedTokenHandle> {
        let token = DiscoveryToken::new(handle.into_raw())
            .ok_or_else(|| DiscoveryError::Fatal("token response missing token".to_string()))?;

        if self.mode.uses_persisted_state() {
            // Without a prior token the service started a fresh set, so any
            // stale local numbers must go.
            self.state
                .save(&token, !self.request.has_token(), &self.request.new_e164s)?;
        }

        Ok(PersistedTokenHandle::new(token))
    }

    fn map_entries(entries: Vec<ResultEntry>) -> Vec<LookupResult> {
        let total = entries.len();
        let results: Vec<LookupResult> = entries
            .into_iter()
            .filter_map(|entry| {
                Some(LookupResult {
                    pni: entry.pni?,
                    e164: entry.e164,
                    aci: entry.aci,
                })
            })
            .collect();

        if results.len() < total {
            tracing::debug!(dropped = total - results.len(), "Dropped entries without a PNI");
        }
        results
    }

    fn fail(&mut self, failure: Failure) -> DiscoveryError {
        let phase = self.phase;
        self.phase = LookupPhase::Errored;

        let error = match failure {
            Failure::Local(error) => error,
            Failure::Connection(error) => self.classify(error),
        };
        tracing::warn!(?phase, error = %error, "Directory lookup failed");
        error
    }

    /// Maps a connection error onto the discovery taxonomy.
    fn classify(&self, error: ConnectionError) -> DiscoveryError {
        match error {
            ConnectionError::RateLimited { retry_after } => self.rate_limited(retry_after),
            ConnectionError::InvalidToken => self.invalid_token(),
            ConnectionError::Closed { code, reason } => match code {
                CLOSE_RATE_LIMIT_EXCEEDED => {
                    self.rate_limited(reason.as_deref().and_then(parse_retry_after))
                }
                CLOSE_INVALID_TOKEN => self.invalid_token(),
                _ => DiscoveryError::Fatal(format!("connection closed with code {code}")),
            },
            ConnectionError::Http {
                status: 429,
                retry_after,
            } => self.rate_limited(retry_after),
            ConnectionError::Http {
                status,
                retry_after,
            } if (500..600).contains(&status) => DiscoveryError::Unavailable {
                status,
                retry_after: retry_after.map(retry_instant),
            },
            ConnectionError::Http { status, .. } => {
                DiscoveryError::Fatal(format!("http {status} error"))
            }
            ConnectionError::Protocol(message) => {
                DiscoveryError::Transport(format!("protocol error: {message}"))
            }
            ConnectionError::WebSocket(message) => {
                DiscoveryError::Transport(format!("web socket error: {message}"))
            }
            ConnectionError::Disconnected => {
                DiscoveryError::Transport("connection dropped".to_string())
            }
            ConnectionError::Other(message) => DiscoveryError::Fatal(message),
        }
    }

    fn rate_limited(&self, retry_after: Option<Duration>) -> DiscoveryError {
        let retry_after = retry_instant(retry_after.unwrap_or(self.default_retry_after));
        tracing::warn!(%retry_after, "Rate limited by directory service");
        DiscoveryError::RateLimited { retry_after }
    }

    fn invalid_token(&self) -> DiscoveryError {
        // A rejected token would be rejected again; start over next time at
        // the cost of extra quota.
        if self.mode.uses_persisted_state() {
            if let Err(e) = self.state.reset() {
                tracing::error!(error = %e, "Failed to reset rejected discovery token");
                return DiscoveryError::Storage(format!(
                    "Failed to reset rejected discovery token: {e}"
                ));
            }
        }
        DiscoveryError::InvalidToken
    }
}

/// Converts a relative retry-after into an instant, saturating far in the future.
fn retry_instant(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parses `{"retry_after": <seconds>}` from a close reason.
fn parse_retry_after(reason: &[u8]) -> Option<Duration> {
    let parsed: QuotaExceededReason = serde_json::from_slice(reason).ok()?;
    Duration::try_from_secs_f64(parsed.retry_after).ok()
}
