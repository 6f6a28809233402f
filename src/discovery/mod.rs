//! Private contact discovery against an attested directory service.
//!
//! Resolves a set of phone numbers to registered accounts while spending
//! as little lookup quota as possible. The service hands out a token that
//! stands for every number already paid for; incremental runs send that
//! token back and only pay for numbers it does not cover.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryManager::discover
//!     ├── build_request        (reads DiscoveryStateStore)
//!     ├── LookupOperation      (DirectoryConnection, writes DiscoveryStateStore)
//!     └── Reconciler           (RecipientStore)
//! ```
//!
//! # Quota Model
//!
//! | Step | Effect on quota |
//! |------|-----------------|
//! | Token returned by the service | New numbers are billed |
//! | Token persisted locally | Those numbers are never billed again |
//! | Results fetched | Free, repeatable for an acknowledged token |
//!
//! Persisting before fetching results means a crash can lose results but
//! never pays twice for the same number.

mod connection;
mod error;
mod manager;
mod operation;
mod request;
mod retry;
mod state;
mod types;
pub mod wire;

pub use connection::{
    ConnectionError, DirectoryConnection, DirectoryConnector, PersistedTokenHandle, ResultEntry,
    TokenHandle, CLOSE_INVALID_TOKEN, CLOSE_RATE_LIMIT_EXCEEDED,
};
pub use error::{DiscoveryError, E164Error, Result, StateError, StateResult};
pub use manager::DiscoveryManager;
pub use operation::{LookupOperation, LookupPhase, DEFAULT_RETRY_AFTER};
pub use request::{build_request, AccessKeyProvider, StaticAccessKeys};
pub use retry::{perform_with_retry, RetryPolicy};
pub use state::{DiscoveryStateStore, PersistedDiscoveryState, SqliteDiscoveryStateStore};
pub use types::{
    AccessKey, Aci, DiscoveryMode, DiscoveryToken, LookupRequest, LookupResult, Pni, ACCESS_KEY_LEN,
    E164,
};
