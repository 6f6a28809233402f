//! Recipient records and reconciliation of discovery results.
//!
//! # Architecture
//!
//! ```text
//! Reconciler (merge matches, demote misses)
//!     ├── RecipientStore (identity merge policy, persistence)
//!     └── UndiscoverableCache (recent misses, in memory)
//! ```
//!
//! The recipient store is shared with the rest of the application.
//! Reconciliation only merges into records and flips their discovery
//! flags; it never deletes a recipient.

mod error;
mod reconcile;
mod storage;
mod types;
mod undiscoverable;

pub use error::{RecipientError, Result};
pub use reconcile::{Reconciler, DEFAULT_BATCH_SIZE};
pub use storage::{RecipientStore, SqliteRecipientStore};
pub use types::Recipient;
pub use undiscoverable::UndiscoverableCache;
