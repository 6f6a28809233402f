//! High-level discovery API.
//!
//! [`DiscoveryManager`] wires the request builder, the lookup operation,
//! and reconciliation together behind a single [`discover`] call.
//!
//! Incremental runs share one persisted token, so they are serialized
//! through an async mutex held from request construction until the lookup
//! finishes. One-off runs never touch the token and skip the lock.
//!
//! [`discover`]: DiscoveryManager::discover

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::connection::DirectoryConnector;
use super::error::{DiscoveryError, Result};
use super::operation::LookupOperation;
use super::request::{build_request, AccessKeyProvider};
use super::state::{DiscoveryStateStore, SqliteDiscoveryStateStore};
use super::types::{DiscoveryMode, E164};
use crate::config::DiscoveryConfig;
use crate::recipient::{
    Reconciler, Recipient, RecipientStore, SqliteRecipientStore, UndiscoverableCache,
};

/// File name of the token state database inside the data directory.
const STATE_DB: &str = "cds_state.db";

/// File name of the recipient database inside the data directory.
const RECIPIENTS_DB: &str = "recipients.db";

/// Entry point for private contact discovery.
///
/// # Example
///
/// ```ignore
/// use std::collections::HashSet;
/// use cds_core::discovery::{DiscoveryManager, DiscoveryMode, E164};
///
/// let manager = DiscoveryManager::open(data_dir, connector, access_keys, config)?;
/// let numbers: HashSet<E164> = ["+15550001".parse()?].into();
/// let registered = manager.discover(&numbers, DiscoveryMode::Incremental).await?;
/// ```
pub struct DiscoveryManager {
    state: Arc<dyn DiscoveryStateStore>,
    connector: Arc<dyn DirectoryConnector>,
    recipients: Arc<dyn RecipientStore>,
    access_keys: Arc<dyn AccessKeyProvider>,
    config: DiscoveryConfig,
    undiscoverable: UndiscoverableCache,
    incremental_lock: Mutex<()>,
}

impl DiscoveryManager {
    /// Creates a manager from explicit collaborators.
    #[must_use]
    pub fn new(
        state: Arc<dyn DiscoveryStateStore>,
        connector: Arc<dyn DirectoryConnector>,
        recipients: Arc<dyn RecipientStore>,
        access_keys: Arc<dyn AccessKeyProvider>,
        config: DiscoveryConfig,
    ) -> Self {
        let undiscoverable = UndiscoverableCache::new(config.undiscoverable_ttl());
        Self {
            state,
            connector,
            recipients,
            access_keys,
            config,
            undiscoverable,
            incremental_lock: Mutex::new(()),
        }
    }

    /// Creates a manager with `SQLite` stores under `data_dir`.
    ///
    /// Creates the directory and databases if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Storage`] if the directory or a database
    /// cannot be created, or [`DiscoveryError::Fatal`] if `config` is invalid.
    pub fn open(
        data_dir: &Path,
        connector: Arc<dyn DirectoryConnector>,
        access_keys: Arc<dyn AccessKeyProvider>,
        config: DiscoveryConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| DiscoveryError::Fatal(e.to_string()))?;

        std::fs::create_dir_all(data_dir).map_err(|e| {
            DiscoveryError::Storage(format!("Failed to create data directory: {e}"))
        })?;

        let state = SqliteDiscoveryStateStore::new(&data_dir.join(STATE_DB))?;
        let recipients = SqliteRecipientStore::new(&data_dir.join(RECIPIENTS_DB))?;

        Ok(Self::new(
            Arc::new(state),
            connector,
            Arc::new(recipients),
            access_keys,
            config,
        ))
    }

    /// Resolves phone numbers to registered recipients.
    ///
    /// Returns the recipients for the requested numbers that matched a
    /// registered account. An empty input returns immediately without
    /// contacting the service.
    ///
    /// # Errors
    ///
    /// Returns a [`DiscoveryError`]; see its variants for retry guidance.
    pub async fn discover(
        &self,
        phone_numbers: &HashSet<E164>,
        mode: DiscoveryMode,
    ) -> Result<HashSet<Recipient>> {
        if phone_numbers.is_empty() {
            return Ok(HashSet::new());
        }

        let targets: BTreeSet<E164> = phone_numbers.iter().cloned().collect();
        tracing::info!(count = targets.len(), ?mode, "Starting contact discovery");

        let results = {
            let _serialized = if mode.uses_persisted_state() {
                Some(self.incremental_lock.lock().await)
            } else {
                None
            };

            let request = build_request(
                &targets,
                mode,
                self.state.as_ref(),
                self.access_keys.as_ref(),
            );
            let mut operation = LookupOperation::new(request, mode, self.state.as_ref())
                .with_default_retry_after(self.config.default_retry_after());
            operation.perform(self.connector.as_ref()).await?
        };

        let registered = Reconciler::new(self.recipients.as_ref())
            .with_batch_size(self.config.reconcile_batch_size)
            .with_undiscoverable_cache(&self.undiscoverable)
            .reconcile(&targets, &results)
            .await?;

        Ok(registered)
    }

    /// Returns the numbers a recent run marked undiscoverable.
    #[must_use]
    pub fn recently_undiscoverable(&self, numbers: &[E164]) -> Vec<E164> {
        self.undiscoverable.recently_undiscoverable(numbers)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DiscoveryConfig {
        &self.config
    }
}
