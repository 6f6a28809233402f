//! Persistent incremental discovery state.
//!
//! Holds the last token issued by the directory service together with the
//! exact set of e164s it covers. The pair is only ever meaningful as a
//! whole: a load that finds anything inconsistent reports no state at all,
//! and the next run starts over with a full-cost request.

// SQLite operations need to hold the lock for the duration of the operation.
#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::error::{StateError, StateResult};
use super::types::{DiscoveryToken, E164};

/// Key under which the token is stored in `cds_metadata`.
const TOKEN_KEY: &str = "token";

/// Token plus the e164s the service acknowledged under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDiscoveryState {
    /// Last token issued by the service.
    pub token: DiscoveryToken,
    /// Every e164 acknowledged under `token`.
    pub known_e164s: BTreeSet<E164>,
}

/// Durable store for [`PersistedDiscoveryState`].
///
/// Implementations must make `save` durable before returning; the lookup
/// operation relies on that before it asks the service for results.
pub trait DiscoveryStateStore: Send + Sync {
    /// Loads the token and its e164 set.
    ///
    /// Returns `None` if nothing is stored or the stored data cannot be
    /// read or validated. Partial recovery is never attempted.
    fn load(&self) -> Option<PersistedDiscoveryState>;

    /// Saves a new token.
    ///
    /// With `replace_all`, every previously known e164 is dropped before
    /// `new_e164s` are written. Otherwise `new_e164s` are added to the
    /// existing set. The token and the set change atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; nothing is changed in that case.
    fn save(
        &self,
        new_token: &DiscoveryToken,
        replace_all: bool,
        new_e164s: &BTreeSet<E164>,
    ) -> StateResult<()>;

    /// Drops the token and the known set. The next `load` returns `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn reset(&self) -> StateResult<()>;
}

/// `SQLite`-backed [`DiscoveryStateStore`].
pub struct SqliteDiscoveryStateStore {
    conn: Mutex<Connection>,
}

impl SqliteDiscoveryStateStore {
    /// Opens (or creates) the state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: &Path) -> StateResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory() -> StateResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StateResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StateResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StateError::Storage(format!("Failed to acquire database lock: {e}")))
    }

    fn initialize_schema(&self) -> StateResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r"
            -- Token issued by the directory service
            CREATE TABLE IF NOT EXISTS cds_metadata (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            -- E164s acknowledged under the current token
            CREATE TABLE IF NOT EXISTS cds_previous_e164 (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                e164 TEXT NOT NULL UNIQUE
            );
            ",
        )?;
        Ok(())
    }

    fn try_load(&self) -> StateResult<Option<(Vec<u8>, Vec<String>)>> {
        let conn = self.lock()?;

        let token: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM cds_metadata WHERE key = ?1",
                params![TOKEN_KEY],
                |row| row.get(0),
            )
            .optional()?;

        let Some(token) = token else {
            return Ok(None);
        };

        let mut stmt = conn.prepare("SELECT e164 FROM cds_previous_e164")?;
        let e164s = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some((token, e164s)))
    }
}

impl DiscoveryStateStore for SqliteDiscoveryStateStore {
    fn load(&self) -> Option<PersistedDiscoveryState> {
        let (raw_token, raw_e164s) = match self.try_load() {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read discovery state; treating as absent");
                return None;
            }
        };

        let Some(token) = DiscoveryToken::new(raw_token) else {
            tracing::warn!("Found empty discovery token; resetting");
            return None;
        };

        let known_e164s = match raw_e164s
            .iter()
            .map(|s| E164::parse(s))
            .collect::<Result<BTreeSet<_>, _>>()
        {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(error = %e, "Found malformed previous e164; resetting token");
                return None;
            }
        };

        Some(PersistedDiscoveryState { token, known_e164s })
    }

    fn save(
        &self,
        new_token: &DiscoveryToken,
        replace_all: bool,
        new_e164s: &BTreeSet<E164>,
    ) -> StateResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            r"
            INSERT INTO cds_metadata (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![TOKEN_KEY, new_token.as_bytes()],
        )?;

        if replace_all {
            tx.execute("DELETE FROM cds_previous_e164", [])?;
            tracing::info!("Cleared previous e164s");
        }

        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO cds_previous_e164 (e164) VALUES (?1)")?;
            for e164 in new_e164s {
                stmt.execute(params![e164.as_str()])?;
            }
        }

        tx.commit()?;

        tracing::info!(
            token = %new_token.fingerprint(),
            new_e164s = new_e164s.len(),
            replace_all,
            "Saved discovery token"
        );
        Ok(())
    }

    fn reset(&self) -> StateResult<()> {
        tracing::warn!("Resetting discovery token");
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cds_metadata WHERE key = ?1", params![TOKEN_KEY])?;
        tx.execute("DELETE FROM cds_previous_e164", [])?;
        tx.commit()?;
        Ok(())
    }
}
