//! Recipient storage.
//!
//! [`RecipientStore`] is the capability reconciliation consumes. Identity
//! merging belongs to the store: reconciliation hands over the three keys
//! from a match and takes whatever recipient the store resolves them to.
//!
//! # Merge policy of [`SqliteRecipientStore`]
//!
//! The directory service is authoritative for which PNI and ACI currently
//! own a phone number, so a match is merged like this:
//!
//! 1. The recipient holding the ACI wins. Otherwise the recipient holding
//!    the PNI, then the one holding the phone number, as long as it does
//!    not already carry a *different* ACI.
//! 2. Any other recipient still holding the PNI or the phone number loses
//!    that field. It is kept, never deleted.
//! 3. The winner takes the PNI and phone number and keeps its ACI unless
//!    the match supplied one.
//!
//! All steps of one merge run in a single transaction.

// SQLite operations need to hold the lock for the duration of the operation.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::{RecipientError, Result};
use super::types::Recipient;
use crate::discovery::{Aci, Pni, E164};

/// Columns selected for every recipient query, in [`read_row`] order.
const RECIPIENT_COLUMNS: &str =
    "id, aci, pni, phone_number, is_phone_number_discoverable, is_registered";

/// Store of recipient records.
pub trait RecipientStore: Send + Sync {
    /// Finds the recipient for a directory match, creating it if needed,
    /// and merges the three keys into it according to the store's policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    fn find_or_create(&self, aci: Option<Aci>, pni: Pni, phone_number: &E164)
        -> Result<Recipient>;

    /// Finds a recipient by phone number without creating one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find_by_phone_number(&self, phone_number: &E164) -> Result<Option<Recipient>>;

    /// Writes back a recipient's fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the recipient does not exist or the write fails.
    fn save(&self, recipient: &Recipient) -> Result<()>;
}

/// `SQLite`-backed [`RecipientStore`].
pub struct SqliteRecipientStore {
    conn: Mutex<Connection>,
}

impl SqliteRecipientStore {
    /// Opens (or creates) the recipient database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RecipientError::Storage(format!("Failed to acquire database lock: {e}")))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                aci BLOB UNIQUE,
                pni BLOB UNIQUE,
                phone_number TEXT UNIQUE,
                is_phone_number_discoverable INTEGER NOT NULL DEFAULT 0,
                is_registered INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    /// Inserts a new recipient and returns it with its assigned ID.
    ///
    /// The `id` field of `recipient` is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier is already taken or the write fails.
    pub fn insert(&self, recipient: &Recipient) -> Result<Recipient> {
        let conn = self.lock()?;
        let id = insert_row(&conn, recipient)?;
        Ok(Recipient {
            id,
            ..recipient.clone()
        })
    }

    /// Retrieves a recipient by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: i64) -> Result<Option<Recipient>> {
        let conn = self.lock()?;
        find_one(&conn, "id = ?1", params![id])
    }

    /// Retrieves a recipient by ACI.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn find_by_aci(&self, aci: &Aci) -> Result<Option<Recipient>> {
        let conn = self.lock()?;
        find_one(&conn, "aci = ?1", params![aci.as_bytes().as_slice()])
    }

    /// Retrieves all recipients ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn all(&self) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECIPIENT_COLUMNS} FROM recipients ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], |row| Ok(read_row(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

impl RecipientStore for SqliteRecipientStore {
    fn find_or_create(
        &self,
        aci: Option<Aci>,
        pni: Pni,
        phone_number: &E164,
    ) -> Result<Recipient> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let by_aci = match aci {
            Some(aci) => find_one(&tx, "aci = ?1", params![aci.as_bytes().as_slice()])?,
            None => None,
        };
        let by_pni = find_one(&tx, "pni = ?1", params![pni.as_bytes().as_slice()])?;
        let by_phone = find_one(&tx, "phone_number = ?1", params![phone_number.as_str()])?;

        let compatible = |candidate: &Recipient| match (aci, candidate.aci) {
            (Some(wanted), Some(existing)) => wanted == existing,
            _ => true,
        };

        let primary = by_aci
            .or_else(|| by_pni.clone().filter(|r| compatible(r)))
            .or_else(|| by_phone.clone().filter(|r| compatible(r)));

        // Release identifiers held by anyone else before claiming them.
        let is_other = |r: &Recipient| primary.as_ref().map_or(true, |p| p.id != r.id);
        if let Some(mut other) = by_pni.filter(|r| is_other(r)) {
            other.pni = None;
            if other.phone_number.as_ref() == Some(phone_number) {
                other.phone_number = None;
            }
            update_row(&tx, &other)?;
            tracing::debug!(recipient = other.id, "Moved PNI away from recipient");
        }
        if let Some(mut other) = by_phone.filter(|r| is_other(r)) {
            // Re-read: the PNI step above may already have touched this row.
            if let Some(current) = find_one(&tx, "id = ?1", params![other.id])? {
                other = current;
            }
            other.phone_number = None;
            update_row(&tx, &other)?;
            tracing::debug!(recipient = other.id, "Moved phone number away from recipient");
        }

        let recipient = match primary {
            Some(mut recipient) => {
                recipient.aci = aci.or(recipient.aci);
                recipient.pni = Some(pni);
                recipient.phone_number = Some(phone_number.clone());
                update_row(&tx, &recipient)?;
                recipient
            }
            None => {
                let mut recipient = Recipient {
                    id: 0,
                    aci,
                    pni: Some(pni),
                    phone_number: Some(phone_number.clone()),
                    is_phone_number_discoverable: false,
                    is_registered: false,
                };
                recipient.id = insert_row(&tx, &recipient)?;
                tracing::debug!(recipient = recipient.id, "Created recipient from discovery");
                recipient
            }
        };

        tx.commit()?;
        Ok(recipient)
    }

    fn find_by_phone_number(&self, phone_number: &E164) -> Result<Option<Recipient>> {
        let conn = self.lock()?;
        find_one(&conn, "phone_number = ?1", params![phone_number.as_str()])
    }

    fn save(&self, recipient: &Recipient) -> Result<()> {
        let conn = self.lock()?;
        update_row(&conn, recipient)
    }
}

fn find_one(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<Recipient>> {
    let row = conn
        .query_row(
            &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE {predicate}"),
            params,
            |row| Ok(read_row(row)),
        )
        .optional()?;
    row.transpose()
}

fn insert_row(conn: &Connection, recipient: &Recipient) -> Result<i64> {
    conn.execute(
        r"
        INSERT INTO recipients (aci, pni, phone_number, is_phone_number_discoverable, is_registered)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
        params![
            recipient.aci.map(|aci| aci.as_bytes().to_vec()),
            recipient.pni.map(|pni| pni.as_bytes().to_vec()),
            recipient.phone_number.as_ref().map(E164::as_str),
            recipient.is_phone_number_discoverable,
            recipient.is_registered,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_row(conn: &Connection, recipient: &Recipient) -> Result<()> {
    let updated = conn.execute(
        r"
        UPDATE recipients SET
            aci = ?2,
            pni = ?3,
            phone_number = ?4,
            is_phone_number_discoverable = ?5,
            is_registered = ?6
        WHERE id = ?1
        ",
        params![
            recipient.id,
            recipient.aci.map(|aci| aci.as_bytes().to_vec()),
            recipient.pni.map(|pni| pni.as_bytes().to_vec()),
            recipient.phone_number.as_ref().map(E164::as_str),
            recipient.is_phone_number_discoverable,
            recipient.is_registered,
        ],
    )?;

    if updated == 0 {
        return Err(RecipientError::NotFound(recipient.id));
    }
    Ok(())
}

/// Decodes a row selected with [`RECIPIENT_COLUMNS`].
///
/// The outer `Result` carries `SQLite` errors, the inner one decoding errors.
fn read_row(row: &Row<'_>) -> Result<Recipient> {
    let id: i64 = row.get(0)?;
    let aci: Option<Vec<u8>> = row.get(1)?;
    let pni: Option<Vec<u8>> = row.get(2)?;
    let phone_number: Option<String> = row.get(3)?;

    let aci = aci
        .map(|bytes| decode_id(&bytes).and_then(Aci::from_bytes))
        .map(|id| id.ok_or_else(|| RecipientError::InvalidData("Invalid aci".to_string())))
        .transpose()?;
    let pni = pni
        .map(|bytes| decode_id(&bytes).and_then(Pni::from_bytes))
        .map(|id| id.ok_or_else(|| RecipientError::InvalidData("Invalid pni".to_string())))
        .transpose()?;
    let phone_number = phone_number
        .map(|s| {
            E164::parse(&s)
                .map_err(|e| RecipientError::InvalidData(format!("Invalid phone number: {e}")))
        })
        .transpose()?;

    Ok(Recipient {
        id,
        aci,
        pni,
        phone_number,
        is_phone_number_discoverable: row.get(4)?,
        is_registered: row.get(5)?,
    })
}

fn decode_id(bytes: &[u8]) -> Option<[u8; 16]> {
    bytes.try_into().ok()
}
