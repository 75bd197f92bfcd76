//! Durable local ledger backed by SQLite.
//!
//! Every state transition runs inside [`Store::write`], which opens a
//! `BEGIN IMMEDIATE` transaction. SQLite takes its write lock at `BEGIN`,
//! so two workers transitioning the same entity are serialized exactly as
//! a `SELECT ... FOR UPDATE` row lock would serialize them. The connection
//! mutex is released when the closure returns, so no lock is ever held
//! across an asset-network call.

pub mod codec;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::error::{ErrorClass, ErrorCode};

/// Errors raised by the local ledger.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store connection lock poisoned")]
    LockPoisoned,
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        "STORE_ERROR"
    }

    fn class(&self) -> ErrorClass {
        ErrorClass::Internal
    }
}

/// The local relational ledger.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a file-backed ledger.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening settlement ledger at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Open an in-memory ledger (for tests and the demo command).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory settlement ledger");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run read-only queries outside an explicit transaction.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back on `Err`.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.write(|tx| {
            tx.execute(
                "INSERT INTO projects (id, name, token_supply, created_at) VALUES ('p', 'P', '1', 'now')",
                [],
            )?;
            Err(StoreError::LockPoisoned)
        });
        assert!(result.is_err());

        let count: i64 = store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let store = Store::open(&path).unwrap();
            store
                .write(|tx| {
                    tx.execute(
                        "INSERT INTO projects (id, name, token_supply, created_at) VALUES ('p', 'P', '1', 'now')",
                        [],
                    )
                    .map_err(StoreError::from)
                })
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        let count: i64 = store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
