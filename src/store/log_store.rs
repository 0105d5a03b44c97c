use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{
    Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior, params,
};

use crate::error::VcsError;

use super::schema::TableSpec;

pub type StoreResult<T> = Result<T, VcsError>;

/// Minimal embedded relational store.
///
/// Writers in different processes coordinate through SQLite's own locking;
/// the busy timeout bounds how long any statement waits for it.
pub struct LogStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl LogStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| unavailable(path, e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| unavailable(path, e))?;
        log::debug!("opened log store {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory store, for tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|e| unavailable(&path, e))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table_exists(&self, name: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        table_exists_on(&conn, name).map_err(|e| self.unavailable(e))
    }

    /// Create the table if it is absent. Idempotent.
    pub fn ensure_table(&self, spec: TableSpec) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(spec.create_sql)
            .map_err(|e| self.unavailable(e))?;
        log::debug!("ensured table {} in {}", spec.name, self.path.display());
        Ok(())
    }

    /// Run a single statement, returning the number of affected rows.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(sql, params).map_err(|e| self.unavailable(e))
    }

    /// Run a query and map every row.
    pub fn query<T, P, F>(&self, sql: &str, params: P, map: F) -> StoreResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let run = || -> rusqlite::Result<Vec<T>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, map)?;
            rows.collect()
        };
        run().map_err(|e| self.unavailable(e))
    }

    /// Run `f` inside an IMMEDIATE transaction, committing if it returns Ok.
    ///
    /// IMMEDIATE takes the write lock up front, so concurrent writers queue on
    /// the busy timeout instead of failing at commit.
    pub fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| unavailable(&self.path, e))?;
        let value = f(&tx).map_err(|e| unavailable(&self.path, e))?;
        tx.commit().map_err(|e| unavailable(&self.path, e))?;
        Ok(value)
    }

    fn unavailable(&self, source: rusqlite::Error) -> VcsError {
        unavailable(&self.path, source)
    }
}

pub(crate) fn table_exists_on(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn unavailable(path: &Path, source: rusqlite::Error) -> VcsError {
    VcsError::StorageUnavailable {
        path: path.to_path_buf(),
        source,
    }
}
