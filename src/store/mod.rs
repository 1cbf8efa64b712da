//! # Local Metadata Store
//!
//! Embedded SQLite database holding connection profiles, run history,
//! checkpoints and structured log entries. One writer connection guarded by
//! a mutex; every mutation goes through the `with_tx` unit-of-work so a
//! failed closure rolls the whole change back.
//!
//! Deleting a run cascades to its checkpoints and log entries; deleting a
//! profile cascades to its runs.

pub mod checkpoints;
pub mod logs;
pub mod profiles;
pub mod runs;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Transaction};

use crate::domain::errors::{MigrationError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    id            INTEGER PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    description   TEXT NOT NULL DEFAULT '',
    source_config TEXT NOT NULL,
    target_config TEXT NOT NULL,
    compat_mode   TEXT NOT NULL DEFAULT 'auto',
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_runs (
    id                       INTEGER PRIMARY KEY,
    profile_id               INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
    session_id               TEXT NOT NULL,
    start_date               TEXT NOT NULL,
    end_date                 TEXT NOT NULL,
    engine                   TEXT NOT NULL,
    started_at               TEXT NOT NULL,
    completed_at             TEXT,
    status                   TEXT NOT NULL,
    total_partitions         INTEGER NOT NULL DEFAULT 0,
    completed_partitions     INTEGER NOT NULL DEFAULT 0,
    total_rows               INTEGER NOT NULL DEFAULT 0,
    error_message            TEXT,
    source_connection_status TEXT,
    target_connection_status TEXT,
    connection_check_time    TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_profile ON migration_runs (profile_id, started_at);

CREATE TABLE IF NOT EXISTS checkpoints (
    run_id            INTEGER NOT NULL REFERENCES migration_runs(id) ON DELETE CASCADE,
    partition_name    TEXT NOT NULL,
    seq               INTEGER NOT NULL,
    status            TEXT NOT NULL DEFAULT 'pending',
    rows_copied       INTEGER NOT NULL DEFAULT 0,
    last_offset       INTEGER NOT NULL DEFAULT 0,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    engine            TEXT NOT NULL,
    error_message     TEXT,
    updated_at        TEXT NOT NULL,
    PRIMARY KEY (run_id, partition_name)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_seq ON checkpoints (run_id, seq);

CREATE TABLE IF NOT EXISTS logs (
    id         INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    run_id     INTEGER REFERENCES migration_runs(id) ON DELETE CASCADE,
    ts         TEXT NOT NULL,
    level      TEXT NOT NULL,
    component  TEXT NOT NULL,
    message    TEXT NOT NULL,
    context    TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_session ON logs (session_id, ts);
";

/// Handle over the embedded store. Cheap to clone; all clones share the
/// single writer connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (and if necessary creates) the store at `path`.
    pub fn open(path: &Path) -> Result<Store> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Store> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Store> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = wal;
             PRAGMA synchronous = normal;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Unit-of-work: begin, run the closure, commit on `Ok`, roll back on
    /// `Err`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| MigrationError::Store("store mutex poisoned".to_string()))?;
        let tx = guard.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-only access on the shared connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| MigrationError::Store("store mutex poisoned".to_string()))?;
        f(&guard).map_err(Into::into)
    }
}

/// RFC 3339 text form used for every timestamp column.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let store = Store::open_in_memory().unwrap();
        let n: i64 = store
            .with_conn(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert!(n >= 4);
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO profiles (name, source_config, target_config, created_at, updated_at)
                 VALUES ('x', 's', 't', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                [],
            )?;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert!(result.is_err());

        let n: i64 = store
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_open_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("migration.db");
        {
            let store = Store::open(&path).unwrap();
            store
                .with_tx(|tx| {
                    tx.execute(
                        "INSERT INTO profiles (name, source_config, target_config, created_at, updated_at)
                         VALUES ('p', 's', 't', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
                        [],
                    )
                })
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        let n: i64 = store
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_ts_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&format_ts(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
