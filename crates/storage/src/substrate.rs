//! The embedded SQL substrate: a thin wrapper around one SQLite
//! connection that exposes only `begin`/`commit`/`rollback`/
//! `prepared_statement`/`exec_batch` plus schema migration at open time.
//!
//! Nothing outside this module issues SQL directly — every other part of
//! the storage engine goes through [`SqlSubstrate`], so the substrate
//! itself could be swapped for a different embedded SQL engine without
//! touching callers.

use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vectors (
    id              TEXT PRIMARY KEY,
    shard_id        TEXT NOT NULL,
    embedding_bytes BLOB NOT NULL,
    metadata_bytes  BLOB,
    timestamp_us    INTEGER NOT NULL,
    seq             INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vectors_shard_seq ON vectors(shard_id, seq);

CREATE TABLE IF NOT EXISTS hnsw_nodes (
    shard_id        TEXT NOT NULL,
    node_id         INTEGER NOT NULL,
    vector_id       TEXT NOT NULL,
    level           INTEGER NOT NULL,
    embedding_bytes BLOB NOT NULL,
    PRIMARY KEY (shard_id, node_id)
);

CREATE TABLE IF NOT EXISTS hnsw_edges (
    shard_id  TEXT NOT NULL,
    from_id   INTEGER NOT NULL,
    to_id     INTEGER NOT NULL,
    level     INTEGER NOT NULL,
    distance  REAL NOT NULL,
    PRIMARY KEY (shard_id, from_id, to_id, level)
);

CREATE TABLE IF NOT EXISTS hnsw_metadata (
    shard_id TEXT NOT NULL,
    key      TEXT NOT NULL,
    value    TEXT NOT NULL,
    PRIMARY KEY (shard_id, key)
);

CREATE TABLE IF NOT EXISTS quantizer_state (
    shard_id   TEXT NOT NULL,
    codec_name TEXT NOT NULL,
    state_blob BLOB NOT NULL,
    PRIMARY KEY (shard_id, codec_name)
);

CREATE TABLE IF NOT EXISTS changelog (
    change_id           INTEGER NOT NULL,
    shard_id            TEXT NOT NULL,
    vector_id           TEXT NOT NULL,
    op                  TEXT NOT NULL,
    embedding_bytes     BLOB,
    metadata_bytes      BLOB,
    source_node         TEXT NOT NULL,
    timestamp_us        INTEGER NOT NULL,
    version_vector_bytes BLOB NOT NULL,
    PRIMARY KEY (shard_id, change_id)
);

CREATE TABLE IF NOT EXISTS sync_session (
    key  TEXT PRIMARY KEY,
    blob BLOB NOT NULL
);
"#;

/// A locked handle to the one embedded SQL connection backing a
/// database. Every operation takes the connection's mutex for its
/// duration; SQLite's own file locking handles cross-process concerns,
/// this mutex only serializes concurrent use within one process.
pub struct SqlSubstrate {
    conn: Mutex<Connection>,
}

impl SqlSubstrate {
    /// Open (and, if necessary, create and migrate) the database at
    /// `path`, or an in-memory database if `path` is `None`.
    pub fn open(path: Option<&Path>) -> StorageResult<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqlSubstrate {
            conn: Mutex::new(conn),
        })
    }

    /// Begin a transaction. Pairs with [`Self::commit`] or
    /// [`Self::rollback`].
    pub fn begin(&self) -> StorageResult<()> {
        self.conn.lock().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    /// Commit the current transaction.
    pub fn commit(&self) -> StorageResult<()> {
        self.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the current transaction, discarding its writes.
    pub fn rollback(&self) -> StorageResult<()> {
        self.conn.lock().execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Run `sql` as a batch of one or more statements with no bound
    /// parameters and no transaction management of its own.
    pub fn exec_batch(&self, sql: &str) -> StorageResult<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Prepare `sql` and run `body` against it, with the connection held
    /// locked for the duration. This is the seam every higher-level
    /// `ShardStorage` operation goes through instead of touching
    /// `rusqlite` directly.
    pub fn prepared_statement<T>(
        &self,
        sql: &str,
        body: impl FnOnce(&mut rusqlite::Statement<'_>) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        Ok(body(&mut stmt)?)
    }

    /// Run `body` inside a `begin`/`commit` pair, rolling back and
    /// propagating the error if `body` fails. Convenience built entirely
    /// from the five primitives above; nothing here is substrate-specific.
    pub fn transaction<T>(
        &self,
        body: impl FnOnce(&Self) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.begin()?;
        match body(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Best-effort: if rollback itself fails the connection is
                // in a state the original error already explains.
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    /// Run `body` with direct, locked access to the underlying
    /// connection. Used by operations (e.g. row-level reads within an
    /// open transaction) that need more than a single prepared statement.
    pub fn with_connection<T>(
        &self,
        body: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let conn = self.conn.lock();
        Ok(body(&conn).map_err(StorageError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_schema() {
        let substrate = SqlSubstrate::open(None).unwrap();
        substrate
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='vectors'",
                    [],
                    |row| row.get::<_, i64>(0),
                )
            })
            .map(|count| assert_eq!(count, 1))
            .unwrap();
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let substrate = SqlSubstrate::open(None).unwrap();
        let result: StorageResult<()> = substrate.transaction(|s| {
            s.exec_batch(
                "INSERT INTO sync_session (key, blob) VALUES ('k', X'00')",
            )?;
            Err(StorageError::TransactionFailed("forced".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = substrate
            .with_connection(|conn| {
                conn.query_row("SELECT count(*) FROM sync_session", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn transaction_commits_on_success() {
        let substrate = SqlSubstrate::open(None).unwrap();
        substrate
            .transaction(|s| {
                s.exec_batch("INSERT INTO sync_session (key, blob) VALUES ('k', X'00')")
            })
            .unwrap();

        let count: i64 = substrate
            .with_connection(|conn| {
                conn.query_row("SELECT count(*) FROM sync_session", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);
    }
}
