use crate::error::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Handle to the relational store shared by all coordinator processes.
///
/// The store is the single writer-of-record; its uniqueness constraints are
/// the only cross-process serialization points. Every operation opens its
/// own connection, so the handle is cheap to clone and holds no open state.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        // Registry of claimable resources. Canonical id plus a name alias
        // scoped by kind.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (kind, name)
            )",
            [],
        )?;

        // At most one live row per resource_id; the unique index is the
        // arbiter for racing claim attempts.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS claims (
                resource_id INTEGER NOT NULL UNIQUE,
                master_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS builders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS builds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                builder_id INTEGER NOT NULL,
                number INTEGER NOT NULL,
                UNIQUE (builder_id, number)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id INTEGER NOT NULL,
                number INTEGER NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (build_id, number),
                UNIQUE (build_id, name)
            )",
            [],
        )?;

        // Slug is unique within its parent step, not globally.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                slug TEXT NOT NULL,
                step_id INTEGER NOT NULL,
                complete INTEGER NOT NULL DEFAULT 0,
                num_lines INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL,
                UNIQUE (step_id, slug)
            )",
            [],
        )?;

        // Append-only chunk rows; content holds the raw joined lines, or
        // the gzip of them once the compactor has visited the row.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS logchunks (
                log_id INTEGER NOT NULL,
                first_line INTEGER NOT NULL,
                last_line INTEGER NOT NULL,
                content BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_logchunks_log_id
             ON logchunks(log_id, first_line)",
            [],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Db::open(temp_dir.path().join("kiln.db")).unwrap();

        // Re-opening must be idempotent.
        let db2 = Db::open(temp_dir.path().join("kiln.db")).unwrap();

        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('resources', 'claims', 'builders', 'builds', 'steps', 'logs', 'logchunks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 7);
        drop(db2);
    }
}
