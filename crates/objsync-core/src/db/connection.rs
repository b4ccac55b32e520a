//! Database connection management

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::migrations;
use crate::config::SyncConfig;
use crate::error::Result;

/// Database wrapper owning one SQLite connection.
///
/// Each worker thread opens its own `Database` against the same file; SQLite
/// serializes writers and `busy_timeout` makes them queue.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, SyncConfig::default().busy_timeout)
    }

    /// Open a database at the given path with an explicit busy timeout
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let database = Self { conn };
        database.configure(busy_timeout)?;
        database.migrate()?;
        Ok(database)
    }

    /// Open the database described by `config` (in-memory when no path is set)
    pub fn open_config(config: &SyncConfig) -> Result<Self> {
        match &config.database_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Self::open_with_timeout(path, config.busy_timeout)
            }
            None => Self::open_in_memory(),
        }
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let database = Self { conn };
        database.configure(SyncConfig::default().busy_timeout)?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for concurrent workers
    fn configure(&self, busy_timeout: Duration) -> Result<()> {
        // WAL is not available for in-memory databases; ignore the refusal.
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .ok();
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(busy_timeout)?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Begin a write transaction that takes the database write lock up front.
///
/// Taking the lock at `BEGIN` instead of at the first write keeps two workers
/// from both reading a watermark and then failing to upgrade.
pub(crate) fn begin_write(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(
        conn,
        TransactionBehavior::Immediate,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let value: i64 = db
            .connection()
            .query_row("SELECT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_open_file_twice_shares_schema() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("sync.db");
        let config = SyncConfig::default().with_database_path(&path);

        let first = Database::open_config(&config).unwrap();
        first
            .connection()
            .execute(
                "INSERT INTO object_sync_partners (pid, owner_id, ts_last_sync) VALUES ('p', 'o', 0)",
                [],
            )
            .unwrap();

        let second = Database::open_config(&config).unwrap();
        let count: i64 = second
            .connection()
            .query_row("SELECT COUNT(*) FROM object_sync_partners", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_begin_write_rolls_back_on_drop() {
        let db = Database::open_in_memory().unwrap();
        {
            let tx = begin_write(db.connection()).unwrap();
            tx.execute(
                "INSERT INTO object_sync_partners (pid, owner_id, ts_last_sync) VALUES ('p', 'o', 0)",
                [],
            )
            .unwrap();
        }
        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM object_sync_partners", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
