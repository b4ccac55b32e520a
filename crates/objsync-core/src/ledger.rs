//! Commit ledger: one durable head pointer per logical stream

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{CommitId, StreamKey};

/// Issues and reads commit ids per stream
pub trait CommitLedger {
    /// Latest commit id assigned in `stream` (`CommitId::ZERO` if none)
    fn head(&self, stream: &StreamKey) -> Result<CommitId>;

    /// Assign the next commit id in `stream`.
    ///
    /// Callers run this inside the same transaction that writes the changed
    /// row, so an id never becomes visible before the row it belongs to.
    fn allocate(&self, stream: &StreamKey) -> Result<CommitId>;

    /// Every stream and its head, ordered by key
    fn heads(&self) -> Result<Vec<(String, CommitId)>>;
}

/// `SQLite` implementation of `CommitLedger`
pub struct SqliteCommitLedger<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCommitLedger<'a> {
    /// Create a new ledger with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CommitLedger for SqliteCommitLedger<'_> {
    fn head(&self, stream: &StreamKey) -> Result<CommitId> {
        let head = self
            .conn
            .query_row(
                "SELECT head_commit_id FROM object_sync_commit_heads WHERE type_key = ?1",
                params![stream.ledger_key()],
                |row| row.get::<_, CommitId>(0),
            )
            .optional()?;
        Ok(head.unwrap_or(CommitId::ZERO))
    }

    fn allocate(&self, stream: &StreamKey) -> Result<CommitId> {
        let commit_id = self.conn.query_row(
            "INSERT INTO object_sync_commit_heads (type_key, head_commit_id) VALUES (?1, 1)
             ON CONFLICT(type_key) DO UPDATE SET head_commit_id = head_commit_id + 1
             RETURNING head_commit_id",
            params![stream.ledger_key()],
            |row| row.get::<_, CommitId>(0),
        )?;
        tracing::trace!(stream = %stream.ledger_key(), %commit_id, "allocated commit id");
        Ok(commit_id)
    }

    fn heads(&self) -> Result<Vec<(String, CommitId)>> {
        let mut stmt = self.conn.prepare(
            "SELECT type_key, head_commit_id FROM object_sync_commit_heads ORDER BY type_key",
        )?;
        let heads = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(heads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn head_of_unknown_stream_is_zero() {
        let db = Database::open_in_memory().unwrap();
        let ledger = SqliteCommitLedger::new(db.connection());
        assert_eq!(ledger.head(&StreamKey::entity("task")).unwrap(), CommitId::ZERO);
    }

    #[test]
    fn allocate_is_strictly_increasing_per_stream() {
        let db = Database::open_in_memory().unwrap();
        let ledger = SqliteCommitLedger::new(db.connection());
        let tasks = StreamKey::entity("task");
        let folders = StreamKey::grouping("email_message", "mailbox_id");

        assert_eq!(ledger.allocate(&tasks).unwrap(), CommitId::new(1));
        assert_eq!(ledger.allocate(&tasks).unwrap(), CommitId::new(2));
        assert_eq!(ledger.allocate(&folders).unwrap(), CommitId::new(1));
        assert_eq!(ledger.head(&tasks).unwrap(), CommitId::new(2));

        assert_eq!(
            ledger.heads().unwrap(),
            vec![
                ("email_message/mailbox_id".to_string(), CommitId::new(1)),
                ("task".to_string(), CommitId::new(2)),
            ]
        );
    }

    #[test]
    fn filter_hash_reads_the_base_stream_head() {
        let db = Database::open_in_memory().unwrap();
        let ledger = SqliteCommitLedger::new(db.connection());
        let base = StreamKey::grouping("email_message", "mailbox_id");
        ledger.allocate(&base).unwrap();

        let filtered = base.clone().with_filter_hash("abcd");
        assert_eq!(ledger.head(&filtered).unwrap(), CommitId::new(1));
    }

    #[test]
    fn ids_survive_reopen_and_are_unique_across_workers() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ledger.db");
        Database::open(&path).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let db = Database::open(&path).unwrap();
                    let ledger = SqliteCommitLedger::new(db.connection());
                    (0..25)
                        .map(|_| ledger.allocate(&StreamKey::entity("task")).unwrap().value())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<i64> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());

        let db = Database::open(&path).unwrap();
        let ledger = SqliteCommitLedger::new(db.connection());
        assert_eq!(ledger.allocate(&StreamKey::entity("task")).unwrap(), CommitId::new(101));
    }
}
