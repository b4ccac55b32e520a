//! Entity query facade
//!
//! Sync collections only need three things from the entity store: field
//! validation for filters, "what changed after this watermark" and "which of
//! these ids does the filter still match". `SqliteEntityStore` implements that
//! contract over a generic `sync_objects` table and is also the writer that
//! assigns commit ids.

use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::db::begin_write;
use crate::error::{Error, Result};
use crate::ledger::{CommitLedger, SqliteCommitLedger};
use crate::models::{ChangedRow, CommitId, Conditions, StreamKey};

const ID_CHUNK: usize = 500;

/// Read contract the sync collections consume
pub trait EntityQuery {
    /// Reject conditions that reference fields the stream does not have
    fn validate_conditions(&self, stream: &StreamKey, conditions: &Conditions) -> Result<()>;

    /// Rows with `watermark < commit_id <= up_to` matching `conditions`,
    /// in ascending commit order, at most `limit` of them
    fn changed_since(
        &self,
        stream: &StreamKey,
        watermark: CommitId,
        up_to: CommitId,
        conditions: &Conditions,
        limit: usize,
    ) -> Result<Vec<ChangedRow>>;

    /// The subset of `ids` that exists, is not deleted and matches `conditions`
    fn matching_ids(
        &self,
        stream: &StreamKey,
        ids: &[String],
        conditions: &Conditions,
    ) -> Result<HashSet<String>>;
}

/// An object as stored in the entity store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub id: String,
    pub commit_id: CommitId,
    pub deleted: bool,
    pub parent_id: Option<String>,
    pub fields: Map<String, Value>,
}

/// `SQLite` implementation of `EntityQuery`, plus the write side
pub struct SqliteEntityStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Declare fields for a stream so filters may reference them
    pub fn register_fields(&self, stream: &StreamKey, fields: &[&str]) -> Result<()> {
        for field in fields {
            self.conn.execute(
                "INSERT OR IGNORE INTO sync_object_fields (stream, name) VALUES (?1, ?2)",
                params![stream.ledger_key(), field],
            )?;
        }
        Ok(())
    }

    /// Known fields of a stream
    pub fn fields(&self, stream: &StreamKey) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sync_object_fields WHERE stream = ?1")?;
        let fields = stmt
            .query_map(params![stream.ledger_key()], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(fields)
    }

    /// Create or update an object, assigning it the next commit id.
    ///
    /// The commit id allocation and the row write share one transaction.
    pub fn put(
        &self,
        stream: &StreamKey,
        id: &str,
        fields: &Value,
        parent_id: Option<&str>,
    ) -> Result<CommitId> {
        let Value::Object(map) = fields else {
            return Err(Error::InvalidInput(format!(
                "fields of object '{id}' must be a JSON object"
            )));
        };
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("object id must not be empty".into()));
        }

        let tx = begin_write(self.conn)?;
        let commit_id = SqliteCommitLedger::new(&tx).allocate(stream)?;
        tx.execute(
            "INSERT INTO sync_objects (stream, id, commit_id, is_deleted, parent_id, fields)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             ON CONFLICT(stream, id) DO UPDATE SET
                commit_id = excluded.commit_id,
                is_deleted = 0,
                parent_id = excluded.parent_id,
                fields = excluded.fields",
            params![
                stream.ledger_key(),
                id,
                commit_id,
                parent_id,
                serde_json::to_string(map)?
            ],
        )?;
        for field in map.keys() {
            tx.execute(
                "INSERT OR IGNORE INTO sync_object_fields (stream, name) VALUES (?1, ?2)",
                params![stream.ledger_key(), field],
            )?;
        }
        tx.commit()?;

        tracing::debug!(stream = %stream.ledger_key(), id, %commit_id, "object committed");
        Ok(commit_id)
    }

    /// Soft delete an object, assigning the deletion its own commit id.
    ///
    /// Returns `None` if the object does not exist or is already deleted.
    pub fn delete(&self, stream: &StreamKey, id: &str) -> Result<Option<CommitId>> {
        let tx = begin_write(self.conn)?;
        let live: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_objects WHERE stream = ?1 AND id = ?2 AND is_deleted = 0)",
            params![stream.ledger_key(), id],
            |row| row.get(0),
        )?;
        if !live {
            return Ok(None);
        }

        let commit_id = SqliteCommitLedger::new(&tx).allocate(stream)?;
        tx.execute(
            "UPDATE sync_objects SET is_deleted = 1, commit_id = ?3 WHERE stream = ?1 AND id = ?2",
            params![stream.ledger_key(), id, commit_id],
        )?;
        tx.commit()?;

        tracing::debug!(stream = %stream.ledger_key(), id, %commit_id, "object deleted");
        Ok(Some(commit_id))
    }

    /// Fetch an object, deleted or not
    pub fn get(&self, stream: &StreamKey, id: &str) -> Result<Option<StoredObject>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, commit_id, is_deleted, parent_id, fields
                 FROM sync_objects WHERE stream = ?1 AND id = ?2",
                params![stream.ledger_key(), id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, CommitId>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, commit_id, deleted, parent_id, fields)| {
            Ok(StoredObject {
                id,
                commit_id,
                deleted,
                parent_id,
                fields: serde_json::from_str(&fields)?,
            })
        })
        .transpose()
    }
}

impl EntityQuery for SqliteEntityStore<'_> {
    fn validate_conditions(&self, stream: &StreamKey, conditions: &Conditions) -> Result<()> {
        if conditions.is_empty() {
            return Ok(());
        }
        conditions.validate(&self.fields(stream)?)
    }

    fn changed_since(
        &self,
        stream: &StreamKey,
        watermark: CommitId,
        up_to: CommitId,
        conditions: &Conditions,
        limit: usize,
    ) -> Result<Vec<ChangedRow>> {
        let mut sql = String::from(
            "SELECT id, commit_id, is_deleted FROM sync_objects
             WHERE stream = ? AND commit_id > ? AND commit_id <= ?",
        );
        let mut values = vec![
            SqlValue::Text(stream.ledger_key()),
            SqlValue::Integer(watermark.value()),
            SqlValue::Integer(up_to.value()),
        ];
        if let Some((predicate, params)) = conditions.to_sql() {
            sql.push_str(&format!(" AND ({predicate})"));
            values.extend(params);
        }
        sql.push_str(" ORDER BY commit_id ASC LIMIT ?");
        values.push(SqlValue::Integer(sql_limit(limit)));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(ChangedRow {
                    entity_id: row.get(0)?,
                    commit_id: row.get(1)?,
                    deleted: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn matching_ids(
        &self,
        stream: &StreamKey,
        ids: &[String],
        conditions: &Conditions,
    ) -> Result<HashSet<String>> {
        let mut matching = HashSet::new();
        let predicate = conditions.to_sql();

        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut sql = format!(
                "SELECT id FROM sync_objects
                 WHERE stream = ? AND is_deleted = 0 AND id IN ({placeholders})"
            );
            let mut values = vec![SqlValue::Text(stream.ledger_key())];
            values.extend(chunk.iter().cloned().map(SqlValue::Text));
            if let Some((predicate, params)) = &predicate {
                sql.push_str(&format!(" AND ({predicate})"));
                values.extend(params.iter().cloned());
            }

            let mut stmt = self.conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            matching.extend(ids);
        }

        Ok(matching)
    }
}

/// Batch cap as a SQLite `LIMIT`; never negative, which SQLite reads as unlimited
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Operator;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tasks() -> StreamKey {
        StreamKey::entity("task")
    }

    fn ids(rows: &[ChangedRow]) -> Vec<&str> {
        rows.iter().map(|row| row.entity_id.as_str()).collect()
    }

    #[test]
    fn put_assigns_increasing_commits() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());

        let first = store.put(&tasks(), "A", &json!({"status": "open"}), None).unwrap();
        let second = store.put(&tasks(), "A", &json!({"status": "closed"}), None).unwrap();
        assert!(second > first);

        let stored = store.get(&tasks(), "A").unwrap().unwrap();
        assert_eq!(stored.commit_id, second);
        assert_eq!(stored.fields["status"], json!("closed"));
    }

    #[test]
    fn put_rejects_non_object_fields() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        assert!(matches!(
            store.put(&tasks(), "A", &json!([1, 2]), None),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn delete_is_a_new_commit_and_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());

        let created = store.put(&tasks(), "A", &json!({}), None).unwrap();
        let deleted = store.delete(&tasks(), "A").unwrap().unwrap();
        assert!(deleted > created);
        assert_eq!(store.delete(&tasks(), "A").unwrap(), None);
        assert_eq!(store.delete(&tasks(), "missing").unwrap(), None);
        assert!(store.get(&tasks(), "A").unwrap().unwrap().deleted);
    }

    #[test]
    fn changed_since_orders_by_commit_and_respects_window() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());

        store.put(&tasks(), "A", &json!({}), None).unwrap(); // 1
        store.put(&tasks(), "B", &json!({}), None).unwrap(); // 2
        store.put(&tasks(), "C", &json!({}), None).unwrap(); // 3
        store.put(&tasks(), "A", &json!({}), None).unwrap(); // 4

        let rows = store
            .changed_since(&tasks(), CommitId::new(1), CommitId::new(3), &Conditions::new(), 10)
            .unwrap();
        assert_eq!(ids(&rows), vec!["B", "C"]);

        let rows = store
            .changed_since(&tasks(), CommitId::ZERO, CommitId::new(4), &Conditions::new(), 2)
            .unwrap();
        assert_eq!(ids(&rows), vec!["B", "C"]);
        assert_eq!(rows[1].commit_id, CommitId::new(3));
    }

    #[test]
    fn changed_since_applies_filters_left_to_right() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());

        store
            .put(&tasks(), "A", &json!({"a": 1, "b": 0, "c": 0}), None)
            .unwrap();
        store
            .put(&tasks(), "B", &json!({"a": 1, "b": 0, "c": 1}), None)
            .unwrap();

        // (a = 1 OR b = 1) AND c = 1, not a = 1 OR (b = 1 AND c = 1)
        let conditions = Conditions::new()
            .and("a", Operator::Equals, 1)
            .or("b", Operator::Equals, 1)
            .and("c", Operator::Equals, 1);
        let rows = store
            .changed_since(&tasks(), CommitId::ZERO, CommitId::new(10), &conditions, 10)
            .unwrap();
        assert_eq!(ids(&rows), vec!["B"]);
    }

    #[test]
    fn string_operators_and_parent_filter() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let folders = StreamKey::grouping("email_message", "mailbox_id");

        store
            .put(&folders, "inbox", &json!({"name": "Inbox"}), None)
            .unwrap();
        store
            .put(&folders, "work", &json!({"name": "Work Projects"}), Some("inbox"))
            .unwrap();

        let begins = Conditions::new().and("name", Operator::BeginsWith, "Work");
        let rows = store
            .changed_since(&folders, CommitId::ZERO, CommitId::new(10), &begins, 10)
            .unwrap();
        assert_eq!(ids(&rows), vec!["work"]);

        let contains = Conditions::new().and("name", Operator::Contains, "box");
        let rows = store
            .changed_since(&folders, CommitId::ZERO, CommitId::new(10), &contains, 10)
            .unwrap();
        assert_eq!(ids(&rows), vec!["inbox"]);

        let children = Conditions::new().and("parent_id", Operator::Equals, "inbox");
        let rows = store
            .changed_since(&folders, CommitId::ZERO, CommitId::new(10), &children, 10)
            .unwrap();
        assert_eq!(ids(&rows), vec!["work"]);
    }

    #[test]
    fn validate_conditions_uses_written_fields() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        store.register_fields(&tasks(), &["status"]).unwrap();
        store
            .put(&tasks(), "A", &json!({"assignee": "U1"}), None)
            .unwrap();

        let known = Conditions::new()
            .and("status", Operator::Equals, "open")
            .and("assignee", Operator::Equals, "U1");
        assert!(store.validate_conditions(&tasks(), &known).is_ok());

        let unknown = Conditions::new().and("priority", Operator::Equals, 1);
        assert!(matches!(
            store.validate_conditions(&tasks(), &unknown),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn matching_ids_excludes_deleted_and_filtered() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());

        store.put(&tasks(), "A", &json!({"assignee": "U1"}), None).unwrap();
        store.put(&tasks(), "B", &json!({"assignee": "U2"}), None).unwrap();
        store.put(&tasks(), "C", &json!({"assignee": "U1"}), None).unwrap();
        store.delete(&tasks(), "C").unwrap();

        let conditions = Conditions::new().and("assignee", Operator::Equals, "U1");
        let candidates: Vec<String> = ["A", "B", "C", "Z"].iter().map(ToString::to_string).collect();
        let matching = store
            .matching_ids(&tasks(), &candidates, &conditions)
            .unwrap();
        assert_eq!(matching, ["A".to_string()].into_iter().collect());
    }

    #[test]
    fn oversized_limit_stays_a_cap() {
        assert_eq!(sql_limit(250), 250);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
