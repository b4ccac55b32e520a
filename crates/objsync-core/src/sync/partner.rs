//! Partner registry: partners and their collections

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{is_constraint_violation, Error, Result};
use crate::models::{
    CollectionKind, CollectionRecord, CollectionSpec, CommitId, Conditions, Partner,
};
use crate::util::unix_millis_now;

const COLLECTION_COLUMNS: &str = "id, type, partner_id, object_type, field_name, conditions,
    f_initialized, ts_init_started, revision, last_commit_id, stale_checked_commit_id";

/// Trait for partner and collection storage operations
pub trait PartnerRegistry {
    /// Fetch the partner with the given key, creating it on first sight
    fn get_or_create(&self, pid: &str, owner_id: &str) -> Result<Partner>;

    /// Get a partner by key
    fn get(&self, pid: &str) -> Result<Option<Partner>>;

    /// Get a partner by row id
    fn get_by_id(&self, id: i64) -> Result<Option<Partner>>;

    /// All partners ordered by key
    fn list(&self) -> Result<Vec<Partner>>;

    /// Partners owned by a principal
    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Partner>>;

    /// Record a successful sync now
    fn touch_last_sync(&self, partner_id: i64) -> Result<bool>;

    /// Remove a partner with all its collections and sync bookkeeping
    fn delete(&self, pid: &str) -> Result<bool>;

    /// Fetch the collection for `spec`, creating it lazily
    fn ensure_collection(&self, partner_id: i64, spec: &CollectionSpec) -> Result<CollectionRecord>;

    /// Get a collection by id
    fn get_collection(&self, id: i64) -> Result<Option<CollectionRecord>>;

    /// Collections of a partner ordered by id
    fn list_collections(&self, partner_id: i64) -> Result<Vec<CollectionRecord>>;

    /// Remove one collection and its bookkeeping
    fn remove_collection(&self, id: i64) -> Result<bool>;
}

/// `SQLite` implementation of `PartnerRegistry`
pub struct SqlitePartnerRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> SqlitePartnerRegistry<'a> {
    /// Create a new registry with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_partner(row: &Row<'_>) -> rusqlite::Result<Partner> {
        Ok(Partner {
            id: row.get(0)?,
            pid: row.get(1)?,
            owner_id: row.get(2)?,
            last_sync: row.get(3)?,
        })
    }

    fn query_partners(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Partner>> {
        let mut stmt = self.conn.prepare(sql)?;
        let partners = stmt
            .query_map(params, Self::parse_partner)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(partners)
    }

    fn find_collection(&self, partner_id: i64, spec: &CollectionSpec) -> Result<Option<CollectionRecord>> {
        let sql = format!(
            "SELECT {COLLECTION_COLUMNS} FROM object_sync_partner_collections
             WHERE partner_id = ?1 AND type = ?2 AND object_type = ?3
               AND COALESCE(field_name, '') = ?4 AND conditions_hash = ?5"
        );
        self.conn
            .query_row(
                &sql,
                params![
                    partner_id,
                    spec.kind.type_code(),
                    spec.object_type,
                    spec.kind.field_name().unwrap_or_default(),
                    spec.conditions.hash()
                ],
                CollectionRow::from_row,
            )
            .optional()?
            .map(CollectionRow::into_record)
            .transpose()
    }
}

impl PartnerRegistry for SqlitePartnerRegistry<'_> {
    fn get_or_create(&self, pid: &str, owner_id: &str) -> Result<Partner> {
        if pid.trim().is_empty() {
            return Err(Error::InvalidInput("partner key must not be empty".into()));
        }

        let inserted = self.conn.execute(
            "INSERT INTO object_sync_partners (pid, owner_id) VALUES (?1, ?2)
             ON CONFLICT(pid) DO NOTHING",
            params![pid, owner_id],
        )?;
        if inserted > 0 {
            tracing::info!(pid, owner_id, "partner registered");
        }

        let partner = self
            .get(pid)?
            .ok_or_else(|| Error::NotFound(format!("partner {pid}")))?;
        if partner.owner_id != owner_id {
            tracing::warn!(pid, owner = %partner.owner_id, requested = owner_id, "partner owned by another principal");
        }
        Ok(partner)
    }

    fn get(&self, pid: &str) -> Result<Option<Partner>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, pid, owner_id, ts_last_sync FROM object_sync_partners WHERE pid = ?1",
                params![pid],
                Self::parse_partner,
            )
            .optional()?)
    }

    fn get_by_id(&self, id: i64) -> Result<Option<Partner>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, pid, owner_id, ts_last_sync FROM object_sync_partners WHERE id = ?1",
                params![id],
                Self::parse_partner,
            )
            .optional()?)
    }

    fn list(&self) -> Result<Vec<Partner>> {
        self.query_partners(
            "SELECT id, pid, owner_id, ts_last_sync FROM object_sync_partners ORDER BY pid",
            [],
        )
    }

    fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Partner>> {
        self.query_partners(
            "SELECT id, pid, owner_id, ts_last_sync FROM object_sync_partners
             WHERE owner_id = ?1 ORDER BY pid",
            params![owner_id],
        )
    }

    fn touch_last_sync(&self, partner_id: i64) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE object_sync_partners SET ts_last_sync = ?1 WHERE id = ?2",
            params![unix_millis_now(), partner_id],
        )?;
        Ok(updated > 0)
    }

    fn delete(&self, pid: &str) -> Result<bool> {
        // Collections, import records, export log and init rows cascade
        let deleted = self
            .conn
            .execute("DELETE FROM object_sync_partners WHERE pid = ?1", params![pid])?;
        if deleted > 0 {
            tracing::info!(pid, "partner deleted");
        }
        Ok(deleted > 0)
    }

    fn ensure_collection(&self, partner_id: i64, spec: &CollectionSpec) -> Result<CollectionRecord> {
        spec.conditions.validate_shape()?;
        if spec.object_type.trim().is_empty() {
            return Err(Error::InvalidInput("object type must not be empty".into()));
        }

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO object_sync_partner_collections
                    (type, partner_id, object_type, field_name, conditions, conditions_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    spec.kind.type_code(),
                    partner_id,
                    spec.object_type,
                    spec.kind.field_name(),
                    spec.conditions.to_json()?,
                    spec.conditions.hash()
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    Error::NotFound(format!("partner {partner_id}"))
                } else {
                    e.into()
                }
            })?;
        if inserted > 0 {
            tracing::info!(
                partner_id,
                stream = %spec.stream_key(),
                "collection created"
            );
        }

        self.find_collection(partner_id, spec)?
            .ok_or_else(|| Error::NotFound(format!("collection for partner {partner_id}")))
    }

    fn get_collection(&self, id: i64) -> Result<Option<CollectionRecord>> {
        load_collection(self.conn, id)
    }

    fn list_collections(&self, partner_id: i64) -> Result<Vec<CollectionRecord>> {
        let sql = format!(
            "SELECT {COLLECTION_COLUMNS} FROM object_sync_partner_collections
             WHERE partner_id = ?1 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![partner_id], CollectionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(CollectionRow::into_record).collect()
    }

    fn remove_collection(&self, id: i64) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM object_sync_partner_collections WHERE id = ?1",
            params![id],
        )?;
        if deleted > 0 {
            tracing::info!(collection_id = id, "collection removed");
        }
        Ok(deleted > 0)
    }
}

/// Load one collection record
pub(crate) fn load_collection(conn: &Connection, id: i64) -> Result<Option<CollectionRecord>> {
    let sql = format!("SELECT {COLLECTION_COLUMNS} FROM object_sync_partner_collections WHERE id = ?1");
    conn.query_row(&sql, params![id], CollectionRow::from_row)
        .optional()?
        .map(CollectionRow::into_record)
        .transpose()
}

/// Raw collection row before the typed fields are decoded
struct CollectionRow {
    id: i64,
    type_code: i64,
    partner_id: i64,
    object_type: String,
    field_name: Option<String>,
    conditions: String,
    initialized: bool,
    init_started_at: Option<i64>,
    revision: i64,
    last_commit_id: CommitId,
    stale_checked_commit_id: CommitId,
}

impl CollectionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            type_code: row.get(1)?,
            partner_id: row.get(2)?,
            object_type: row.get(3)?,
            field_name: row.get(4)?,
            conditions: row.get(5)?,
            initialized: row.get(6)?,
            init_started_at: row.get(7)?,
            revision: row.get(8)?,
            last_commit_id: row.get(9)?,
            stale_checked_commit_id: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<CollectionRecord> {
        Ok(CollectionRecord {
            id: self.id,
            partner_id: self.partner_id,
            spec: CollectionSpec {
                kind: CollectionKind::from_row(self.type_code, self.field_name)?,
                object_type: self.object_type,
                conditions: Conditions::from_json(&self.conditions)?,
            },
            last_commit_id: self.last_commit_id,
            revision: self.revision,
            initialized: self.initialized,
            init_started_at: self.init_started_at,
            stale_checked_commit_id: self.stale_checked_commit_id,
        })
    }
}
