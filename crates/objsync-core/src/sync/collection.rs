//! Sync collections
//!
//! A collection binds one partner to one filtered stream and carries the
//! watermark (`last_commit_id`) of what the partner has acknowledged. Entity
//! and grouping collections share this type; kind specific behavior switches
//! on `CollectionKind`.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use super::cache::{head_key, NoRevisionCache, RevisionCache};
use super::partner::load_collection;
use crate::config::SyncConfig;
use crate::db::begin_write;
use crate::diff::{classify_rows, diff_snapshots, stale_deletes, SnapshotEntry};
use crate::entity::EntityQuery;
use crate::error::{is_constraint_violation, Error, Result};
use crate::ledger::{CommitLedger, SqliteCommitLedger};
use crate::models::{
    ChangeAction, CollectionKind, CollectionRecord, CommitId, Conditions, ExportStat, ImportRecord,
    ImportStat, InitState, ManifestEntry, StreamKey,
};
use crate::util::unix_millis_now;

static NO_CACHE: NoRevisionCache = NoRevisionCache;

/// One partner's view of a stream
pub struct SyncCollection<'a> {
    conn: &'a Connection,
    entities: &'a dyn EntityQuery,
    cache: &'a dyn RevisionCache,
    record: CollectionRecord,
    stale_check: bool,
}

impl<'a> SyncCollection<'a> {
    /// Wrap a loaded collection record
    pub fn new(conn: &'a Connection, entities: &'a dyn EntityQuery, record: CollectionRecord) -> Self {
        Self {
            conn,
            entities,
            cache: &NO_CACHE,
            record,
            stale_check: true,
        }
    }

    /// Load a collection by id
    pub fn open(conn: &'a Connection, entities: &'a dyn EntityQuery, id: i64) -> Result<Self> {
        let record =
            load_collection(conn, id)?.ok_or_else(|| Error::NotFound(format!("collection {id}")))?;
        Ok(Self::new(conn, entities, record))
    }

    /// Use a revision cache for `changes_exist` probes
    #[must_use]
    pub fn with_cache(mut self, cache: &'a dyn RevisionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Enable or disable stale reconciliation
    #[must_use]
    pub fn with_stale_check(mut self, enabled: bool) -> Self {
        self.stale_check = enabled;
        self
    }

    /// Apply engine configuration
    #[must_use]
    pub fn configured(self, config: &SyncConfig) -> Self {
        self.with_stale_check(config.stale_check)
    }

    pub const fn record(&self) -> &CollectionRecord {
        &self.record
    }

    pub const fn id(&self) -> i64 {
        self.record.id
    }

    pub fn stream_key(&self) -> StreamKey {
        self.record.spec.stream_key()
    }

    pub const fn init_state(&self) -> InitState {
        self.record.init_state()
    }

    /// Re-read the persisted record
    pub fn reload(&mut self) -> Result<()> {
        self.record = load_collection(self.conn, self.record.id)?
            .ok_or_else(|| Error::NotFound(format!("collection {}", self.record.id)))?;
        Ok(())
    }

    /// Changes the partner has not acknowledged yet, at most `limit` of them.
    ///
    /// Committed rows come first, in commit order. Only when there are none
    /// does the pass look for stale records, which are returned as deletes.
    pub fn compute_export_changes(&mut self, limit: usize) -> Result<Vec<ExportStat>> {
        if limit == 0 {
            return Err(Error::InvalidInput("export limit must be greater than zero".into()));
        }

        self.reload()?;
        self.mark_init_started()?;

        let stream = self.stream_key();
        let head = self.head(&stream)?;
        let last = self.record.last_commit_id;

        if head > last {
            let conditions = &self.record.spec.conditions;
            self.entities.validate_conditions(&stream, conditions)?;
            let rows = self
                .entities
                .changed_since(&stream, last, head, conditions, limit)?;
            if !rows.is_empty() {
                tracing::debug!(
                    collection_id = self.record.id,
                    %last,
                    %head,
                    count = rows.len(),
                    "export changes"
                );
                return Ok(classify_rows(rows));
            }

            // Nothing in (last, head] matches the filter
            self.advance_to(head)?;
        }

        if self.should_reconcile(head) {
            let stale = self.reconcile_stale(&stream, head, limit)?;
            if !stale.is_empty() {
                return Ok(stale);
            }
        }

        if !self.record.initialized {
            self.mark_initialized(None)?;
        }
        Ok(Vec::new())
    }

    /// Record that the partner applied `stat`.
    ///
    /// Writes the export log and, for committed rows, advances the watermark
    /// to the row's commit id, both in one transaction. Re-acknowledging the
    /// current watermark is a no-op; acknowledging below it means another
    /// worker got further and yields `ConcurrentAdvance`.
    pub fn acknowledge(&mut self, stat: &ExportStat) -> Result<()> {
        let tx = begin_write(self.conn)?;

        if stat.advances_watermark() {
            let advanced = tx.execute(
                "UPDATE object_sync_partner_collections SET last_commit_id = ?1
                 WHERE id = ?2 AND last_commit_id < ?1",
                params![stat.commit_id, self.record.id],
            )?;
            if advanced == 0 {
                let stored: CommitId = tx
                    .query_row(
                        "SELECT last_commit_id FROM object_sync_partner_collections WHERE id = ?1",
                        params![self.record.id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .ok_or_else(|| Error::NotFound(format!("collection {}", self.record.id)))?;
                if stored > stat.commit_id {
                    drop(tx);
                    self.record.last_commit_id = stored;
                    tracing::warn!(
                        collection_id = self.record.id,
                        %stored,
                        attempted = %stat.commit_id,
                        "watermark advanced concurrently"
                    );
                    return Err(Error::ConcurrentAdvance {
                        collection_id: self.record.id,
                        stored: stored.value(),
                        attempted: stat.commit_id.value(),
                    });
                }
            }
        }

        tx.execute(
            "INSERT INTO object_sync_export (collection_id, object_id, commit_id, action, ts_exported)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(collection_id, object_id) DO UPDATE SET
                commit_id = excluded.commit_id,
                action = excluded.action,
                ts_exported = excluded.ts_exported",
            params![
                self.record.id,
                stat.entity_id,
                stat.commit_id,
                stat.action.as_str(),
                unix_millis_now()
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::NotFound(format!("collection {}", self.record.id))
            } else {
                e.into()
            }
        })?;
        tx.commit()?;

        if stat.advances_watermark() {
            self.record.last_commit_id = self.record.last_commit_id.max(stat.commit_id);
        }
        tracing::debug!(
            collection_id = self.record.id,
            entity_id = %stat.entity_id,
            action = %stat.action,
            commit_id = %stat.commit_id,
            "export acknowledged"
        );
        Ok(())
    }

    /// Diff a remote manifest against the persisted import records.
    ///
    /// Revisions of changed and new objects are stored and vanished objects
    /// are forgotten in the same transaction, so repeating the call with the
    /// same manifest yields nothing. An empty diff completes initialization
    /// for `parent_id`.
    pub fn compute_import_changes(
        &mut self,
        manifest: &[ManifestEntry],
        parent_id: Option<&str>,
    ) -> Result<Vec<ImportStat>> {
        self.mark_init_started()?;

        let parent = parent_id.unwrap_or_default();
        let field = self.record.spec.kind.field_name().unwrap_or_default().to_string();
        let tx = begin_write(self.conn)?;

        let persisted = {
            let mut stmt = tx.prepare(
                "SELECT unique_id, object_id, revision FROM object_sync_import
                 WHERE collection_id = ?1 AND parent_id = ?2 AND field_name = ?3
                 ORDER BY unique_id",
            )?;
            let rows = stmt
                .query_map(params![self.record.id, parent, field], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let snapshot: Vec<SnapshotEntry> = persisted
            .iter()
            .map(|(unique_id, _, revision)| SnapshotEntry::new(unique_id.clone(), *revision))
            .collect();
        let mut local_ids: HashMap<String, Option<String>> = persisted
            .into_iter()
            .map(|(unique_id, local_id, _)| (unique_id, local_id))
            .collect();
        let fresh: Vec<SnapshotEntry> = manifest.iter().map(SnapshotEntry::from).collect();

        let changes = diff_snapshots(&snapshot, &fresh);
        for change in &changes {
            match (change.action, change.previous) {
                (ChangeAction::Change, Some(_)) => {
                    tx.execute(
                        "UPDATE object_sync_import SET revision = ?1
                         WHERE collection_id = ?2 AND unique_id = ?3 AND field_name = ?4",
                        params![change.revision, self.record.id, change.id, field],
                    )?;
                }
                (ChangeAction::Change, None) => {
                    // An object moved in from another parent keeps its local id
                    let local_id: Option<String> = tx.query_row(
                        "INSERT INTO object_sync_import
                            (collection_id, object_type, unique_id, revision, parent_id, field_name)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(collection_id, unique_id, field_name) DO UPDATE SET
                            revision = excluded.revision,
                            parent_id = excluded.parent_id
                         RETURNING object_id",
                        params![
                            self.record.id,
                            self.record.spec.object_type,
                            change.id,
                            change.revision,
                            parent,
                            field
                        ],
                        |row| row.get(0),
                    )?;
                    local_ids.insert(change.id.clone(), local_id);
                }
                (ChangeAction::Delete, _) => {
                    tx.execute(
                        "DELETE FROM object_sync_import
                         WHERE collection_id = ?1 AND unique_id = ?2 AND field_name = ?3",
                        params![self.record.id, change.id, field],
                    )?;
                }
            }
        }
        tx.commit()?;

        if changes.is_empty() {
            self.mark_initialized(parent_id)?;
        } else {
            tracing::debug!(
                collection_id = self.record.id,
                parent_id = parent,
                count = changes.len(),
                "import changes"
            );
        }

        Ok(changes
            .into_iter()
            .map(|change| ImportStat {
                local_id: local_ids.get(&change.id).cloned().flatten(),
                unique_id: change.id,
                action: change.action,
                revision: change.revision,
            })
            .collect())
    }

    /// Remember which local entity a remote object was imported as
    pub fn set_import_local_id(&self, unique_id: &str, local_id: &str) -> Result<bool> {
        let field = self.record.spec.kind.field_name().unwrap_or_default();
        let updated = self.conn.execute(
            "UPDATE object_sync_import SET object_id = ?1
             WHERE collection_id = ?2 AND unique_id = ?3 AND field_name = ?4",
            params![local_id, self.record.id, unique_id, field],
        )?;
        Ok(updated > 0)
    }

    /// Persisted import records under `parent_id`
    pub fn import_records(&self, parent_id: Option<&str>) -> Result<Vec<ImportRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT object_type, object_id, unique_id, revision, parent_id, field_name
             FROM object_sync_import
             WHERE collection_id = ?1 AND parent_id = ?2
             ORDER BY unique_id",
        )?;
        let records = stmt
            .query_map(params![self.record.id, parent_id.unwrap_or_default()], |row| {
                let parent: String = row.get(4)?;
                let field: String = row.get(5)?;
                Ok(ImportRecord {
                    collection_id: self.record.id,
                    object_type: row.get(0)?,
                    local_id: row.get(1)?,
                    unique_id: row.get(2)?,
                    revision: row.get(3)?,
                    parent_id: (!parent.is_empty()).then_some(parent),
                    field_name: (!field.is_empty()).then_some(field),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Move the watermark to the stream head without exporting anything.
    ///
    /// Only grouping collections support this.
    pub fn fast_forward_to_head(&mut self) -> Result<CommitId> {
        if !matches!(self.record.spec.kind, CollectionKind::Grouping { .. }) {
            return Err(Error::Unsupported(format!(
                "fast-forward on entity collection {}",
                self.record.id
            )));
        }

        let head = self.head(&self.stream_key())?;
        let updated = self.conn.execute(
            "UPDATE object_sync_partner_collections
             SET last_commit_id = MAX(last_commit_id, ?1),
                 stale_checked_commit_id = MAX(stale_checked_commit_id, ?1)
             WHERE id = ?2",
            params![head, self.record.id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("collection {}", self.record.id)));
        }
        self.reload()?;

        tracing::info!(
            collection_id = self.record.id,
            last_commit_id = %self.record.last_commit_id,
            "collection fast-forwarded"
        );
        Ok(self.record.last_commit_id)
    }

    /// Cheap probe whether an export pass could return anything.
    ///
    /// A cached head above the watermark answers `true` without touching the
    /// database; every other case asks the ledger.
    pub fn changes_exist(&self) -> Result<bool> {
        let stream = self.stream_key();
        let last = self.record.last_commit_id;
        if self
            .cache
            .get(&head_key(&stream))
            .is_some_and(|head| head > last.value())
        {
            return Ok(true);
        }

        let head = self.head(&stream)?;
        Ok(head > last || self.should_reconcile(head))
    }

    /// Record a completed full pass for `parent_id` (`None` is the root)
    pub fn mark_initialized(&mut self, parent_id: Option<&str>) -> Result<()> {
        let now = unix_millis_now();
        let tx = begin_write(self.conn)?;
        tx.execute(
            "INSERT INTO object_sync_partner_collection_init (collection_id, parent_id, ts_completed)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(collection_id, parent_id) DO UPDATE SET ts_completed = excluded.ts_completed",
            params![self.record.id, parent_id.unwrap_or_default(), now],
        )?;
        if parent_id.is_none() {
            tx.execute(
                "UPDATE object_sync_partner_collections
                 SET f_initialized = 1, ts_init_started = COALESCE(ts_init_started, ?2)
                 WHERE id = ?1",
                params![self.record.id, now],
            )?;
        }
        tx.commit()?;

        if parent_id.is_none() {
            self.record.initialized = true;
            self.record.init_started_at.get_or_insert(now);
            tracing::info!(collection_id = self.record.id, "collection initialized");
        }
        Ok(())
    }

    /// Whether a full pass completed for `parent_id` (`None` is the root)
    pub fn is_initialized(&self, parent_id: Option<&str>) -> Result<bool> {
        match parent_id {
            None => Ok(self.record.initialized),
            Some(parent) => Ok(self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM object_sync_partner_collection_init
                 WHERE collection_id = ?1 AND parent_id = ?2)",
                params![self.record.id, parent],
                |row| row.get(0),
            )?),
        }
    }

    /// Replace the filter.
    ///
    /// The stale checkpoint is cleared so the next idle pass reconciles the
    /// partner's objects against the new filter.
    pub fn set_conditions(&mut self, conditions: Conditions) -> Result<()> {
        conditions.validate_shape()?;
        self.entities
            .validate_conditions(&self.stream_key(), &conditions)?;

        let updated = self
            .conn
            .execute(
                "UPDATE object_sync_partner_collections
                 SET conditions = ?1, conditions_hash = ?2, stale_checked_commit_id = 0
                 WHERE id = ?3",
                params![conditions.to_json()?, conditions.hash(), self.record.id],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    Error::InvalidInput(
                        "the partner already has a collection with these conditions".into(),
                    )
                } else {
                    e.into()
                }
            })?;
        if updated == 0 {
            return Err(Error::NotFound(format!("collection {}", self.record.id)));
        }

        self.record.spec.conditions = conditions;
        self.record.stale_checked_commit_id = CommitId::ZERO;
        tracing::info!(collection_id = self.record.id, "collection filter replaced");
        Ok(())
    }

    /// Increment the local revision counter
    pub fn bump_revision(&mut self) -> Result<i64> {
        let revision: i64 = self
            .conn
            .query_row(
                "UPDATE object_sync_partner_collections SET revision = revision + 1
                 WHERE id = ?1 RETURNING revision",
                params![self.record.id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("collection {}", self.record.id)))?;
        self.record.revision = revision;
        Ok(revision)
    }

    fn head(&self, stream: &StreamKey) -> Result<CommitId> {
        let head = SqliteCommitLedger::new(self.conn).head(stream)?;
        self.cache.put(&head_key(stream), head.value());
        Ok(head)
    }

    fn mark_init_started(&mut self) -> Result<()> {
        if self.record.init_started_at.is_some() {
            return Ok(());
        }
        let now = unix_millis_now();
        let updated = self.conn.execute(
            "UPDATE object_sync_partner_collections SET ts_init_started = ?1
             WHERE id = ?2 AND ts_init_started IS NULL",
            params![now, self.record.id],
        )?;
        if updated > 0 {
            self.record.init_started_at = Some(now);
            tracing::info!(collection_id = self.record.id, "collection initializing");
        } else {
            self.reload()?;
        }
        Ok(())
    }

    /// Compare-and-set the watermark without logging an export
    fn advance_to(&mut self, target: CommitId) -> Result<()> {
        let advanced = self.conn.execute(
            "UPDATE object_sync_partner_collections SET last_commit_id = ?1
             WHERE id = ?2 AND last_commit_id < ?1",
            params![target, self.record.id],
        )?;
        if advanced > 0 {
            self.record.last_commit_id = target;
            tracing::debug!(collection_id = self.record.id, %target, "skipped unmatched commits");
        } else {
            self.reload()?;
        }
        Ok(())
    }

    fn should_reconcile(&self, head: CommitId) -> bool {
        self.stale_check
            && self.record.init_state() == InitState::Steady
            && !self.record.spec.conditions.is_empty()
            && head > self.record.stale_checked_commit_id
    }

    /// Deletes for exported objects the filter no longer matches
    fn reconcile_stale(
        &mut self,
        stream: &StreamKey,
        head: CommitId,
        limit: usize,
    ) -> Result<Vec<ExportStat>> {
        let conditions = &self.record.spec.conditions;
        self.entities.validate_conditions(stream, conditions)?;

        let exported = {
            let mut stmt = self.conn.prepare(
                "SELECT object_id, commit_id FROM object_sync_export
                 WHERE collection_id = ?1 AND action = ?2
                 ORDER BY object_id",
            )?;
            let rows = stmt
                .query_map(
                    params![self.record.id, ChangeAction::Change.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, CommitId>(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let ids: Vec<String> = exported.iter().map(|(id, _)| id.clone()).collect();
        let matching = self.entities.matching_ids(stream, &ids, conditions)?;
        let mut stale = stale_deletes(&exported, &matching);

        if stale.is_empty() {
            self.conn.execute(
                "UPDATE object_sync_partner_collections
                 SET stale_checked_commit_id = MAX(stale_checked_commit_id, ?1)
                 WHERE id = ?2",
                params![head, self.record.id],
            )?;
            self.record.stale_checked_commit_id = head;
        } else {
            tracing::info!(
                collection_id = self.record.id,
                count = stale.len(),
                "stale records found"
            );
            stale.truncate(limit);
        }
        Ok(stale)
    }
}
