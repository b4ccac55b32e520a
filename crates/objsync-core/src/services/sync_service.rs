//! Sync service wrapper used by the CLI and embedding protocol handlers.

use rusqlite::Connection;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::db::Database;
use crate::device::{ConfiguredCodec, DeviceStateMachine};
use crate::entity::SqliteEntityStore;
use crate::error::Result;
use crate::ledger::{CommitLedger, SqliteCommitLedger};
use crate::models::{CollectionSpec, CommitId, ExportStat, StreamKey};
use crate::sync::{ChangeSink, Exporter, PartnerRegistry, Progress, SqlitePartnerRegistry, SyncCollection};

/// One database connection plus the engine configuration
pub struct SyncService {
    db: Database,
    config: SyncConfig,
}

impl SyncService {
    /// Open the database described by `config`
    pub fn open(config: SyncConfig) -> Result<Self> {
        let db = Database::open_config(&config)?;
        tracing::debug!(path = ?config.database_path, "sync service opened");
        Ok(Self { db, config })
    }

    /// Open an in-memory service (primarily for tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(SyncConfig::default())
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub const fn connection(&self) -> &Connection {
        self.db.connection()
    }

    pub fn entities(&self) -> SqliteEntityStore<'_> {
        SqliteEntityStore::new(self.connection())
    }

    pub fn partners(&self) -> SqlitePartnerRegistry<'_> {
        SqlitePartnerRegistry::new(self.connection())
    }

    pub fn ledger(&self) -> SqliteCommitLedger<'_> {
        SqliteCommitLedger::new(self.connection())
    }

    /// Device state machine using the configured codec
    pub fn device_states(&self) -> DeviceStateMachine<'_, ConfiguredCodec> {
        DeviceStateMachine::with_codec(self.connection(), self.config.state_codec.into())
    }

    /// Every stream head
    pub fn commit_heads(&self) -> Result<Vec<(String, CommitId)>> {
        self.ledger().heads()
    }

    /// Write an object to the entity store
    pub fn put_object(
        &self,
        stream: &StreamKey,
        id: &str,
        fields: &Value,
        parent_id: Option<&str>,
    ) -> Result<CommitId> {
        self.entities().put(stream, id, fields, parent_id)
    }

    /// Register a partner (if new) and ensure it has a collection for `spec`
    pub fn ensure_collection(&self, pid: &str, owner_id: &str, spec: &CollectionSpec) -> Result<i64> {
        let registry = self.partners();
        let partner = registry.get_or_create(pid, owner_id)?;
        Ok(registry.ensure_collection(partner.id, spec)?.id)
    }

    /// Run `f` against a configured collection
    pub fn with_collection<T>(
        &self,
        collection_id: i64,
        f: impl FnOnce(&mut SyncCollection<'_>) -> Result<T>,
    ) -> Result<T> {
        let entities = self.entities();
        let mut collection =
            SyncCollection::open(self.connection(), &entities, collection_id)?.configured(&self.config);
        f(&mut collection)
    }

    /// Next export batch of a collection without acknowledging it
    pub fn pending_changes(&self, collection_id: i64) -> Result<Vec<ExportStat>> {
        let limit = self.config.export_batch_size;
        self.with_collection(collection_id, |collection| {
            collection.compute_export_changes(limit)
        })
    }

    /// Export one full batch through `sink`, acknowledging each change
    pub fn export_batch(&self, collection_id: i64, sink: &mut dyn ChangeSink) -> Result<Progress> {
        let limit = self.config.export_batch_size;
        self.with_collection(collection_id, |collection| {
            let partner_id = collection.record().partner_id;
            let mut exporter = Exporter::initialize(collection, limit)?;
            let mut progress = exporter.progress();
            while !progress.is_complete() {
                progress = exporter.synchronize(&mut *sink)?;
            }
            drop(exporter);
            if progress.steps > 0 {
                self.partners().touch_last_sync(partner_id)?;
            }
            Ok(progress)
        })
    }

    /// Move a grouping collection's watermark to its stream head
    pub fn fast_forward(&self, collection_id: i64) -> Result<CommitId> {
        self.with_collection(collection_id, |collection| collection.fast_forward_to_head())
    }
}
