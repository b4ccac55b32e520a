//! Stepwise exporter for protocol handlers
//!
//! A protocol layer drives the export one change per call, reporting progress
//! to its client between calls.

use std::collections::VecDeque;

use serde::Serialize;

use super::collection::SyncCollection;
use crate::error::Result;
use crate::models::ExportStat;

/// Receives outgoing changes; returning `Ok` means the partner has them
pub trait ChangeSink {
    fn export_change(&mut self, stat: &ExportStat) -> Result<()>;
}

impl ChangeSink for Vec<ExportStat> {
    fn export_change(&mut self, stat: &ExportStat) -> Result<()> {
        self.push(stat.clone());
        Ok(())
    }
}

/// Running step counter of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub step: usize,
    pub steps: usize,
}

impl Progress {
    pub const fn is_complete(&self) -> bool {
        self.step >= self.steps
    }
}

/// Exports one batch of a collection, one change at a time
pub struct Exporter<'c, 'a> {
    collection: &'c mut SyncCollection<'a>,
    pending: VecDeque<ExportStat>,
    step: usize,
    steps: usize,
}

impl<'c, 'a> Exporter<'c, 'a> {
    /// Compute the next batch of at most `limit` changes
    pub fn initialize(collection: &'c mut SyncCollection<'a>, limit: usize) -> Result<Self> {
        let pending: VecDeque<ExportStat> = collection.compute_export_changes(limit)?.into();
        let steps = pending.len();
        tracing::debug!(collection_id = collection.id(), steps, "exporter initialized");
        Ok(Self {
            collection,
            pending,
            step: 0,
            steps,
        })
    }

    pub const fn progress(&self) -> Progress {
        Progress {
            step: self.step,
            steps: self.steps,
        }
    }

    /// Export the next change.
    ///
    /// The change is acknowledged only after `sink` accepted it. If either the
    /// sink or the acknowledgement fails, the change stays pending and the
    /// watermark stays where it was; the next call delivers it again.
    /// Completing the batch bumps the collection revision.
    pub fn synchronize(&mut self, sink: &mut dyn ChangeSink) -> Result<Progress> {
        let Some(stat) = self.pending.pop_front() else {
            return Ok(self.progress());
        };

        // A change the sink or the ack rejected stays first in line for the retry
        if let Err(error) = sink
            .export_change(&stat)
            .and_then(|()| self.collection.acknowledge(&stat))
        {
            self.pending.push_front(stat);
            return Err(error);
        }
        self.step += 1;

        if self.pending.is_empty() {
            let revision = self.collection.bump_revision()?;
            tracing::info!(
                collection_id = self.collection.id(),
                steps = self.steps,
                revision,
                "export batch completed"
            );
        }
        Ok(self.progress())
    }

    /// Changes not exported yet
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::entity::SqliteEntityStore;
    use crate::error::Error;
    use crate::models::{CollectionSpec, CommitId, StreamKey};
    use crate::sync::partner::{PartnerRegistry, SqlitePartnerRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    struct FailingSink {
        accept: usize,
        received: Vec<String>,
    }

    impl ChangeSink for FailingSink {
        fn export_change(&mut self, stat: &ExportStat) -> Result<()> {
            if self.received.len() == self.accept {
                return Err(Error::StorageUnavailable("partner went away".into()));
            }
            self.received.push(stat.entity_id.clone());
            Ok(())
        }
    }

    fn seed(store: &SqliteEntityStore<'_>, ids: &[&str]) {
        for id in ids {
            store.put(&StreamKey::entity("task"), id, &json!({}), None).unwrap();
        }
    }

    fn collection<'a>(
        conn: &'a rusqlite::Connection,
        store: &'a SqliteEntityStore<'a>,
    ) -> SyncCollection<'a> {
        let registry = SqlitePartnerRegistry::new(conn);
        let partner = registry.get_or_create("Devices/dev1", "u1").unwrap();
        let record = registry
            .ensure_collection(partner.id, &CollectionSpec::entity("task"))
            .unwrap();
        SyncCollection::new(conn, store, record)
    }

    #[test]
    fn synchronize_steps_through_the_batch() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        seed(&store, &["A", "B", "C"]);
        let mut collection = collection(db.connection(), &store);

        let mut sink: Vec<ExportStat> = Vec::new();
        {
            let mut exporter = Exporter::initialize(&mut collection, 250).unwrap();
            assert_eq!(exporter.progress(), Progress { step: 0, steps: 3 });

            assert_eq!(
                exporter.synchronize(&mut sink).unwrap(),
                Progress { step: 1, steps: 3 }
            );
            exporter.synchronize(&mut sink).unwrap();
            let done = exporter.synchronize(&mut sink).unwrap();
            assert!(done.is_complete());
            assert_eq!(exporter.remaining(), 0);

            // Further calls are no-ops
            assert_eq!(exporter.synchronize(&mut sink).unwrap(), done);
        }

        assert_eq!(sink.len(), 3);
        assert_eq!(collection.record().last_commit_id, CommitId::new(3));
        assert_eq!(collection.record().revision, 1);
    }

    #[test]
    fn failing_sink_keeps_watermark_at_last_accepted_change() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        seed(&store, &["A", "B", "C"]);
        let mut collection = collection(db.connection(), &store);

        let mut sink = FailingSink {
            accept: 1,
            received: Vec::new(),
        };
        {
            let mut exporter = Exporter::initialize(&mut collection, 250).unwrap();
            exporter.synchronize(&mut sink).unwrap();
            assert!(exporter.synchronize(&mut sink).is_err());
            assert_eq!(exporter.remaining(), 2);
        }

        assert_eq!(sink.received, vec!["A"]);
        collection.reload().unwrap();
        assert_eq!(collection.record().last_commit_id, CommitId::new(1));
        assert_eq!(collection.record().revision, 0);
    }

    #[test]
    fn empty_batch_is_complete_immediately() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let mut collection = collection(db.connection(), &store);

        let mut exporter = Exporter::initialize(&mut collection, 250).unwrap();
        let mut sink: Vec<ExportStat> = Vec::new();
        let progress = exporter.synchronize(&mut sink).unwrap();
        assert_eq!(progress, Progress { step: 0, steps: 0 });
        assert!(progress.is_complete());
        assert!(sink.is_empty());
    }

    #[test]
    fn failed_acknowledgement_redelivers_the_change() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("sync.db");
        let db = Database::open_with_timeout(&path, Duration::ZERO).unwrap();
        let store = SqliteEntityStore::new(db.connection());
        seed(&store, &["A", "B", "C"]);
        let mut collection = collection(db.connection(), &store);

        let mut sink: Vec<ExportStat> = Vec::new();
        let mut exporter = Exporter::initialize(&mut collection, 250).unwrap();

        // Another worker holds the write lock while A is acknowledged
        let locker = rusqlite::Connection::open(&path).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE").unwrap();
        let error = exporter.synchronize(&mut sink).unwrap_err();
        assert!(matches!(error, Error::StorageUnavailable(_)));
        assert_eq!(exporter.remaining(), 3);
        assert_eq!(exporter.progress(), Progress { step: 0, steps: 3 });
        locker.execute_batch("COMMIT").unwrap();

        let mut progress = exporter.progress();
        while !progress.is_complete() {
            progress = exporter.synchronize(&mut sink).unwrap();
        }
        drop(exporter);
        assert_eq!(progress, Progress { step: 3, steps: 3 });

        // A reached the sink twice; the duplicate is tolerated by entity id
        let delivered: Vec<&str> = sink.iter().map(|stat| stat.entity_id.as_str()).collect();
        assert_eq!(delivered, vec!["A", "A", "B", "C"]);

        let mut stmt = db
            .connection()
            .prepare("SELECT object_id FROM object_sync_export WHERE collection_id = ?1 ORDER BY object_id")
            .unwrap();
        let logged = stmt
            .query_map([collection.id()], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(logged, vec!["A", "B", "C"]);
        collection.reload().unwrap();
        assert_eq!(collection.record().last_commit_id, CommitId::new(3));
    }
}
