//! Diff engine
//!
//! Pure functions that turn two snapshots, or a batch of committed rows, into
//! a minimal change set tagged `change` or `delete`. No I/O happens here; the
//! sync collections and the device state machine feed it what they loaded.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::models::{ChangeAction, ChangedRow, CommitId, ExportOrigin, ExportStat, ManifestEntry};

/// One object in a snapshot: its id and an opaque revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: String,
    pub revision: i64,
}

impl SnapshotEntry {
    pub fn new(id: impl Into<String>, revision: i64) -> Self {
        Self {
            id: id.into(),
            revision,
        }
    }
}

impl From<&ManifestEntry> for SnapshotEntry {
    fn from(entry: &ManifestEntry) -> Self {
        Self::new(entry.unique_id.clone(), entry.revision)
    }
}

/// One difference between a persisted and a fresh snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChange {
    pub id: String,
    pub action: ChangeAction,
    /// New revision for changes, last known revision for deletes
    pub revision: i64,
    /// Revision previously persisted, `None` for objects seen the first time
    pub previous: Option<i64>,
}

/// Compare a persisted snapshot against a freshly fetched one.
///
/// Every persisted entry starts out as a tentative delete. Fresh entries with
/// an unchanged revision are dropped, changed or new ones become `change`.
/// Whatever persisted entry was never seen is returned as `delete`.
///
/// Output order is deterministic: changes in the order ids first appear in
/// `fresh` (a repeated id keeps its last revision), then deletes sorted by id.
pub fn diff_snapshots(persisted: &[SnapshotEntry], fresh: &[SnapshotEntry]) -> Vec<SnapshotChange> {
    let mut pending: HashMap<&str, i64> = persisted
        .iter()
        .map(|entry| (entry.id.as_str(), entry.revision))
        .collect();
    let known = pending.clone();

    let mut latest: HashMap<&str, i64> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for entry in fresh {
        if latest.insert(entry.id.as_str(), entry.revision).is_none() {
            order.push(entry.id.as_str());
        }
    }

    let mut changes = Vec::new();
    for id in order {
        let revision = latest[id];
        pending.remove(id);
        match known.get(id) {
            Some(previous) if *previous == revision => {}
            previous => changes.push(SnapshotChange {
                id: id.to_string(),
                action: ChangeAction::Change,
                revision,
                previous: previous.copied(),
            }),
        }
    }

    let mut deletes: Vec<(&str, i64)> = pending.into_iter().collect();
    deletes.sort_unstable_by(|a, b| a.0.cmp(b.0));
    changes.extend(deletes.into_iter().map(|(id, revision)| SnapshotChange {
        id: id.to_string(),
        action: ChangeAction::Delete,
        revision,
        previous: Some(revision),
    }));

    changes
}

/// Classify committed rows: deleted entities become `delete`, the rest `change`.
///
/// Rows keep the commit order the entity store returned.
pub fn classify_rows(rows: Vec<ChangedRow>) -> Vec<ExportStat> {
    rows.into_iter()
        .map(|row| ExportStat {
            action: if row.deleted {
                ChangeAction::Delete
            } else {
                ChangeAction::Change
            },
            entity_id: row.entity_id,
            commit_id: row.commit_id,
            origin: ExportOrigin::Commit,
        })
        .collect()
}

/// Synthesize deletes for exported objects the filter no longer matches.
///
/// `exported` holds the `(entity_id, commit_id)` of every object the partner
/// currently holds; `still_matching` is the subset the entity store still
/// returns for the collection's conditions.
pub fn stale_deletes(
    exported: &[(String, CommitId)],
    still_matching: &HashSet<String>,
) -> Vec<ExportStat> {
    let mut stale: Vec<ExportStat> = exported
        .iter()
        .filter(|(entity_id, _)| !still_matching.contains(entity_id))
        .map(|(entity_id, commit_id)| ExportStat {
            entity_id: entity_id.clone(),
            action: ChangeAction::Delete,
            commit_id: *commit_id,
            origin: ExportOrigin::Stale,
        })
        .collect();
    stale.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entries(pairs: &[(&str, i64)]) -> Vec<SnapshotEntry> {
        pairs
            .iter()
            .map(|(id, revision)| SnapshotEntry::new(*id, *revision))
            .collect()
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let snapshot = entries(&[("a", 1), ("b", 2)]);
        assert!(diff_snapshots(&snapshot, &snapshot).is_empty());
    }

    #[test]
    fn new_changed_and_removed_entries() {
        let persisted = entries(&[("a", 1), ("b", 2), ("c", 3)]);
        let fresh = entries(&[("d", 1), ("b", 5), ("a", 1)]);

        let changes = diff_snapshots(&persisted, &fresh);
        assert_eq!(
            changes,
            vec![
                SnapshotChange {
                    id: "d".into(),
                    action: ChangeAction::Change,
                    revision: 1,
                    previous: None,
                },
                SnapshotChange {
                    id: "b".into(),
                    action: ChangeAction::Change,
                    revision: 5,
                    previous: Some(2),
                },
                SnapshotChange {
                    id: "c".into(),
                    action: ChangeAction::Delete,
                    revision: 3,
                    previous: Some(3),
                },
            ]
        );
    }

    #[test]
    fn deletes_are_sorted_by_id() {
        let persisted = entries(&[("z", 1), ("m", 1), ("a", 1)]);
        let ids: Vec<String> = diff_snapshots(&persisted, &[])
            .into_iter()
            .map(|change| change.id)
            .collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }

    #[test]
    fn repeated_fresh_id_keeps_last_revision() {
        let persisted = entries(&[("a", 1)]);
        let fresh = entries(&[("a", 2), ("a", 1)]);
        assert!(diff_snapshots(&persisted, &fresh).is_empty());
    }

    #[test]
    fn classify_rows_uses_deleted_flag() {
        let rows = vec![
            ChangedRow {
                entity_id: "A".into(),
                commit_id: CommitId::new(12),
                deleted: false,
            },
            ChangedRow {
                entity_id: "B".into(),
                commit_id: CommitId::new(13),
                deleted: true,
            },
        ];
        let stats = classify_rows(rows);
        assert_eq!(stats[0].action, ChangeAction::Change);
        assert_eq!(stats[1].action, ChangeAction::Delete);
        assert!(stats.iter().all(ExportStat::advances_watermark));
    }

    #[test]
    fn stale_deletes_skip_matching_entities() {
        let exported = vec![
            ("A".to_string(), CommitId::new(12)),
            ("C".to_string(), CommitId::new(9)),
        ];
        let matching: HashSet<String> = ["A".to_string()].into_iter().collect();

        let stale = stale_deletes(&exported, &matching);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].entity_id, "C");
        assert_eq!(stale[0].action, ChangeAction::Delete);
        assert_eq!(stale[0].origin, ExportOrigin::Stale);
    }
}
