//! Change sets exchanged between collections and the protocol layer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::CommitId;
use crate::error::{Error, Result};

/// What happened to an object from the partner's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Change,
    Delete,
}

impl ChangeAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "change" => Ok(Self::Change),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown change action '{other}'"))),
        }
    }
}

/// Where an export entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOrigin {
    /// A row committed after the collection watermark
    Commit,
    /// A previously exported object that fell out of the filter
    Stale,
}

/// A row returned by the entity store for a change query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedRow {
    pub entity_id: String,
    pub commit_id: CommitId,
    pub deleted: bool,
}

/// One outgoing change for a partner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportStat {
    pub entity_id: String,
    pub action: ChangeAction,
    pub commit_id: CommitId,
    pub origin: ExportOrigin,
}

impl ExportStat {
    /// Returns true if acknowledging this entry may move the watermark
    pub fn advances_watermark(&self) -> bool {
        self.origin == ExportOrigin::Commit
    }
}

/// One entry of a remote manifest: the partner's id and revision of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub unique_id: String,
    pub revision: i64,
}

impl ManifestEntry {
    pub fn new(unique_id: impl Into<String>, revision: i64) -> Self {
        Self {
            unique_id: unique_id.into(),
            revision,
        }
    }
}

/// One incoming change from a partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStat {
    pub unique_id: String,
    /// Local entity the remote object was imported as, if already imported
    pub local_id: Option<String>,
    pub action: ChangeAction,
    pub revision: i64,
}

/// Persisted mapping between a remote object and its local import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub collection_id: i64,
    pub object_type: String,
    pub local_id: Option<String>,
    pub unique_id: String,
    pub revision: i64,
    pub parent_id: Option<String>,
    pub field_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_text() {
        for action in [ChangeAction::Change, ChangeAction::Delete] {
            assert_eq!(action.as_str().parse::<ChangeAction>().unwrap(), action);
        }
        assert!("moved".parse::<ChangeAction>().is_err());
    }

    #[test]
    fn stale_entries_never_advance_watermark() {
        let stat = ExportStat {
            entity_id: "C".into(),
            action: ChangeAction::Delete,
            commit_id: CommitId::new(13),
            origin: ExportOrigin::Stale,
        };
        assert!(!stat.advances_watermark());
    }
}
