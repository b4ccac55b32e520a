//! Partner and collection records

use serde::{Deserialize, Serialize};

use super::{CommitId, Conditions, StreamKey};
use crate::error::{Error, Result};

/// A remote endpoint to synchronize with (a device, a mailbox, another system)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    /// Row identifier
    pub id: i64,
    /// Logical partner key, e.g. `EmailAccounts/<id>`
    pub pid: String,
    /// Owning principal
    pub owner_id: String,
    /// Last successful sync (unix ms)
    pub last_sync: Option<i64>,
}

/// Closed set of collection variants
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectionKind {
    /// Single-entity stream, e.g. messages of a mailbox
    Entity,
    /// Hierarchical grouping stream of a field, e.g. a folder tree
    Grouping { field_name: String },
}

impl CollectionKind {
    pub(crate) const fn type_code(&self) -> i64 {
        match self {
            Self::Entity => 1,
            Self::Grouping { .. } => 2,
        }
    }

    pub(crate) fn from_row(type_code: i64, field_name: Option<String>) -> Result<Self> {
        match (type_code, field_name) {
            (1, _) => Ok(Self::Entity),
            (2, Some(field_name)) => Ok(Self::Grouping { field_name }),
            (2, None) => Err(Error::InvalidInput(
                "grouping collection is missing its field".to_string(),
            )),
            (other, _) => Err(Error::InvalidInput(format!(
                "unknown collection type {other}"
            ))),
        }
    }

    /// Grouping field, if any
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::Entity => None,
            Self::Grouping { field_name } => Some(field_name),
        }
    }
}

/// Lifecycle of a collection's first full pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    /// Never asked to sync
    Uninitialized,
    /// First pass started but has not drained
    Initializing,
    /// A full pass completed with nothing pending
    Steady,
}

/// What a partner asks to sync: the identity tuple of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub kind: CollectionKind,
    pub object_type: String,
    pub conditions: Conditions,
}

impl CollectionSpec {
    /// Entity collection over `object_type`
    pub fn entity(object_type: impl Into<String>) -> Self {
        Self {
            kind: CollectionKind::Entity,
            object_type: object_type.into(),
            conditions: Conditions::new(),
        }
    }

    /// Grouping collection over `field_name` of `object_type`
    pub fn grouping(object_type: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            kind: CollectionKind::Grouping {
                field_name: field_name.into(),
            },
            object_type: object_type.into(),
            conditions: Conditions::new(),
        }
    }

    /// Attach filter conditions
    #[must_use]
    pub fn with_conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Stream this collection reads from
    pub fn stream_key(&self) -> StreamKey {
        match &self.kind {
            CollectionKind::Entity => StreamKey::entity(&self.object_type),
            CollectionKind::Grouping { field_name } => {
                StreamKey::grouping(&self.object_type, field_name)
                    .with_filter_hash(self.conditions.hash())
            }
        }
    }
}

/// Persisted state of one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: i64,
    pub partner_id: i64,
    pub spec: CollectionSpec,
    /// Watermark: highest acknowledged commit id
    pub last_commit_id: CommitId,
    /// Local change counter, bumped per completed export batch
    pub revision: i64,
    pub initialized: bool,
    pub init_started_at: Option<i64>,
    /// Stream head at the last stale pass that found nothing
    pub stale_checked_commit_id: CommitId,
}

impl CollectionRecord {
    /// Derived lifecycle state
    pub const fn init_state(&self) -> InitState {
        if self.initialized {
            InitState::Steady
        } else if self.init_started_at.is_some() {
            InitState::Initializing
        } else {
            InitState::Uninitialized
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operator;

    #[test]
    fn grouping_stream_key_depends_on_filter() {
        let open = CollectionSpec::grouping("email_message", "mailbox_id")
            .with_conditions(Conditions::new().and("owner", Operator::Equals, "u1"));
        let other = CollectionSpec::grouping("email_message", "mailbox_id")
            .with_conditions(Conditions::new().and("owner", Operator::Equals, "u2"));

        assert_eq!(open.stream_key().ledger_key(), other.stream_key().ledger_key());
        assert_ne!(
            open.stream_key().watermark_key(),
            other.stream_key().watermark_key()
        );
    }

    #[test]
    fn entity_stream_key_has_no_hash() {
        let spec = CollectionSpec::entity("task")
            .with_conditions(Conditions::new().and("assignee", Operator::Equals, "U1"));
        assert_eq!(spec.stream_key().watermark_key(), "task");
    }

    #[test]
    fn kind_round_trips_type_code() {
        let grouping = CollectionKind::Grouping {
            field_name: "mailbox_id".into(),
        };
        assert_eq!(
            CollectionKind::from_row(grouping.type_code(), Some("mailbox_id".into())).unwrap(),
            grouping
        );
        assert!(CollectionKind::from_row(2, None).is_err());
        assert!(CollectionKind::from_row(9, None).is_err());
    }
}
