//! Commit identifiers and stream keys

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A monotonically increasing change identifier within one stream.
///
/// Zero means "nothing committed yet"; the first commit of a stream is 1.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CommitId(i64);

impl CommitId {
    /// The watermark of a collection that has never synchronized
    pub const ZERO: Self = Self(0);

    /// Wrap a raw commit number
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Raw commit number
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CommitId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl ToSql for CommitId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for CommitId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Self)
    }
}

/// Identifies a logical stream of commits.
///
/// Entities of one object type share the stream `<type>`. Groupings of a
/// field share `<type>/<field>`. Grouping collections additionally carry a
/// filter hash so two collections with different filters on the same field
/// never share a watermark key, while still reading heads from the same
/// ledger stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    object_type: String,
    field: Option<String>,
    filter_hash: Option<String>,
}

impl StreamKey {
    /// Stream of single entities of `object_type`
    pub fn entity(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            field: None,
            filter_hash: None,
        }
    }

    /// Stream of groupings of `field` on `object_type`
    pub fn grouping(object_type: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            field: Some(field.into()),
            filter_hash: None,
        }
    }

    /// Attach a filter hash to derive a per-filter watermark key
    #[must_use]
    pub fn with_filter_hash(mut self, hash: impl Into<String>) -> Self {
        self.filter_hash = Some(hash.into());
        self
    }

    /// Object type this stream belongs to
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Grouping field, if this is a grouping stream
    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    /// Key under which the ledger issues commit ids (filter hash excluded)
    pub fn ledger_key(&self) -> String {
        match &self.field {
            Some(field) => format!("{}/{field}", self.object_type),
            None => self.object_type.clone(),
        }
    }

    /// Full derived key including the filter hash
    pub fn watermark_key(&self) -> String {
        match &self.filter_hash {
            Some(hash) => format!("{}#{hash}", self.ledger_key()),
            None => self.ledger_key(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.watermark_key())
    }
}

impl FromStr for StreamKey {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (base, hash) = match raw.split_once('#') {
            Some((base, hash)) => (base, Some(hash)),
            None => (raw, None),
        };

        let mut parts = base.split('/');
        let object_type = parts.next().unwrap_or_default().trim();
        let field = parts.next().map(str::trim);
        if parts.next().is_some() {
            return Err(Error::InvalidInput(format!(
                "stream key '{raw}' has more than one '/'"
            )));
        }
        if object_type.is_empty() || field.is_some_and(str::is_empty) {
            return Err(Error::InvalidInput(format!(
                "stream key '{raw}' has an empty component"
            )));
        }

        let key = field.map_or_else(
            || Self::entity(object_type),
            |field| Self::grouping(object_type, field),
        );
        Ok(match hash.map(str::trim).filter(|hash| !hash.is_empty()) {
            Some(hash) => key.with_filter_hash(hash),
            None => key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn commit_ids_order_numerically() {
        assert!(CommitId::new(14) > CommitId::new(13));
        assert_eq!(CommitId::default(), CommitId::ZERO);
    }

    #[test]
    fn entity_key_is_object_type() {
        let key = StreamKey::entity("task");
        assert_eq!(key.ledger_key(), "task");
        assert_eq!(key.watermark_key(), "task");
    }

    #[test]
    fn grouping_key_appends_field_and_hash() {
        let key = StreamKey::grouping("email_message", "mailbox_id").with_filter_hash("ab12");
        assert_eq!(key.ledger_key(), "email_message/mailbox_id");
        assert_eq!(key.watermark_key(), "email_message/mailbox_id#ab12");
    }

    #[test]
    fn parse_round_trips_display() {
        let key: StreamKey = "email_message/mailbox_id#ab12".parse().unwrap();
        assert_eq!(key.object_type(), "email_message");
        assert_eq!(key.field(), Some("mailbox_id"));
        assert_eq!(key.to_string(), "email_message/mailbox_id#ab12");
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!("".parse::<StreamKey>().is_err());
        assert!("task/".parse::<StreamKey>().is_err());
        assert!("a/b/c".parse::<StreamKey>().is_err());
    }
}
