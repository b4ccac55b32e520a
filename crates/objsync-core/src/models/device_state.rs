//! Device state records and ActiveSync style sync keys

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Point-lookup key for a device state row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub device_id: String,
    pub state_type: String,
    pub uuid: Option<String>,
    pub counter: i64,
}

impl StateKey {
    /// Key without uuid at counter 0
    pub fn new(device_id: impl Into<String>, state_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state_type: state_type.into(),
            uuid: None,
            counter: 0,
        }
    }

    /// Scope the key to a uuid
    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Select a generation
    #[must_use]
    pub const fn with_counter(mut self, counter: i64) -> Self {
        self.counter = counter;
        self
    }

    /// Key addressing the generation of a parsed sync key
    pub fn from_sync_key(
        device_id: impl Into<String>,
        state_type: impl Into<String>,
        sync_key: &SyncKey,
    ) -> Self {
        Self::new(device_id, state_type)
            .with_uuid(sync_key.uuid.to_string())
            .with_counter(sync_key.counter)
    }

    /// Stored representation of the optional uuid
    pub(crate) fn uuid_column(&self) -> &str {
        self.uuid.as_deref().unwrap_or_default()
    }
}

/// A persisted opaque state blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub key: StateKey,
    pub data: Vec<u8>,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
    /// Last change of `data` (unix ms, strictly increasing per row)
    pub updated_at: i64,
}

/// ActiveSync style sync key `{uuid}counter`.
///
/// The uuid identifies a synchronization session, the counter the
/// generation inside it. `0` alone is the initial key a device sends before
/// any state exists. Counters stay within `0..=i64::MAX` so every generation
/// maps to its own state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub uuid: Uuid,
    pub counter: i64,
}

impl SyncKey {
    /// Start a new session at counter 1
    #[must_use]
    pub fn generate() -> Self {
        Self {
            uuid: Uuid::now_v7(),
            counter: 1,
        }
    }

    /// The key for the next generation of the same session
    pub fn next(self) -> Result<Self> {
        let counter = self.counter.checked_add(1).ok_or_else(|| {
            Error::InvalidInput(format!("sync key {self} has no next generation"))
        })?;
        Ok(Self {
            uuid: self.uuid,
            counter,
        })
    }

    /// Parse a key sent by a device; `"0"` maps to `None` (initial sync)
    pub fn parse_device_key(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim();
        if raw == "0" {
            return Ok(None);
        }
        raw.parse().map(Some)
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.uuid, self.counter)
    }
}

impl FromStr for SyncKey {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("malformed sync key '{raw}'"));

        let rest = raw.trim().strip_prefix('{').ok_or_else(invalid)?;
        let (uuid, counter) = rest.split_once('}').ok_or_else(invalid)?;
        let uuid = Uuid::parse_str(uuid).map_err(|_| invalid())?;
        // Unsigned parse rejects negatives; the conversion rejects counters past i64::MAX
        let counter = counter
            .parse::<u64>()
            .ok()
            .and_then(|counter| i64::try_from(counter).ok())
            .ok_or_else(invalid)?;
        Ok(Self { uuid, counter })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sync_key_round_trips() {
        let key = SyncKey::generate();
        let parsed: SyncKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.counter, 1);
    }

    #[test]
    fn sync_key_next_keeps_session() {
        let key = SyncKey::generate();
        let next = key.next().unwrap();
        assert_eq!(next.uuid, key.uuid);
        assert_eq!(next.counter, 2);
    }

    #[test]
    fn sync_key_next_stops_at_last_generation() {
        let key = SyncKey {
            uuid: Uuid::now_v7(),
            counter: i64::MAX,
        };
        assert!(matches!(key.next(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn counters_beyond_row_range_are_rejected() {
        let uuid = "0191f3a2-0000-7000-8000-000000000000";
        let last: SyncKey = format!("{{{uuid}}}{}", i64::MAX).parse().unwrap();
        assert_eq!(last.counter, i64::MAX);

        for counter in ["9223372036854775808", "9223372036854775809", "-1"] {
            assert!(format!("{{{uuid}}}{counter}").parse::<SyncKey>().is_err());
        }
    }

    #[test]
    fn initial_device_key_is_none() {
        assert_eq!(SyncKey::parse_device_key("0").unwrap(), None);
    }

    #[test]
    fn malformed_sync_keys_are_rejected() {
        assert!("abc".parse::<SyncKey>().is_err());
        assert!("{not-a-uuid}3".parse::<SyncKey>().is_err());
        assert!("{0191f3a2-0000-7000-8000-000000000000}x".parse::<SyncKey>().is_err());
    }

    #[test]
    fn state_key_from_sync_key() {
        let sync_key: SyncKey = "{0191f3a2-0000-7000-8000-000000000000}3".parse().unwrap();
        let key = StateKey::from_sync_key("dev1", "FolderSync", &sync_key);
        assert_eq!(key.counter, 3);
        assert_eq!(
            key.uuid.as_deref(),
            Some("0191f3a2-0000-7000-8000-000000000000")
        );
    }
}
