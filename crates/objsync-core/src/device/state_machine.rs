//! Device state machine
//!
//! Persists opaque per-device cursors for multi-step protocols such as
//! ActiveSync, cleans superseded generations and keeps the user/device link
//! table.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::{JsonCodec, StateCodec};
use crate::db::begin_write;
use crate::diff::{diff_snapshots, SnapshotChange, SnapshotEntry};
use crate::error::{is_constraint_violation, Error, Result};
use crate::models::{DeviceState, StateKey};
use crate::util::{short_digest, unix_millis_now};

/// State store for one connection, generic over the blob codec
pub struct DeviceStateMachine<'a, C = JsonCodec> {
    conn: &'a Connection,
    codec: C,
}

impl<'a> DeviceStateMachine<'a, JsonCodec> {
    /// Create a state machine storing JSON blobs
    pub const fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            codec: JsonCodec,
        }
    }
}

impl<'a, C: StateCodec> DeviceStateMachine<'a, C> {
    /// Create a state machine with an explicit codec
    pub const fn with_codec(conn: &'a Connection, codec: C) -> Self {
        Self { conn, codec }
    }

    /// Hash of the stored state, `None` if there is none.
    ///
    /// Derived from the row's `updated_at`, which moves exactly when the blob
    /// changes.
    pub fn get_state_hash(&self, key: &StateKey) -> Result<Option<String>> {
        let updated_at: Option<i64> = self
            .conn
            .query_row(
                "SELECT updated_at FROM async_device_states
                 WHERE device_id = ?1 AND uuid = ?2 AND state_type = ?3 AND counter = ?4",
                params![key.device_id, key.uuid_column(), key.state_type, key.counter],
                |row| row.get(0),
            )
            .optional()?;
        Ok(updated_at.map(|updated_at| state_hash(key, updated_at)))
    }

    /// Decoded state for `key`.
    ///
    /// With `clean_states` and a positive counter, older generations of the
    /// same `(device, type, uuid)` are purged first.
    pub fn get_state<T: DeserializeOwned>(&self, key: &StateKey, clean_states: bool) -> Result<Option<T>> {
        self.get_state_raw(key, clean_states)?
            .map(|state| self.codec.decode(&state.data))
            .transpose()
    }

    /// Stored row for `key`, see `get_state`
    pub fn get_state_raw(&self, key: &StateKey, clean_states: bool) -> Result<Option<DeviceState>> {
        if clean_states && key.counter > 0 {
            self.clean_states(
                &key.device_id,
                &key.state_type,
                key.uuid.as_deref(),
                Some(key.counter),
                false,
            )?;
        }

        let row = self
            .conn
            .query_row(
                "SELECT state_data, created_at, updated_at FROM async_device_states
                 WHERE device_id = ?1 AND uuid = ?2 AND state_type = ?3 AND counter = ?4",
                params![key.device_id, key.uuid_column(), key.state_type, key.counter],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(data, created_at, updated_at)| DeviceState {
            key: key.clone(),
            data: data.unwrap_or_default(),
            created_at,
            updated_at,
        }))
    }

    /// Encode and store `value`, returning the new state hash
    pub fn set_state<T: Serialize>(&self, key: &StateKey, value: &T) -> Result<String> {
        let data = self.codec.encode(value)?;
        self.set_state_raw(key, &data)
    }

    /// Store raw bytes, returning the new state hash.
    ///
    /// Update first, insert only when no row exists. An insert that loses
    /// the race against a concurrent retry falls back to the update.
    pub fn set_state_raw(&self, key: &StateKey, data: &[u8]) -> Result<String> {
        if let Some(updated_at) = self.update_state(key, data)? {
            return Ok(state_hash(key, updated_at));
        }

        let now = unix_millis_now();
        match self.conn.execute(
            "INSERT INTO async_device_states
                (device_id, uuid, state_type, counter, state_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![key.device_id, key.uuid_column(), key.state_type, key.counter, data, now],
        ) {
            Ok(_) => {
                tracing::debug!(
                    device_id = %key.device_id,
                    state_type = %key.state_type,
                    counter = key.counter,
                    "device state created"
                );
                Ok(state_hash(key, now))
            }
            Err(e) if is_constraint_violation(&e) => {
                tracing::debug!(device_id = %key.device_id, "concurrent state insert, updating instead");
                let updated_at = self.update_state(key, data)?.ok_or_else(|| {
                    Error::NotFound(format!("device state {}/{}", key.device_id, key.state_type))
                })?;
                Ok(state_hash(key, updated_at))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete generations of `(device, type, uuid)`.
    ///
    /// Without a counter every generation goes; with `this_counter_only` only
    /// that generation; otherwise every generation strictly older than it.
    pub fn clean_states(
        &self,
        device_id: &str,
        state_type: &str,
        uuid: Option<&str>,
        counter: Option<i64>,
        this_counter_only: bool,
    ) -> Result<usize> {
        let uuid = uuid.unwrap_or_default();
        let deleted = match (counter, this_counter_only) {
            (None, _) => self.conn.execute(
                "DELETE FROM async_device_states
                 WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3",
                params![device_id, state_type, uuid],
            )?,
            (Some(counter), true) => self.conn.execute(
                "DELETE FROM async_device_states
                 WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3 AND counter = ?4",
                params![device_id, state_type, uuid, counter],
            )?,
            (Some(counter), false) => self.conn.execute(
                "DELETE FROM async_device_states
                 WHERE device_id = ?1 AND state_type = ?2 AND uuid = ?3 AND counter < ?4",
                params![device_id, state_type, uuid, counter],
            )?,
        };

        if deleted > 0 {
            tracing::debug!(device_id, state_type, ?counter, deleted, "device states cleaned");
        }
        Ok(deleted)
    }

    /// Link a user to a device; `false` if they were already linked
    pub fn link_user_device(&self, username: &str, device_id: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO async_users (username, device_id) VALUES (?1, ?2)",
            params![username, device_id],
        )?;
        if inserted > 0 {
            tracing::info!(username, device_id, "user linked to device");
        }
        Ok(inserted > 0)
    }

    /// Unlink a user from a device; `false` if they were not linked.
    ///
    /// Once no user remains linked the device's states are dropped too.
    pub fn unlink_user_device(&self, username: &str, device_id: &str) -> Result<bool> {
        let tx = begin_write(self.conn)?;
        let deleted = tx.execute(
            "DELETE FROM async_users WHERE username = ?1 AND device_id = ?2",
            params![username, device_id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }

        let still_linked: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM async_users WHERE device_id = ?1)",
            params![device_id],
            |row| row.get(0),
        )?;
        let dropped = if still_linked {
            0
        } else {
            tx.execute(
                "DELETE FROM async_device_states WHERE device_id = ?1",
                params![device_id],
            )?
        };
        tx.commit()?;

        tracing::info!(username, device_id, dropped_states = dropped, "user unlinked from device");
        Ok(true)
    }

    /// Distinct device ids, for one user or globally.
    ///
    /// The global list includes devices that only have state rows.
    pub fn get_all_devices(&self, username: Option<&str>) -> Result<Vec<String>> {
        match username {
            Some(username) => self.query_strings(
                "SELECT device_id FROM async_users WHERE username = ?1 ORDER BY device_id",
                params![username],
            ),
            None => self.query_strings(
                "SELECT device_id FROM async_users
                 UNION
                 SELECT device_id FROM async_device_states
                 ORDER BY 1",
                [],
            ),
        }
    }

    /// Users linked to a device
    pub fn get_device_users(&self, device_id: &str) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT username FROM async_users WHERE device_id = ?1 ORDER BY username",
            params![device_id],
        )
    }

    /// Devices with state rows but no linked user
    pub fn get_orphaned_devices(&self) -> Result<Vec<String>> {
        let orphans = self.query_strings(
            "SELECT DISTINCT device_id FROM async_device_states
             WHERE device_id NOT IN (SELECT device_id FROM async_users)
             ORDER BY device_id",
            [],
        )?;
        if !orphans.is_empty() {
            tracing::warn!(count = orphans.len(), "device states without linked user");
        }
        Ok(orphans)
    }

    /// Diff `fresh` against the snapshot stored under `key`, then store `fresh`.
    ///
    /// A missing snapshot diffs as empty, so every entry comes back as a change.
    pub fn diff_state_snapshot(&self, key: &StateKey, fresh: &[SnapshotEntry]) -> Result<Vec<SnapshotChange>> {
        let persisted: Vec<SnapshotEntry> = self.get_state(key, false)?.unwrap_or_default();
        let changes = diff_snapshots(&persisted, fresh);
        if !changes.is_empty() {
            self.set_state(key, &fresh)?;
        }
        Ok(changes)
    }

    fn update_state(&self, key: &StateKey, data: &[u8]) -> Result<Option<i64>> {
        // updated_at moves only when the blob differs, and always forward
        Ok(self
            .conn
            .query_row(
                "UPDATE async_device_states
                 SET state_data = ?5,
                     updated_at = CASE WHEN state_data IS ?5 THEN updated_at
                                       ELSE MAX(?6, updated_at + 1) END
                 WHERE device_id = ?1 AND uuid = ?2 AND state_type = ?3 AND counter = ?4
                 RETURNING updated_at",
                params![
                    key.device_id,
                    key.uuid_column(),
                    key.state_type,
                    key.counter,
                    data,
                    unix_millis_now()
                ],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn query_strings(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let values = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(values)
    }
}

fn state_hash(key: &StateKey, updated_at: i64) -> String {
    let material = format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{updated_at}",
        key.device_id,
        key.uuid_column(),
        key.state_type,
        key.counter
    );
    short_digest(material.as_bytes(), 32)
}
