//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })
        .optional()?
        .flatten();

    Ok(version.unwrap_or(0))
}

/// Run one migration script atomically, rolling back on failure
fn apply(conn: &Connection, statements: &str) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    if let Err(e) = conn.execute_batch(statements) {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: commit ledger, entity store, partners and collections
fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        -- Commit ledger: one head pointer per logical stream
        CREATE TABLE IF NOT EXISTS object_sync_commit_heads (
            type_key TEXT PRIMARY KEY,
            head_commit_id INTEGER NOT NULL
        );

        -- Entity store consumed by collections
        CREATE TABLE IF NOT EXISTS sync_objects (
            stream TEXT NOT NULL,
            id TEXT NOT NULL,
            commit_id INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            parent_id TEXT,
            fields TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (stream, id)
        );
        CREATE INDEX IF NOT EXISTS idx_sync_objects_commit ON sync_objects(stream, commit_id);

        CREATE TABLE IF NOT EXISTS sync_object_fields (
            stream TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (stream, name)
        );

        CREATE TABLE IF NOT EXISTS object_sync_partners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pid TEXT NOT NULL UNIQUE,
            owner_id TEXT NOT NULL,
            ts_last_sync INTEGER
        );

        CREATE TABLE IF NOT EXISTS object_sync_partner_collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type INTEGER NOT NULL,
            partner_id INTEGER NOT NULL REFERENCES object_sync_partners(id) ON DELETE CASCADE,
            object_type TEXT NOT NULL,
            field_name TEXT,
            conditions TEXT NOT NULL DEFAULT '[]',
            conditions_hash TEXT NOT NULL,
            f_initialized INTEGER NOT NULL DEFAULT 0,
            ts_init_started INTEGER,
            revision INTEGER NOT NULL DEFAULT 0,
            last_commit_id INTEGER NOT NULL DEFAULT 0,
            stale_checked_commit_id INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_partner_collections_identity
            ON object_sync_partner_collections(partner_id, type, object_type, COALESCE(field_name, ''), conditions_hash);

        CREATE TABLE IF NOT EXISTS object_sync_partner_collection_init (
            collection_id INTEGER NOT NULL REFERENCES object_sync_partner_collections(id) ON DELETE CASCADE,
            parent_id TEXT NOT NULL DEFAULT '',
            ts_completed INTEGER NOT NULL,
            PRIMARY KEY (collection_id, parent_id)
        );

        CREATE TABLE IF NOT EXISTS object_sync_import (
            collection_id INTEGER NOT NULL REFERENCES object_sync_partner_collections(id) ON DELETE CASCADE,
            object_type TEXT NOT NULL,
            object_id TEXT,
            unique_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            parent_id TEXT NOT NULL DEFAULT '',
            field_name TEXT NOT NULL DEFAULT '',
            UNIQUE (collection_id, unique_id, field_name)
        );
        CREATE INDEX IF NOT EXISTS idx_sync_import_parent ON object_sync_import(collection_id, parent_id);

        CREATE TABLE IF NOT EXISTS object_sync_export (
            collection_id INTEGER NOT NULL REFERENCES object_sync_partner_collections(id) ON DELETE CASCADE,
            object_id TEXT NOT NULL,
            commit_id INTEGER NOT NULL,
            action TEXT NOT NULL,
            ts_exported INTEGER NOT NULL,
            PRIMARY KEY (collection_id, object_id)
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: device state machine
fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        "CREATE TABLE IF NOT EXISTS async_device_states (
            id_state INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            uuid TEXT NOT NULL DEFAULT '',
            state_type TEXT NOT NULL,
            counter INTEGER NOT NULL DEFAULT 0,
            state_data BLOB,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (device_id, uuid, state_type, counter)
        );
        CREATE INDEX IF NOT EXISTS idx_device_states_device ON async_device_states(device_id);

        CREATE TABLE IF NOT EXISTS async_users (
            username TEXT NOT NULL,
            device_id TEXT NOT NULL,
            PRIMARY KEY (username, device_id)
        );
        CREATE INDEX IF NOT EXISTS idx_async_users_device ON async_users(device_id);

        INSERT OR IGNORE INTO schema_version (version) VALUES (2);",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_creates_sync_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        for table in [
            "object_sync_commit_heads",
            "object_sync_partners",
            "object_sync_partner_collections",
            "object_sync_partner_collection_init",
            "object_sync_import",
            "object_sync_export",
            "async_device_states",
            "async_users",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }
}
