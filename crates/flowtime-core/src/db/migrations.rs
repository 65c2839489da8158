//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: Initial schema
///
/// Everything the sync layer must carry across a process restart lives in
/// these four tables: the entity collections, the timestamp ledger, the
/// deletion tombstones, and the pending-operation queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            owner TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, id)
        );
        CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(kind, owner);
        CREATE INDEX IF NOT EXISTS idx_entities_updated ON entities(updated_at DESC);
        CREATE TABLE IF NOT EXISTS ledger (
            namespace TEXT NOT NULL,
            field TEXT NOT NULL,
            stamped_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, field)
        );
        CREATE TABLE IF NOT EXISTS tombstones (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            owner TEXT NOT NULL,
            deleted_at INTEGER NOT NULL,
            PRIMARY KEY (kind, id)
        );
        CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            op TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            snapshot TEXT NOT NULL,
            stamped_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_owner ON sync_queue(owner, seq);
        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v1_creates_sync_tables() {
        let conn = setup();
        run(&conn).unwrap();

        for table in ["entities", "ledger", "tombstones", "sync_queue"] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(
                        SELECT 1 FROM sqlite_master
                        WHERE type = 'table' AND name = ?
                    )",
                    [table],
                    |row| row.get::<_, i32>(0).map(|v| v != 0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }
}
