//! Database connection management
//!
//! One SQLite file holds everything the sync layer must keep across process
//! restarts: the entity collections, the timestamp ledger, the deletion
//! tombstones, and the pending-operation queue. Keeping them in one file is
//! what lets an entity write and its ledger stamp commit in a single
//! transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection};

use super::migrations;
use super::{QueueOp, QueueRow, Tombstone};
use crate::error::Result;
use crate::models::{Syncable, UserId};

/// Wrapper around the local SQLite database
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure(&conn)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-query; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ----- entities -------------------------------------------------------

    /// Load every entity of kind `E` owned by `owner`, newest first
    pub fn load_entities<E: Syncable>(&self, owner: UserId) -> Result<Vec<E>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload FROM entities WHERE kind = ? AND owner = ? ORDER BY updated_at DESC",
        )?;
        let payloads = stmt
            .query_map(params![E::KIND, owner.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entities = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<E>(&payload) {
                Ok(entity) => entities.push(entity),
                Err(error) => {
                    tracing::warn!(kind = E::KIND, %error, "skipping undecodable local row");
                }
            }
        }
        Ok(entities)
    }

    /// Write one entity and its ledger stamps in a single transaction.
    ///
    /// This is the atomicity guarantee behind every user-facing mutation: an
    /// entity change can never land without the stamps that make the sync
    /// layer push it.
    pub fn upsert_entity<E: Syncable>(&self, entity: &E, stamps: &[(String, i64)]) -> Result<()> {
        let payload = serde_json::to_string(entity)?;
        let owner = entity.owner().as_str();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO entities (kind, id, owner, payload, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                E::KIND,
                entity.id_str(),
                owner,
                payload,
                entity.updated_at()
            ],
        )?;
        for (field, at) in stamps {
            tx.execute(
                "INSERT OR REPLACE INTO ledger (namespace, field, stamped_at) VALUES (?, ?, ?)",
                params![owner, field, at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Hard-delete an entity, dropping its ledger stamps and optionally
    /// recording a tombstone, all in one transaction
    pub fn delete_entity(
        &self,
        kind: &str,
        id: &str,
        owner: UserId,
        tombstone_at: Option<i64>,
    ) -> Result<()> {
        let owner = owner.as_str();
        let whole = format!("{kind}/{id}");
        let prefix = format!("{kind}/{id}/%");

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entities WHERE kind = ? AND id = ? AND owner = ?",
            params![kind, id, owner],
        )?;
        tx.execute(
            "DELETE FROM ledger WHERE namespace = ? AND (field = ? OR field LIKE ?)",
            params![owner, whole, prefix],
        )?;
        if let Some(deleted_at) = tombstone_at {
            tx.execute(
                "INSERT OR REPLACE INTO tombstones (kind, id, owner, deleted_at)
                 VALUES (?, ?, ?, ?)",
                params![kind, id, owner, deleted_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the whole collection of kind `E` for `owner`.
    ///
    /// Used only by the sync engines to apply a merge result.
    pub fn replace_entities<E: Syncable>(&self, owner: UserId, items: &[E]) -> Result<()> {
        let owner = owner.as_str();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entities WHERE kind = ? AND owner = ?",
            params![E::KIND, owner],
        )?;
        for entity in items {
            let payload = serde_json::to_string(entity)?;
            tx.execute(
                "INSERT OR REPLACE INTO entities (kind, id, owner, payload, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![E::KIND, entity.id_str(), owner, payload, entity.updated_at()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ----- ledger ---------------------------------------------------------

    /// Load every persisted ledger entry across all namespaces
    pub fn load_ledger(&self) -> Result<Vec<(UserId, String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT namespace, field, stamped_at FROM ledger")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (ns, field, at) in rows {
            match UserId::from_str(&ns) {
                Ok(ns) => entries.push((ns, field, at)),
                Err(_) => tracing::warn!(%ns, "skipping ledger row with malformed namespace"),
            }
        }
        Ok(entries)
    }

    /// Persist one ledger stamp
    pub fn stamp_ledger(&self, ns: UserId, field: &str, at: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO ledger (namespace, field, stamped_at) VALUES (?, ?, ?)",
            params![ns.as_str(), field, at],
        )?;
        Ok(())
    }

    /// Remove one persisted ledger stamp
    pub fn clear_ledger(&self, ns: UserId, field: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM ledger WHERE namespace = ? AND field = ?",
            params![ns.as_str(), field],
        )?;
        Ok(())
    }

    // ----- tombstones -----------------------------------------------------

    /// Record that an entity was deleted locally
    pub fn record_tombstone(
        &self,
        kind: &str,
        id: &str,
        owner: UserId,
        deleted_at: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO tombstones (kind, id, owner, deleted_at) VALUES (?, ?, ?, ?)",
            params![kind, id, owner.as_str(), deleted_at],
        )?;
        Ok(())
    }

    /// All tombstones of one kind for one user
    pub fn list_tombstones(&self, kind: &str, owner: UserId) -> Result<Vec<Tombstone>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, deleted_at FROM tombstones WHERE kind = ? AND owner = ?")?;
        let tombstones = stmt
            .query_map(params![kind, owner.as_str()], |row| {
                Ok(Tombstone {
                    id: row.get(0)?,
                    deleted_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tombstones)
    }

    /// Drop a tombstone once the remote delete is confirmed
    pub fn clear_tombstone(&self, kind: &str, id: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM tombstones WHERE kind = ? AND id = ?",
            params![kind, id],
        )?;
        Ok(())
    }

    // ----- sync queue -----------------------------------------------------

    /// Append a pending operation, coalescing with an existing pending
    /// entry for the same entity and op (latest snapshot wins, original
    /// queue position is kept so nothing reorders)
    pub fn queue_push(
        &self,
        kind: &str,
        op: QueueOp,
        entity_id: &str,
        owner: UserId,
        snapshot: &serde_json::Value,
        stamped_at: i64,
    ) -> Result<i64> {
        let snapshot = serde_json::to_string(snapshot)?;
        let owner = owner.as_str();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT seq FROM sync_queue
                 WHERE kind = ? AND entity_id = ? AND owner = ? AND op = ?",
                params![kind, entity_id, owner, op.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let seq = if let Some(seq) = existing {
            tx.execute(
                "UPDATE sync_queue SET snapshot = ?, stamped_at = ? WHERE seq = ?",
                params![snapshot, stamped_at, seq],
            )?;
            seq
        } else {
            tx.execute(
                "INSERT INTO sync_queue (kind, op, entity_id, owner, snapshot, stamped_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![kind, op.as_str(), entity_id, owner, snapshot, stamped_at],
            )?;
            tx.last_insert_rowid()
        };
        tx.commit()?;
        Ok(seq)
    }

    /// All pending operations for one user, oldest first
    pub fn queue_entries(&self, owner: UserId) -> Result<Vec<QueueRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, kind, op, entity_id, snapshot, stamped_at
             FROM sync_queue WHERE owner = ? ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![owner.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (seq, kind, op, entity_id, snapshot, stamped_at) in rows {
            let Some(op) = QueueOp::parse(&op) else {
                tracing::warn!(seq, %op, "skipping queue row with unknown op");
                continue;
            };
            let snapshot = match serde_json::from_str(&snapshot) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(seq, %error, "skipping queue row with undecodable snapshot");
                    continue;
                }
            };
            entries.push(QueueRow {
                seq,
                kind,
                op,
                entity_id,
                snapshot,
                stamped_at,
            });
        }
        Ok(entries)
    }

    /// Remove a queue entry after it has been pushed (or pruned)
    pub fn queue_remove(&self, seq: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM sync_queue WHERE seq = ?", params![seq])?;
        Ok(())
    }
}

/// Configure SQLite for a local-first workload
fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}
