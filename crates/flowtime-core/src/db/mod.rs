//! Database layer for Flowtime

mod connection;
mod migrations;

pub use connection::Database;

use serde::{Deserialize, Serialize};

/// Kind of pending operation in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOp {
    /// Send the entity snapshot as an upsert-by-id
    Upsert,
    /// Delete the entity remotely
    Delete,
}

impl QueueOp {
    /// Stable string form stored in SQLite
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    /// Inverse of [`Self::as_str`]
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(Self::Upsert),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A persisted pending operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    /// Queue position (FIFO per user)
    pub seq: i64,
    /// Entity kind tag
    pub kind: String,
    /// Operation to perform remotely
    pub op: QueueOp,
    /// Target entity id
    pub entity_id: String,
    /// Entity state captured at enqueue time
    pub snapshot: serde_json::Value,
    /// Local mutation time the snapshot corresponds to (unix ms)
    pub stamped_at: i64,
}

/// A local deletion marker.
///
/// Kept separate from the timestamp ledger on purpose: a timestamp alone
/// cannot distinguish "never synced" from "deleted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Deleted entity id
    pub id: String,
    /// When the local delete happened (unix ms)
    pub deleted_at: i64,
}
