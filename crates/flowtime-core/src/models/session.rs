//! Completed focus session model

use serde::{Deserialize, Serialize};

use super::{SessionId, Syncable, UserId};
use crate::now_ms;

/// A completed focus session.
///
/// Sessions are append-only: they are created once when a timer finishes and
/// are never updated or deleted in steady state, which is what makes the
/// union merge safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,
    /// Owning user
    pub owner: UserId,
    /// Optional label (usually the preset or task name)
    #[serde(default)]
    pub name: Option<String>,
    /// When the session started (unix ms)
    pub started_at: i64,
    /// How long the session ran, in seconds
    pub duration_secs: u32,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
}

impl Session {
    /// Record a new completed session
    #[must_use]
    pub fn new(owner: UserId, started_at: i64, duration_secs: u32) -> Self {
        Self {
            id: SessionId::new(),
            owner,
            name: None,
            started_at,
            duration_secs,
            created_at: now_ms(),
        }
    }
}

impl Syncable for Session {
    const KIND: &'static str = "session";
    const TOMBSTONED: bool = false;

    fn id_str(&self) -> String {
        self.id.as_str()
    }

    fn owner(&self) -> UserId {
        self.owner
    }

    // Append-only, so creation time doubles as the remote comparison time.
    fn updated_at(&self) -> i64 {
        self.created_at
    }
}
