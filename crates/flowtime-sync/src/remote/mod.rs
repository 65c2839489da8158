//! Remote backend client
//!
//! A thin, entity-agnostic abstraction over the backend's CRUD surface.
//! Rows are plain JSON objects so one client serves all four collections;
//! the engines convert entities to and from rows at the edge.

mod rest;

pub use rest::RestRemote;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{SyncError, SyncResult};

/// One remote record, as an untyped JSON object
pub type RemoteRow = serde_json::Map<String, serde_json::Value>;

/// Filter for selects and deletes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFilter {
    /// Match rows owned by this user
    pub owner: Option<String>,
    /// Match one row by id
    pub id: Option<String>,
    /// Match on the archived flag
    pub archived: Option<bool>,
    /// Sort specification, e.g. `started_at.desc`
    pub order_by: Option<String>,
}

impl RemoteFilter {
    /// Filter to one user's rows
    #[must_use]
    pub fn owner(uid: impl Into<String>) -> Self {
        Self {
            owner: Some(uid.into()),
            ..Self::default()
        }
    }

    /// Narrow to a single id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Narrow on the archived flag
    #[must_use]
    pub const fn with_archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    /// Request server-side ordering
    #[must_use]
    pub fn with_order(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }
}

/// CRUD surface of one remote collection.
///
/// Implementations must treat `upsert` as upsert-by-`conflict_key`, which
/// makes pushes idempotent.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Fetch rows matching the filter
    async fn select(&self, collection: &str, filter: &RemoteFilter) -> SyncResult<Vec<RemoteRow>>;

    /// Insert or update rows, resolving conflicts on `conflict_key`
    async fn upsert(
        &self,
        collection: &str,
        rows: Vec<RemoteRow>,
        conflict_key: &str,
    ) -> SyncResult<()>;

    /// Delete rows matching the filter
    async fn delete(&self, collection: &str, filter: &RemoteFilter) -> SyncResult<()>;
}

/// Remote comparison timestamp for a row: `updated_at` if present, else
/// `created_at`, else `None` (which always loses to any local claim)
#[must_use]
pub fn remote_timestamp(row: &RemoteRow) -> Option<i64> {
    row.get("updated_at")
        .and_then(serde_json::Value::as_i64)
        .or_else(|| row.get("created_at").and_then(serde_json::Value::as_i64))
}

/// Serialize an entity into a remote row
pub fn entity_to_row<E: Serialize>(entity: &E) -> SyncResult<RemoteRow> {
    match serde_json::to_value(entity)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(SyncError::InvalidRequest(
            "entity did not serialize to an object".to_string(),
        )),
    }
}

/// Decode a remote row into an entity.
///
/// Fails on malformed identity fields; callers skip (and log) such rows
/// rather than aborting the merge.
pub fn row_to_entity<E: DeserializeOwned>(row: RemoteRow) -> SyncResult<E> {
    Ok(serde_json::from_value(serde_json::Value::Object(row))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtime_core::{Session, UserId};

    #[test]
    fn test_remote_timestamp_fallback_chain() {
        let mut row = RemoteRow::new();
        assert_eq!(remote_timestamp(&row), None);

        row.insert("created_at".into(), 50.into());
        assert_eq!(remote_timestamp(&row), Some(50));

        row.insert("updated_at".into(), 100.into());
        assert_eq!(remote_timestamp(&row), Some(100));
    }

    #[test]
    fn test_entity_row_round_trip() {
        let session = Session::new(UserId::new(), 1000, 1500);
        let row = entity_to_row(&session).unwrap();
        assert_eq!(row["duration_secs"], 1500);

        let back: Session = row_to_entity(row).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn test_row_with_malformed_id_fails_decode() {
        let mut row = RemoteRow::new();
        row.insert("id".into(), "not-a-uuid".into());
        row.insert("owner".into(), UserId::new().as_str().into());
        row.insert("started_at".into(), 0.into());
        row.insert("duration_secs".into(), 60.into());
        row.insert("created_at".into(), 0.into());

        assert!(row_to_entity::<Session>(row).is_err());
    }
}
