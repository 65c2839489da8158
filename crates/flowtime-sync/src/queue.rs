//! Durable outbox of pending sync operations
//!
//! The queue answers "what exactly must be sent, and in what order"; the
//! ledger answers "is this field stale". The backing table survives process
//! restarts so an offline device accumulates a correct backlog. Ordering is
//! FIFO per user; a pending upsert for an entity is coalesced to the newest
//! snapshot without giving up its queue position.

use std::future::Future;
use std::sync::Arc;

use flowtime_core::db::{Database, QueueOp, QueueRow};
use flowtime_core::{Syncable, TimestampLedger, UserId, UserSettings};

use crate::error::{SyncError, SyncResult};

/// Durable, ordered outbox for one user's pending mutations
pub struct SyncQueue {
    db: Arc<Database>,
    owner: UserId,
    kind: Option<&'static str>,
}

impl SyncQueue {
    /// Queue over the given database, scoped to `owner`
    #[must_use]
    pub const fn new(db: Arc<Database>, owner: UserId) -> Self {
        Self {
            db,
            owner,
            kind: None,
        }
    }

    /// Queue view restricted to one entity kind.
    ///
    /// The backing table is shared; scoping is what keeps each engine's
    /// drain from touching another engine's entries while preserving FIFO
    /// within the kind.
    #[must_use]
    pub const fn scoped(db: Arc<Database>, owner: UserId, kind: &'static str) -> Self {
        Self {
            db,
            owner,
            kind: Some(kind),
        }
    }

    /// Append an operation, coalescing with a pending upsert for the same
    /// entity
    pub fn enqueue(
        &self,
        kind: &str,
        op: QueueOp,
        entity_id: &str,
        snapshot: &serde_json::Value,
        stamped_at: i64,
    ) -> SyncResult<()> {
        self.db
            .queue_push(kind, op, entity_id, self.owner, snapshot, stamped_at)?;
        Ok(())
    }

    /// All pending entries in scope, oldest first
    pub fn pending(&self) -> SyncResult<Vec<QueueRow>> {
        let entries = self
            .db
            .queue_entries(self.owner)?
            .into_iter()
            .filter(|e| self.kind.is_none_or(|kind| e.kind == kind))
            .collect();
        Ok(entries)
    }

    /// Number of pending entries
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.pending()?.len())
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.pending()?.is_empty())
    }

    /// Process entries head-first, removing each on success.
    ///
    /// A failing entry stays at the head of the queue and aborts the drain;
    /// it will be retried on the next cycle. Returns how many entries were
    /// confirmed.
    pub async fn drain<F, Fut>(&self, mut handler: F) -> SyncResult<usize>
    where
        F: FnMut(QueueRow) -> Fut,
        Fut: Future<Output = SyncResult<()>>,
    {
        let mut confirmed = 0;
        for entry in self.pending()? {
            let seq = entry.seq;
            match handler(entry).await {
                Ok(()) => {
                    self.db.queue_remove(seq)?;
                    confirmed += 1;
                }
                Err(error) => {
                    tracing::warn!(seq, confirmed, %error, "queue drain stopped; entry left at head");
                    return Err(error);
                }
            }
        }
        Ok(confirmed)
    }

    /// Drop entries whose backing claim no longer exists: an upsert with no
    /// live ledger stamp for the entity, or a delete with no tombstone.
    ///
    /// Run after a pull/merge has settled which fields are still locally
    /// authoritative; draining such entries would overwrite freshly adopted
    /// remote state with stale snapshots.
    pub fn prune_stale(&self, ledger: &TimestampLedger) -> SyncResult<usize> {
        let mut pruned = 0;
        for entry in self.pending()? {
            let live = match entry.op {
                QueueOp::Upsert => {
                    // Settings are a singleton; any live claim under the
                    // kind keeps the entry.
                    let prefix = if entry.kind == UserSettings::KIND {
                        format!("{}/", entry.kind)
                    } else {
                        format!("{}/{}", entry.kind, entry.entity_id)
                    };
                    !ledger.entries_with_prefix(self.owner, &prefix).is_empty()
                }
                QueueOp::Delete => self
                    .db
                    .list_tombstones(&entry.kind, self.owner)?
                    .iter()
                    .any(|t| t.id == entry.entity_id),
            };
            if !live {
                tracing::debug!(seq = entry.seq, kind = %entry.kind, id = %entry.entity_id, "pruning stale queue entry");
                self.db.queue_remove(entry.seq)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn setup() -> (SyncQueue, Arc<Database>, UserId) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let owner = UserId::new();
        (SyncQueue::new(Arc::clone(&db), owner), db, owner)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_drain_fifo_and_removal() {
        let (queue, _db, _owner) = setup();
        queue
            .enqueue("task", QueueOp::Upsert, "a", &serde_json::json!({}), 1)
            .unwrap();
        queue
            .enqueue("task", QueueOp::Upsert, "b", &serde_json::json!({}), 2)
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let confirmed = queue
            .drain(|entry| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(entry.entity_id);
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(confirmed, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_entry_stays_at_head() {
        let (queue, _db, _owner) = setup();
        queue
            .enqueue("task", QueueOp::Upsert, "a", &serde_json::json!({}), 1)
            .unwrap();
        queue
            .enqueue("task", QueueOp::Upsert, "b", &serde_json::json!({}), 2)
            .unwrap();

        let result = queue
            .drain(|_entry| async {
                Err(SyncError::Api {
                    status: 503,
                    message: "down".into(),
                })
            })
            .await;

        assert!(result.is_err());
        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].entity_id, "a");
    }

    #[test]
    fn test_scoped_queue_filters_other_kinds() {
        let (queue, db, owner) = setup();
        queue
            .enqueue("task", QueueOp::Upsert, "t1", &serde_json::json!({}), 1)
            .unwrap();
        queue
            .enqueue("preset", QueueOp::Upsert, "p1", &serde_json::json!({}), 2)
            .unwrap();

        let scoped = SyncQueue::scoped(db, owner, "task");
        let pending = scoped.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "t1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prune_stale() {
        let (queue, db, owner) = setup();
        let mut ledger = TimestampLedger::new();
        ledger.stamp(owner, "task/live", 100);
        db.record_tombstone("preset", "dead", owner, 100).unwrap();

        queue
            .enqueue("task", QueueOp::Upsert, "live", &serde_json::json!({}), 100)
            .unwrap();
        queue
            .enqueue("task", QueueOp::Upsert, "stale", &serde_json::json!({}), 100)
            .unwrap();
        queue
            .enqueue(
                "preset",
                QueueOp::Delete,
                "dead",
                &serde_json::json!({"id": "dead"}),
                100,
            )
            .unwrap();
        queue
            .enqueue(
                "preset",
                QueueOp::Delete,
                "gone",
                &serde_json::json!({"id": "gone"}),
                100,
            )
            .unwrap();

        let pruned = queue.prune_stale(&ledger).unwrap();
        assert_eq!(pruned, 2);

        let ids: Vec<String> = queue
            .pending()
            .unwrap()
            .into_iter()
            .map(|e| e.entity_id)
            .collect();
        assert_eq!(ids, vec!["live", "dead"]);
    }
}
