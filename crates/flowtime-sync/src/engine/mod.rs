//! Sync engine skeleton
//!
//! One engine per entity type, each with its own single-writer observer
//! task. Lifecycle: `Stopped -> Starting (pull + merge) -> Running
//! (observe + debounced push) -> Stopped`. The pull always precedes the
//! first push; stopping cancels observation but leaves the ledger, the
//! tombstones, and the queue intact for the next start.

pub mod presets;
pub mod sessions;
pub mod settings;
pub mod tasks;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use flowtime_core::db::{Database, QueueOp, QueueRow, Tombstone};
use flowtime_core::store::{ChangeOrigin, LocalStore, StoreEvent};
use flowtime_core::{Syncable, TimestampLedger, UserId};

use crate::error::{SyncError, SyncResult};
use crate::queue::SyncQueue;
use crate::remote::{
    entity_to_row, remote_timestamp, row_to_entity, RemoteCollection, RemoteFilter, RemoteRow,
};

/// Unified sync status exposed to the UI layers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Engine lifecycle state.
///
/// `Applying` is the formalized re-entrancy guard: while the engine is
/// applying a merge result the observer ignores change events, in addition
/// to skipping `Sync`-origin events outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Applying,
    Running,
}

/// Tuning knobs for a sync engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Quiet period required before a burst of local changes is pushed
    pub debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Set the debounce window (tests use a short one)
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Result of a merge strategy, computed without any I/O
#[derive(Debug, Clone)]
pub struct MergeOutcome<E> {
    /// New canonical local state
    pub merged: Vec<E>,
    /// Entities the local side is authoritative for, to be pushed
    pub push: Vec<E>,
    /// Ids with a local tombstone that must be deleted remotely
    pub delete_remote: Vec<String>,
    /// Ledger keys whose local claim lost and can be dropped immediately
    pub clear_keys: Vec<String>,
}

impl<E> Default for MergeOutcome<E> {
    fn default() -> Self {
        Self {
            merged: Vec::new(),
            push: Vec::new(),
            delete_remote: Vec::new(),
            clear_keys: Vec::new(),
        }
    }
}

/// Decode pulled rows, skipping rows with malformed identity.
///
/// A bad row is logged and dropped; it never aborts the merge.
#[must_use]
pub fn decode_rows<E: Syncable>(rows: Vec<RemoteRow>) -> Vec<(E, Option<i64>)> {
    rows.into_iter()
        .filter_map(|row| {
            let ts = remote_timestamp(&row);
            match row_to_entity::<E>(row) {
                Ok(entity) => Some((entity, ts)),
                Err(error) => {
                    tracing::warn!(kind = E::KIND, %error, "skipping undecodable remote row");
                    None
                }
            }
        })
        .collect()
}

/// Entity-specific half of a sync engine: the collection it talks to and
/// the merge strategy it runs
pub trait EngineDriver: Send + Sync + 'static {
    /// Entity type this driver syncs
    type Entity: Syncable;

    /// Remote collection name
    const COLLECTION: &'static str;

    /// Filter for the initial pull
    #[must_use]
    fn pull_filter(owner: UserId) -> RemoteFilter {
        RemoteFilter::owner(owner.as_str())
    }

    /// Reconcile local state with pulled remote state
    fn merge(
        local: Vec<Self::Entity>,
        remote: Vec<(Self::Entity, Option<i64>)>,
        ledger: &TimestampLedger,
        tombstones: &[Tombstone],
        ns: UserId,
    ) -> MergeOutcome<Self::Entity>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Newest claim stamp per entity id among ledger entries under `kind_prefix`
fn newest_claim_stamps(claims: Vec<(String, i64)>, kind_prefix: &str) -> HashMap<String, i64> {
    let mut newest: HashMap<String, i64> = HashMap::new();
    for (field, stamped_at) in claims {
        let Some(entity_id) = field[kind_prefix.len()..].split('/').next() else {
            continue;
        };
        if entity_id.is_empty() {
            continue;
        }
        let at = newest.entry(entity_id.to_string()).or_insert(stamped_at);
        *at = (*at).max(stamped_at);
    }
    newest
}

struct Lifecycle {
    state: EngineState,
    generation: u64,
    observer: Option<JoinHandle<()>>,
}

/// Sync engine over a [`LocalStore`]; cheap to clone, all clones share one
/// lifecycle. The settings engine has its own singleton-shaped twin in
/// [`settings`].
pub struct SyncEngine<D: EngineDriver> {
    core: Arc<Core<D>>,
}

impl<D: EngineDriver> Clone for SyncEngine<D> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct Core<D: EngineDriver> {
    store: Arc<LocalStore<D::Entity>>,
    remote: Arc<dyn RemoteCollection>,
    queue: SyncQueue,
    ledger: Arc<Mutex<TimestampLedger>>,
    db: Arc<Database>,
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
    status: Mutex<SyncState>,
    _driver: PhantomData<D>,
}

impl<D: EngineDriver> SyncEngine<D> {
    /// Build an engine over explicitly injected services
    #[must_use]
    pub fn new(
        store: Arc<LocalStore<D::Entity>>,
        remote: Arc<dyn RemoteCollection>,
        ledger: Arc<Mutex<TimestampLedger>>,
        db: Arc<Database>,
        config: EngineConfig,
    ) -> Self {
        let queue = SyncQueue::scoped(Arc::clone(&db), store.owner(), D::Entity::KIND);
        Self {
            core: Arc::new(Core {
                store,
                remote,
                queue,
                ledger,
                db,
                config,
                lifecycle: Mutex::new(Lifecycle {
                    state: EngineState::Stopped,
                    generation: 0,
                    observer: None,
                }),
                status: Mutex::new(SyncState::Offline),
                _driver: PhantomData,
            }),
        }
    }

    /// Current UI-facing status
    #[must_use]
    pub fn status(&self) -> SyncState {
        *lock(&self.core.status)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn engine_state(&self) -> EngineState {
        lock(&self.core.lifecycle).state
    }

    /// Pull, merge, apply, push, then start observing local changes.
    ///
    /// A pull failure aborts the start and leaves the engine `Stopped`;
    /// push failures are tolerated (the claims stay pending for retry).
    pub async fn start(&self, user: UserId) -> SyncResult<()> {
        let core = &self.core;
        if user != core.store.owner() {
            return Err(SyncError::Core(flowtime_core::Error::InvalidInput(
                format!("engine store is scoped to {}", core.store.owner()),
            )));
        }
        let generation = {
            let mut lifecycle = lock(&core.lifecycle);
            if lifecycle.state != EngineState::Stopped {
                return Ok(());
            }
            lifecycle.state = EngineState::Starting;
            lifecycle.generation += 1;
            lifecycle.generation
        };
        core.set_status(SyncState::Syncing);

        // Subscribe before the pull: a mutation racing the initial sync
        // still leaves an event for the observer to flush once it spawns.
        let rx = core.store.subscribe();

        let rows = match core.remote.select(D::COLLECTION, &D::pull_filter(user)).await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(collection = D::COLLECTION, %error, "pull failed; engine left stopped");
                lock(&core.lifecycle).state = EngineState::Stopped;
                core.set_failure_status(&error);
                return Err(error);
            }
        };
        if !core.generation_current(generation) {
            return Err(SyncError::NotRunning);
        }

        let remote_entities = decode_rows::<D::Entity>(rows);
        let kind_prefix = format!("{}/", D::Entity::KIND);
        let (outcome, claim_cutoffs) = {
            let ledger = lock(&core.ledger);
            let tombstones = if D::Entity::TOMBSTONED {
                core.db.list_tombstones(D::Entity::KIND, user)?
            } else {
                Vec::new()
            };
            let outcome = D::merge(
                core.store.current_state(),
                remote_entities,
                &ledger,
                &tombstones,
                user,
            );
            // The claims the merge saw are the ones the post-merge push
            // confirms; anything stamped later belongs to a newer mutation.
            let cutoffs =
                newest_claim_stamps(ledger.entries_with_prefix(user, &kind_prefix), &kind_prefix);
            (outcome, cutoffs)
        };

        lock(&core.lifecycle).state = EngineState::Applying;
        if let Err(error) = core.apply_outcome(user, &outcome) {
            lock(&core.lifecycle).state = EngineState::Stopped;
            core.set_status(SyncState::Error);
            return Err(error);
        }

        // Initial push of everything the merge marked; failures stay
        // pending and the observer loop retries them.
        match core.push_outcome(user, &outcome, &claim_cutoffs).await {
            Ok(()) => core.set_status(SyncState::Synced),
            Err(error) => {
                tracing::warn!(collection = D::COLLECTION, %error, "initial push failed; left pending");
                core.set_failure_status(&error);
            }
        }

        if !core.generation_current(generation) {
            return Err(SyncError::NotRunning);
        }

        let observer_core = Arc::clone(core);
        let handle = tokio::spawn(async move {
            observer_core.observe(user, generation, rx).await;
        });
        let mut lifecycle = lock(&core.lifecycle);
        lifecycle.state = EngineState::Running;
        lifecycle.observer = Some(handle);
        Ok(())
    }

    /// Cancel observation and drop in-memory engine state.
    ///
    /// The ledger, tombstones, and queue survive for the next `start`. An
    /// in-flight network call is not cancelled; its result is discarded via
    /// the generation check.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Skip the debounce window and push everything pending right now
    pub async fn force_flush(&self) -> SyncResult<usize> {
        if self.engine_state() != EngineState::Running {
            return Err(SyncError::NotRunning);
        }
        let owner = self.core.store.owner();
        let result = self.core.flush(owner).await;
        match &result {
            Ok(_) => self.core.set_status(SyncState::Synced),
            Err(error) => self.core.set_failure_status(error),
        }
        result
    }
}

impl<D: EngineDriver> Core<D> {
    fn set_status(&self, status: SyncState) {
        *lock(&self.status) = status;
    }

    fn set_failure_status(&self, error: &SyncError) {
        self.set_status(if error.is_transient() {
            SyncState::Offline
        } else {
            SyncState::Error
        });
    }

    /// True while `generation` is still the live run and the engine has not
    /// been stopped; in-flight results are discarded when this turns false
    fn generation_current(&self, generation: u64) -> bool {
        let lifecycle = lock(&self.lifecycle);
        lifecycle.generation == generation && lifecycle.state != EngineState::Stopped
    }

    fn stop(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if let Some(handle) = lifecycle.observer.take() {
            handle.abort();
        }
        lifecycle.state = EngineState::Stopped;
        lifecycle.generation += 1;
        drop(lifecycle);
        self.set_status(SyncState::Offline);
    }

    /// Write the merge result into the store (under the `Applying` guard)
    /// and drop the ledger claims that lost to the remote
    fn apply_outcome(&self, user: UserId, outcome: &MergeOutcome<D::Entity>) -> SyncResult<()> {
        self.store.apply_merged_state(outcome.merged.clone())?;

        let mut ledger = lock(&self.ledger);
        for field in &outcome.clear_keys {
            ledger.clear(user, field);
            self.db.clear_ledger(user, field)?;
        }
        let pruned = self.queue.prune_stale(&ledger)?;
        if pruned > 0 {
            tracing::debug!(collection = D::COLLECTION, pruned, "pruned stale queue entries");
        }
        Ok(())
    }

    /// Batch-push merge-marked entities and issue tombstoned deletes.
    ///
    /// Confirmation clears only claims up to each entity's cutoff, the
    /// newest stamp the merge observed; a claim stamped while the push was
    /// in flight carries a mutation this snapshot does not, and survives.
    async fn push_outcome(
        &self,
        user: UserId,
        outcome: &MergeOutcome<D::Entity>,
        claim_cutoffs: &HashMap<String, i64>,
    ) -> SyncResult<()> {
        if !outcome.push.is_empty() {
            let rows = outcome
                .push
                .iter()
                .map(entity_to_row)
                .collect::<SyncResult<Vec<_>>>()?;
            self.remote.upsert(D::COLLECTION, rows, "id").await?;
            for entity in &outcome.push {
                let id = entity.id_str();
                if let Some(&up_to) = claim_cutoffs.get(&id) {
                    self.clear_entity_claims(user, &id, up_to)?;
                }
            }
        }
        for id in &outcome.delete_remote {
            self.remote
                .delete(
                    D::COLLECTION,
                    &RemoteFilter::owner(user.as_str()).with_id(id),
                )
                .await?;
            self.db.clear_tombstone(D::Entity::KIND, id)?;
        }
        Ok(())
    }

    /// Observer loop: debounce local-origin change events, then enqueue and
    /// drain. Runs until the channel closes or the generation goes stale.
    async fn observe(
        self: Arc<Self>,
        user: UserId,
        generation: u64,
        mut rx: broadcast::Receiver<StoreEvent>,
    ) {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.origin == ChangeOrigin::Sync
                        || lock(&self.lifecycle).state == EngineState::Applying
                    {
                        continue;
                    }
                }
                // Lagging just means a burst outran the channel; there is
                // definitely something to push.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }

            // Absorb the burst until it goes quiet for the debounce window.
            loop {
                match tokio::time::timeout(self.config.debounce, rx.recv()).await {
                    Ok(Ok(_) | Err(broadcast::error::RecvError::Lagged(_))) => {}
                    Ok(Err(broadcast::error::RecvError::Closed)) => return,
                    Err(_) => break,
                }
            }

            if !self.generation_current(generation) {
                return;
            }
            match self.flush(user).await {
                Ok(_) => self.set_status(SyncState::Synced),
                Err(error) => {
                    tracing::warn!(collection = D::COLLECTION, %error, "push cycle failed; will retry");
                    self.set_failure_status(&error);
                }
            }
        }
    }

    /// Turn live ledger claims and tombstones into queue entries, then
    /// drain the queue to the remote
    async fn flush(&self, user: UserId) -> SyncResult<usize> {
        self.set_status(SyncState::Syncing);

        let kind_prefix = format!("{}/", D::Entity::KIND);
        let claims = lock(&self.ledger).entries_with_prefix(user, &kind_prefix);
        // Newest claim per entity; the snapshot carries every pending field,
        // so confirming it clears them all.
        let newest = newest_claim_stamps(claims, &kind_prefix);
        for (entity_id, stamped_at) in newest {
            // Claims for an entity deleted since stamping are handled by
            // the tombstone path below.
            let Some(entity) = self.store.get(&entity_id) else {
                continue;
            };
            let row = entity_to_row(&entity)?;
            self.queue.enqueue(
                D::Entity::KIND,
                QueueOp::Upsert,
                &entity_id,
                &serde_json::Value::Object(row),
                stamped_at,
            )?;
        }
        if D::Entity::TOMBSTONED {
            for tombstone in self.db.list_tombstones(D::Entity::KIND, user)? {
                self.queue.enqueue(
                    D::Entity::KIND,
                    QueueOp::Delete,
                    &tombstone.id,
                    &serde_json::json!({ "id": tombstone.id }),
                    tombstone.deleted_at,
                )?;
            }
        }

        self.queue.drain(|entry| self.push_entry(user, entry)).await
    }

    /// Send one queue entry to the remote; confirmation clears the claims
    /// (or tombstone) it carried
    async fn push_entry(&self, user: UserId, entry: QueueRow) -> SyncResult<()> {
        match entry.op {
            QueueOp::Upsert => {
                let serde_json::Value::Object(row) = entry.snapshot else {
                    tracing::warn!(seq = entry.seq, "dropping queue entry with non-object snapshot");
                    return Ok(());
                };
                self.remote.upsert(D::COLLECTION, vec![row], "id").await?;
                self.clear_entity_claims(user, &entry.entity_id, entry.stamped_at)?;
            }
            QueueOp::Delete => {
                self.remote
                    .delete(
                        D::COLLECTION,
                        &RemoteFilter::owner(user.as_str()).with_id(&entry.entity_id),
                    )
                    .await?;
                self.db.clear_tombstone(D::Entity::KIND, &entry.entity_id)?;
            }
        }
        Ok(())
    }

    /// Clear an entity's ledger claims stamped at or before `up_to`.
    ///
    /// A claim stamped after the pushed snapshot means the user touched the
    /// entity again mid-push; that claim must survive for the next cycle.
    fn clear_entity_claims(&self, user: UserId, entity_id: &str, up_to: i64) -> SyncResult<()> {
        let prefix = format!("{}/{entity_id}", D::Entity::KIND);
        let mut ledger = lock(&self.ledger);
        for (field, stamped_at) in ledger.entries_with_prefix(user, &prefix) {
            if stamped_at <= up_to {
                ledger.clear(user, &field);
                self.db.clear_ledger(user, &field)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(500));

        let tuned = config.with_debounce(Duration::from_millis(20));
        assert_eq!(tuned.debounce, Duration::from_millis(20));
    }

    #[test]
    fn test_newest_claim_stamp_per_entity() {
        let claims = vec![
            ("task/a".to_string(), 10),
            ("task/a/day/2026-08-28".to_string(), 30),
            ("task/b".to_string(), 5),
        ];

        let newest = newest_claim_stamps(claims, "task/");
        assert_eq!(newest.get("a"), Some(&30));
        assert_eq!(newest.get("b"), Some(&5));
    }

    #[test]
    fn test_decode_rows_skips_malformed_identity() {
        use flowtime_core::{Session, UserId};

        let good = crate::remote::entity_to_row(&Session::new(UserId::new(), 0, 60)).unwrap();
        let mut bad = RemoteRow::new();
        bad.insert("id".into(), "not-a-uuid".into());
        bad.insert("owner".into(), UserId::new().as_str().into());
        bad.insert("started_at".into(), 0.into());
        bad.insert("duration_secs".into(), 60.into());
        bad.insert("created_at".into(), 0.into());

        let decoded = decode_rows::<Session>(vec![good, bad]);
        assert_eq!(decoded.len(), 1);
    }
}
