//! UI-facing local stores
//!
//! Every user-facing mutation goes through exactly one entry point per
//! entity type, which writes the entity and its ledger stamps in a single
//! SQLite transaction and then broadcasts a change event. Events are tagged
//! with their origin so sync engines can ignore their own write-backs
//! instead of echoing them as new pushes.

mod settings_store;

pub use settings_store::SettingsStore;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ledger::{keys, TimestampLedger};
use crate::models::{Preset, Syncable, Task, UserId};
use crate::now_ms;

/// Where a store change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user-facing mutation on this device
    Local,
    /// A sync engine applying a merge result
    Sync,
}

/// Broadcast whenever a store's contents change
#[derive(Debug, Clone, Copy)]
pub struct StoreEvent {
    /// Origin of the change; sync engines ignore `Sync`-origin events
    pub origin: ChangeOrigin,
}

const EVENT_CAPACITY: usize = 64;

pub(crate) fn lock_ledger(
    ledger: &Mutex<TimestampLedger>,
) -> MutexGuard<'_, TimestampLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// On-device canonical collection of one entity type for one user
pub struct LocalStore<E: Syncable> {
    owner: UserId,
    db: Arc<Database>,
    ledger: Arc<Mutex<TimestampLedger>>,
    items: RwLock<Vec<E>>,
    events: broadcast::Sender<StoreEvent>,
}

impl<E: Syncable> LocalStore<E> {
    /// Open the store, loading the persisted collection for `owner`
    pub fn open(
        db: Arc<Database>,
        ledger: Arc<Mutex<TimestampLedger>>,
        owner: UserId,
    ) -> Result<Self> {
        let items = db.load_entities(owner)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            owner,
            db,
            ledger,
            items: RwLock::new(items),
            events,
        })
    }

    /// Owning user this store is scoped to
    #[must_use]
    pub const fn owner(&self) -> UserId {
        self.owner
    }

    /// Snapshot of the current collection
    #[must_use]
    pub fn current_state(&self) -> Vec<E> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up a single entity by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<E> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.id_str() == id)
            .cloned()
    }

    /// Insert or update an entity, stamping its whole-entity ledger key
    pub fn upsert(&self, entity: E) -> Result<()> {
        let stamps = vec![(entity.field_key(), entity.updated_at())];
        self.write(entity, stamps)
    }

    /// Remove an entity, recording a tombstone for tombstoned kinds
    pub fn delete(&self, id: &str) -> Result<()> {
        let now = now_ms();
        self.db
            .delete_entity(E::KIND, id, self.owner, E::TOMBSTONED.then_some(now))?;

        {
            let mut ledger = lock_ledger(&self.ledger);
            let prefix = format!("{}/{id}", E::KIND);
            for (field, _) in ledger.entries_with_prefix(self.owner, &prefix) {
                ledger.clear(self.owner, &field);
            }
        }

        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.retain(|e| e.id_str() != id);
        drop(items);

        self.emit(ChangeOrigin::Local);
        Ok(())
    }

    /// Subscribe to change events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Replace the whole collection with a merge result.
    ///
    /// Sync-engine use only. Emits a `Sync`-origin event so the engine's own
    /// observer does not re-enqueue the write-back; the engine must never
    /// use the per-item mutation methods for this.
    pub fn apply_merged_state(&self, merged: Vec<E>) -> Result<()> {
        self.db.replace_entities(self.owner, &merged)?;
        *self.items.write().unwrap_or_else(PoisonError::into_inner) = merged;
        self.emit(ChangeOrigin::Sync);
        Ok(())
    }

    /// Shared write path: persist entity + stamps, mirror the ledger, update
    /// the in-memory collection, emit a local event
    fn write(&self, entity: E, stamps: Vec<(String, i64)>) -> Result<()> {
        if entity.owner() != self.owner {
            return Err(Error::InvalidInput(format!(
                "entity owner does not match store owner ({})",
                self.owner
            )));
        }
        self.db.upsert_entity(&entity, &stamps)?;

        {
            let mut ledger = lock_ledger(&self.ledger);
            for (field, at) in &stamps {
                ledger.stamp(self.owner, field, *at);
            }
        }

        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.retain(|e| e.id_str() != entity.id_str());
        items.insert(0, entity);
        drop(items);

        self.emit(ChangeOrigin::Local);
        Ok(())
    }

    fn emit(&self, origin: ChangeOrigin) {
        // No receivers just means no engine is running.
        let _ = self.events.send(StoreEvent { origin });
    }
}

impl LocalStore<Task> {
    /// Mark or unmark a task as completed on the given day.
    ///
    /// Stamps the per-day key as well as the whole-entity key; the per-day
    /// stamp is what lets a merge tell a local removal apart from a day the
    /// remote added.
    pub fn set_day_completed(&self, id: &str, day: &str, done: bool) -> Result<()> {
        let mut task = self
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !task.set_completed_on(day, done) {
            return Ok(());
        }
        let at = task.updated_at;
        let stamps = vec![
            (task.field_key(), at),
            (keys::task_day(id, day), at),
        ];
        self.write(task, stamps)
    }
}

impl LocalStore<Preset> {
    /// Rename a preset, stamping only the name's field key.
    ///
    /// Name is merged at field granularity, so a rename must not claim the
    /// whole preset as locally newer.
    pub fn rename(&self, id: &str, name: impl Into<String>) -> Result<()> {
        let mut preset = self
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        preset.name = name.into();
        preset.touch();
        let stamps = vec![(keys::preset_name(id), preset.updated_at)];
        self.write(preset, stamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<Database>, Arc<Mutex<TimestampLedger>>, UserId) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ledger = Arc::new(Mutex::new(TimestampLedger::new()));
        (db, ledger, UserId::new())
    }

    #[test]
    fn test_upsert_stamps_and_emits_local_event() {
        let (db, ledger, owner) = setup();
        let store = LocalStore::<Task>::open(db, Arc::clone(&ledger), owner).unwrap();
        let mut rx = store.subscribe();

        let task = Task::new(owner, "Buy milk", 1500);
        store.upsert(task.clone()).unwrap();

        assert_eq!(store.current_state(), vec![task.clone()]);
        assert_eq!(
            lock_ledger(&ledger).get(owner, &task.field_key()),
            Some(task.updated_at)
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, ChangeOrigin::Local);
    }

    #[test]
    fn test_upsert_rejects_wrong_owner() {
        let (db, ledger, owner) = setup();
        let store = LocalStore::<Task>::open(db, ledger, owner).unwrap();
        let stranger = Task::new(UserId::new(), "Not yours", 60);
        assert!(store.upsert(stranger).is_err());
    }

    #[test]
    fn test_delete_records_tombstone_and_clears_stamps() {
        let (db, ledger, owner) = setup();
        let store =
            LocalStore::<Preset>::open(Arc::clone(&db), Arc::clone(&ledger), owner).unwrap();

        let preset = Preset::new(owner, "Deep Work", 5400);
        let id = preset.id_str();
        store.upsert(preset).unwrap();
        store.delete(&id).unwrap();

        assert!(store.current_state().is_empty());
        assert!(lock_ledger(&ledger)
            .entries_with_prefix(owner, "preset/")
            .is_empty());
        let tombstones = db.list_tombstones(Preset::KIND, owner).unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, id);
    }

    #[test]
    fn test_delete_session_leaves_no_tombstone() {
        let (db, ledger, owner) = setup();
        let store =
            LocalStore::<Session>::open(Arc::clone(&db), ledger, owner).unwrap();

        let session = Session::new(owner, 0, 1500);
        let id = session.id_str();
        store.upsert(session).unwrap();
        store.delete(&id).unwrap();

        assert!(db.list_tombstones(Session::KIND, owner).unwrap().is_empty());
    }

    #[test]
    fn test_apply_merged_state_emits_sync_origin() {
        let (db, ledger, owner) = setup();
        let store = LocalStore::<Task>::open(db, ledger, owner).unwrap();
        let mut rx = store.subscribe();

        store
            .apply_merged_state(vec![Task::new(owner, "From remote", 600)])
            .unwrap();

        assert_eq!(store.current_state().len(), 1);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, ChangeOrigin::Sync);
    }

    #[test]
    fn test_set_day_completed_stamps_day_key() {
        let (db, ledger, owner) = setup();
        let store = LocalStore::<Task>::open(db, Arc::clone(&ledger), owner).unwrap();

        let task = Task::new(owner, "Stretch", 300);
        let id = task.id_str();
        store.upsert(task).unwrap();
        store.set_day_completed(&id, "2026-08-30", true).unwrap();

        let day_key = keys::task_day(&id, "2026-08-30");
        assert!(lock_ledger(&ledger).get(owner, &day_key).is_some());
        assert!(store.get(&id).unwrap().is_completed_on("2026-08-30"));
    }

    #[test]
    fn test_rename_stamps_only_name_key() {
        let (db, ledger, owner) = setup();
        let store = LocalStore::<Preset>::open(db, Arc::clone(&ledger), owner).unwrap();

        let preset = Preset::new(owner, "Old Name", 1500);
        let id = preset.id_str();
        store.upsert(preset).unwrap();

        // Clear the creation stamp so only the rename's stamp remains.
        lock_ledger(&ledger).clear(owner, &format!("preset/{id}"));

        store.rename(&id, "Deep Work").unwrap();

        let ledger = lock_ledger(&ledger);
        assert!(ledger.get(owner, &keys::preset_name(&id)).is_some());
        assert!(ledger.get(owner, &format!("preset/{id}")).is_none());
        drop(ledger);
        assert_eq!(store.get(&id).unwrap().name, "Deep Work");
    }

    #[test]
    fn test_store_reload_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let owner = UserId::new();
        let task = Task::new(owner, "Persisted", 900);

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let ledger = Arc::new(Mutex::new(TimestampLedger::new()));
            let store = LocalStore::<Task>::open(db, ledger, owner).unwrap();
            store.upsert(task.clone()).unwrap();
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let ledger = Arc::new(Mutex::new(TimestampLedger::from_rows(
            db.load_ledger().unwrap(),
        )));
        let store = LocalStore::<Task>::open(db, Arc::clone(&ledger), owner).unwrap();
        assert_eq!(store.current_state(), vec![task.clone()]);
        assert!(lock_ledger(&ledger).get(owner, &task.field_key()).is_some());
    }
}
