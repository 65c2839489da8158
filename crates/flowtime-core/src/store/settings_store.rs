//! Singleton settings store

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;

use super::{lock_ledger, ChangeOrigin, StoreEvent, EVENT_CAPACITY};
use crate::db::Database;
use crate::error::Result;
use crate::ledger::{keys, TimestampLedger};
use crate::models::{SettingsPatch, UserId, UserSettings};

/// Per-user singleton settings, merged at field granularity.
///
/// The store shape differs from [`super::LocalStore`] (one row, patched by
/// field) but the contract is the same: every mutation stamps the ledger in
/// the same transaction, and merge write-backs are `Sync`-origin events.
pub struct SettingsStore {
    owner: UserId,
    db: Arc<Database>,
    ledger: Arc<Mutex<TimestampLedger>>,
    current: RwLock<UserSettings>,
    events: broadcast::Sender<StoreEvent>,
}

impl SettingsStore {
    /// Open the store, loading persisted settings or defaults for `owner`
    pub fn open(
        db: Arc<Database>,
        ledger: Arc<Mutex<TimestampLedger>>,
        owner: UserId,
    ) -> Result<Self> {
        let current = db
            .load_entities::<UserSettings>(owner)?
            .into_iter()
            .next()
            .unwrap_or_else(|| UserSettings::new(owner));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            owner,
            db,
            ledger,
            current: RwLock::new(current),
            events,
        })
    }

    /// Owning user this store is scoped to
    #[must_use]
    pub const fn owner(&self) -> UserId {
        self.owner
    }

    /// Snapshot of the current settings
    #[must_use]
    pub fn current(&self) -> UserSettings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a partial update, stamping exactly the fields it changes
    pub fn apply(&self, patch: &SettingsPatch) -> Result<()> {
        let mut settings = self.current();
        let changed = settings.apply_patch(patch);
        if changed.is_empty() {
            return Ok(());
        }

        let at = settings.updated_at;
        let stamps: Vec<(String, i64)> = changed
            .iter()
            .map(|suffix| (keys::settings(suffix), at))
            .collect();
        self.db.upsert_entity(&settings, &stamps)?;

        {
            let mut ledger = lock_ledger(&self.ledger);
            for (field, at) in &stamps {
                ledger.stamp(self.owner, field, *at);
            }
        }

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = settings;
        let _ = self.events.send(StoreEvent {
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    /// Subscribe to change events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Replace settings with a merge result. Sync-engine use only.
    pub fn apply_merged(&self, merged: UserSettings) -> Result<()> {
        self.db.replace_entities(self.owner, &[merged.clone()])?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = merged;
        let _ = self.events.send(StoreEvent {
            origin: ChangeOrigin::Sync,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThemeMode;
    use pretty_assertions::assert_eq;

    fn setup() -> SettingsStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ledger = Arc::new(Mutex::new(TimestampLedger::new()));
        SettingsStore::open(db, ledger, UserId::new()).unwrap()
    }

    #[test]
    fn test_apply_stamps_changed_fields() {
        let store = setup();
        let owner = store.owner();
        let mut rx = store.subscribe();

        store
            .apply(&SettingsPatch {
                theme: Some(ThemeMode::Dark),
                display_name: Some("Mio".to_string()),
                ..SettingsPatch::default()
            })
            .unwrap();

        assert_eq!(store.current().theme, ThemeMode::Dark);
        let ledger = lock_ledger(&store.ledger);
        assert!(ledger.get(owner, "settings/theme").is_some());
        assert!(ledger.get(owner, "settings/display_name").is_some());
        assert!(ledger.get(owner, "settings/clock_24h").is_none());
        drop(ledger);
        assert_eq!(rx.try_recv().unwrap().origin, ChangeOrigin::Local);
    }

    #[test]
    fn test_noop_patch_emits_nothing() {
        let store = setup();
        let mut rx = store.subscribe();
        store.apply(&SettingsPatch::default()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_merged_is_sync_origin() {
        let store = setup();
        let mut rx = store.subscribe();

        let mut merged = store.current();
        merged.display_name = "From remote".to_string();
        store.apply_merged(merged).unwrap();

        assert_eq!(store.current().display_name, "From remote");
        assert_eq!(rx.try_recv().unwrap().origin, ChangeOrigin::Sync);
    }

    #[test]
    fn test_settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");
        let owner = UserId::new();

        {
            let db = Arc::new(Database::open(&path).unwrap());
            let ledger = Arc::new(Mutex::new(TimestampLedger::new()));
            let store = SettingsStore::open(db, ledger, owner).unwrap();
            store
                .apply(&SettingsPatch {
                    daily_goal_minutes: Some(240),
                    ..SettingsPatch::default()
                })
                .unwrap();
        }

        let db = Arc::new(Database::open(&path).unwrap());
        let ledger = Arc::new(Mutex::new(TimestampLedger::new()));
        let store = SettingsStore::open(db, ledger, owner).unwrap();
        assert_eq!(store.current().daily_goal_minutes, 240);
    }
}
