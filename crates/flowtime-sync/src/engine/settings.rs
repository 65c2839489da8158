//! Settings sync: field-level LWW over a per-user singleton
//!
//! Every scalar field carries its own `settings/{field}` ledger key and
//! wins or loses independently; the goal-history map merges by per-day
//! union. A field the remote row does not carry (or carries as an empty
//! object) never resets the local value.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use flowtime_core::db::{Database, QueueOp, QueueRow};
use flowtime_core::ledger::keys;
use flowtime_core::store::{ChangeOrigin, SettingsStore, StoreEvent};
use flowtime_core::{Syncable, TimestampLedger, UserId, UserSettings};

use super::{lock, EngineConfig, EngineState, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::queue::SyncQueue;
use crate::remote::{entity_to_row, remote_timestamp, RemoteCollection, RemoteFilter, RemoteRow};

const COLLECTION: &str = "settings";

/// Result of a settings merge
#[derive(Debug, Clone)]
pub struct SettingsMergeOutcome {
    /// New canonical local settings
    pub merged: UserSettings,
    /// Whether a push is owed (some local claim survived, or the row has
    /// never been synced)
    pub push: bool,
    /// Ledger keys whose local claim lost and can be dropped immediately
    pub clear_keys: Vec<String>,
}

/// Reconcile local settings with the pulled remote row, if any.
///
/// Fields are read straight off the raw row so that an absent field is
/// distinguishable from an explicit default after decoding.
pub fn merge_settings(
    local: UserSettings,
    remote_row: Option<&RemoteRow>,
    ledger: &TimestampLedger,
    ns: UserId,
) -> SettingsMergeOutcome {
    let Some(row) = remote_row else {
        // Nothing remote yet: the whole local row is authoritative.
        return SettingsMergeOutcome {
            merged: local,
            push: true,
            clear_keys: Vec::new(),
        };
    };
    let remote_ts = remote_timestamp(row);
    let mut merged = local.clone();
    let mut clear_keys = Vec::new();
    let mut kept_local = false;

    for field in UserSettings::FIELDS {
        let key = keys::settings(field);
        let has_claim = ledger.get(ns, &key).is_some();
        let Some(remote_value) = row.get(field) else {
            kept_local |= has_claim;
            continue;
        };
        // Absence is not a reset: `{}` / null notification prefs keep the
        // local value.
        if field == "notification_prefs" && is_effectively_absent(remote_value) {
            kept_local |= has_claim;
            continue;
        }
        if has_claim && ledger.is_local_newer(ns, &key, remote_ts) {
            kept_local = true;
            continue;
        }
        match merged.set_field(field, remote_value.clone()) {
            Ok(()) => {
                if has_claim {
                    clear_keys.push(key);
                }
            }
            Err(error) => {
                tracing::warn!(field, %error, "undecodable remote settings field; keeping local value");
                kept_local |= has_claim;
            }
        }
    }

    merged.goal_history = merge_goal_history(
        &local.goal_history,
        row,
        remote_ts,
        ledger,
        ns,
        &mut kept_local,
        &mut clear_keys,
    );
    if let Some(remote_at) = remote_ts {
        merged.updated_at = merged.updated_at.max(remote_at);
    }

    SettingsMergeOutcome {
        merged,
        push: kept_local,
        clear_keys,
    }
}

fn is_effectively_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Per-day union of the focused-minutes map; a day disappears only via a
/// removal this device stamped more recently than the remote row
fn merge_goal_history(
    local: &BTreeMap<String, u32>,
    row: &RemoteRow,
    remote_ts: Option<i64>,
    ledger: &TimestampLedger,
    ns: UserId,
    kept_local: &mut bool,
    clear_keys: &mut Vec<String>,
) -> BTreeMap<String, u32> {
    let remote: BTreeMap<String, u32> = row
        .get("goal_history")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let days: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut merged = BTreeMap::new();
    for day in days {
        let key = keys::settings(&format!("goal_history/{day}"));
        let has_claim = ledger.get(ns, &key).is_some();
        match (local.get(day), remote.get(day)) {
            (Some(minutes), None) => {
                if has_claim || remote_ts.is_none() {
                    merged.insert(day.clone(), *minutes);
                    *kept_local |= has_claim;
                }
                // No claim on a day the newer remote row lacks: it was
                // removed on another device.
            }
            (None, Some(minutes)) => {
                if has_claim && ledger.is_local_newer(ns, &key, remote_ts) {
                    // Our removal is pending push.
                    *kept_local = true;
                } else {
                    merged.insert(day.clone(), *minutes);
                    if has_claim {
                        clear_keys.push(key);
                    }
                }
            }
            (Some(local_minutes), Some(remote_minutes)) => {
                if has_claim && ledger.is_local_newer(ns, &key, remote_ts) {
                    merged.insert(day.clone(), *local_minutes);
                    *kept_local = true;
                } else {
                    merged.insert(day.clone(), *remote_minutes);
                    if has_claim {
                        clear_keys.push(key);
                    }
                }
            }
            (None, None) => {}
        }
    }
    merged
}

struct Lifecycle {
    state: EngineState,
    generation: u64,
    observer: Option<JoinHandle<()>>,
}

/// Sync engine for the settings singleton; cheap to clone, all clones
/// share one lifecycle.
///
/// Same lifecycle as the list engines, but there is exactly one row per
/// user and pushes always carry the full current row.
#[derive(Clone)]
pub struct SettingsEngine {
    core: Arc<Core>,
}

struct Core {
    store: Arc<SettingsStore>,
    remote: Arc<dyn RemoteCollection>,
    queue: SyncQueue,
    ledger: Arc<Mutex<TimestampLedger>>,
    db: Arc<Database>,
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
    status: Mutex<SyncState>,
}

impl SettingsEngine {
    /// Build an engine over explicitly injected services
    #[must_use]
    pub fn new(
        store: Arc<SettingsStore>,
        remote: Arc<dyn RemoteCollection>,
        ledger: Arc<Mutex<TimestampLedger>>,
        db: Arc<Database>,
        config: EngineConfig,
    ) -> Self {
        let queue = SyncQueue::scoped(Arc::clone(&db), store.owner(), UserSettings::KIND);
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

    /// Pull the row, merge per field, apply, push if owed, then observe
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

        let filter = RemoteFilter::owner(user.as_str());
        let rows = match core.remote.select(COLLECTION, &filter).await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(collection = COLLECTION, %error, "pull failed; engine left stopped");
                lock(&core.lifecycle).state = EngineState::Stopped;
                core.set_failure_status(&error);
                return Err(error);
            }
        };
        if !core.generation_current(generation) {
            return Err(SyncError::NotRunning);
        }

        let row = rows.into_iter().next();
        let (outcome, claim_cutoff) = {
            let ledger = lock(&core.ledger);
            let outcome = merge_settings(core.store.current(), row.as_ref(), &ledger, user);
            // The claims the merge saw are the ones the post-merge push
            // confirms; anything stamped later belongs to a newer mutation.
            let cutoff = ledger
                .entries_with_prefix(user, "settings/")
                .into_iter()
                .map(|(_, stamped_at)| stamped_at)
                .max();
            (outcome, cutoff)
        };

        lock(&core.lifecycle).state = EngineState::Applying;
        if let Err(error) = core.apply_outcome(user, &outcome) {
            lock(&core.lifecycle).state = EngineState::Stopped;
            core.set_status(SyncState::Error);
            return Err(error);
        }

        if outcome.push {
            match core.push_current(user, claim_cutoff).await {
                Ok(()) => core.set_status(SyncState::Synced),
                Err(error) => {
                    tracing::warn!(collection = COLLECTION, %error, "initial push failed; left pending");
                    core.set_failure_status(&error);
                }
            }
        } else {
            core.set_status(SyncState::Synced);
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

    /// Cancel observation; the ledger and queue survive for the next start
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.core.lifecycle);
        if let Some(handle) = lifecycle.observer.take() {
            handle.abort();
        }
        lifecycle.state = EngineState::Stopped;
        lifecycle.generation += 1;
        drop(lifecycle);
        self.core.set_status(SyncState::Offline);
    }

    /// Skip the debounce window and push any pending claims right now
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

impl Core {
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

    fn generation_current(&self, generation: u64) -> bool {
        let lifecycle = lock(&self.lifecycle);
        lifecycle.generation == generation && lifecycle.state != EngineState::Stopped
    }

    fn apply_outcome(&self, user: UserId, outcome: &SettingsMergeOutcome) -> SyncResult<()> {
        self.store.apply_merged(outcome.merged.clone())?;
        let mut ledger = lock(&self.ledger);
        for field in &outcome.clear_keys {
            ledger.clear(user, field);
            self.db.clear_ledger(user, field)?;
        }
        let pruned = self.queue.prune_stale(&ledger)?;
        if pruned > 0 {
            tracing::debug!(collection = COLLECTION, pruned, "pruned stale queue entries");
        }
        Ok(())
    }

    /// Push the full current row and clear the claims it carried
    async fn push_current(&self, user: UserId, up_to: Option<i64>) -> SyncResult<()> {
        let row = entity_to_row(&self.store.current())?;
        self.remote.upsert(COLLECTION, vec![row], "owner").await?;
        // Claims stamped after the cutoff carry a mutation this row
        // predates; they survive for the next cycle.
        if let Some(up_to) = up_to {
            self.clear_claims_up_to(user, up_to)?;
        }
        Ok(())
    }

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
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }

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
                    tracing::warn!(collection = COLLECTION, %error, "push cycle failed; will retry");
                    self.set_failure_status(&error);
                }
            }
        }
    }

    /// Turn live claims into one full-row queue entry, then drain
    async fn flush(&self, user: UserId) -> SyncResult<usize> {
        self.set_status(SyncState::Syncing);

        let claims = lock(&self.ledger).entries_with_prefix(user, "settings/");
        if let Some(stamped_at) = claims.iter().map(|(_, at)| *at).max() {
            let row = entity_to_row(&self.store.current())?;
            self.queue.enqueue(
                UserSettings::KIND,
                QueueOp::Upsert,
                &user.as_str(),
                &Value::Object(row),
                stamped_at,
            )?;
        }

        self.queue.drain(|entry| self.push_entry(user, entry)).await
    }

    async fn push_entry(&self, user: UserId, entry: QueueRow) -> SyncResult<()> {
        let Value::Object(row) = entry.snapshot else {
            tracing::warn!(seq = entry.seq, "dropping queue entry with non-object snapshot");
            return Ok(());
        };
        self.remote.upsert(COLLECTION, vec![row], "owner").await?;
        self.clear_claims_up_to(user, entry.stamped_at)?;
        Ok(())
    }

    /// Clear settings claims stamped at or before `up_to`; later claims
    /// belong to changes the pushed row did not carry
    fn clear_claims_up_to(&self, user: UserId, up_to: i64) -> SyncResult<()> {
        let mut ledger = lock(&self.ledger);
        for (field, stamped_at) in ledger.entries_with_prefix(user, "settings/") {
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
    use pretty_assertions::assert_eq;

    use flowtime_core::models::ThemeMode;

    use super::*;

    fn row_for(settings: &UserSettings) -> RemoteRow {
        entity_to_row(settings).unwrap()
    }

    #[test]
    fn test_no_remote_row_pushes_local() {
        let ns = UserId::new();
        let local = UserSettings::new(ns);

        let outcome = merge_settings(local.clone(), None, &TimestampLedger::new(), ns);

        assert_eq!(outcome.merged, local);
        assert!(outcome.push);
    }

    #[test]
    fn test_stamped_field_beats_older_remote_value() {
        let ns = UserId::new();
        let mut local = UserSettings::new(ns);
        local.theme = ThemeMode::Dark;
        local.updated_at = 100;
        let mut remote = local.clone();
        remote.theme = ThemeMode::Light;
        remote.updated_at = 50;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::settings("theme"), 100);

        let outcome = merge_settings(local, Some(&row_for(&remote)), &ledger, ns);

        assert_eq!(outcome.merged.theme, ThemeMode::Dark);
        assert!(outcome.push);
        assert!(outcome.clear_keys.is_empty());
    }

    #[test]
    fn test_newer_remote_field_adopted_and_claim_cleared() {
        let ns = UserId::new();
        let mut local = UserSettings::new(ns);
        local.daily_goal_minutes = 90;
        let mut remote = local.clone();
        remote.daily_goal_minutes = 240;
        remote.updated_at = local.updated_at + 1_000;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::settings("daily_goal_minutes"), remote.updated_at - 2_000);

        let outcome = merge_settings(local, Some(&row_for(&remote)), &ledger, ns);

        assert_eq!(outcome.merged.daily_goal_minutes, 240);
        assert_eq!(outcome.clear_keys, vec![keys::settings("daily_goal_minutes")]);
        assert!(!outcome.push);
    }

    #[test]
    fn test_empty_notification_prefs_is_not_a_reset() {
        let ns = UserId::new();
        let mut local = UserSettings::new(ns);
        local.notification_prefs.session_end = true;
        local.notification_prefs.reminder_time = Some("08:30".into());

        let mut remote = local.clone();
        remote.updated_at = local.updated_at + 1_000;
        let mut row = row_for(&remote);
        row.insert("notification_prefs".into(), serde_json::json!({}));

        let outcome = merge_settings(local.clone(), Some(&row), &TimestampLedger::new(), ns);

        assert_eq!(outcome.merged.notification_prefs, local.notification_prefs);
    }

    #[test]
    fn test_missing_field_keeps_local_value() {
        let ns = UserId::new();
        let mut local = UserSettings::new(ns);
        local.accent_color = "moss".into();
        let mut remote = local.clone();
        remote.updated_at = local.updated_at + 1_000;
        let mut row = row_for(&remote);
        row.remove("accent_color");

        let outcome = merge_settings(local, Some(&row), &TimestampLedger::new(), ns);

        assert_eq!(outcome.merged.accent_color, "moss");
    }

    #[test]
    fn test_goal_history_unions_both_sides() {
        let ns = UserId::new();
        let mut local = UserSettings::new(ns);
        local.goal_history.insert("2026-08-29".into(), 45);
        let mut remote = UserSettings::new(ns);
        remote.goal_history.insert("2026-08-28".into(), 60);
        remote.updated_at = local.updated_at + 1_000;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::settings("goal_history/2026-08-29"), local.updated_at);

        let outcome = merge_settings(local, Some(&row_for(&remote)), &ledger, ns);

        assert_eq!(outcome.merged.goal_history.get("2026-08-28"), Some(&60));
        assert_eq!(outcome.merged.goal_history.get("2026-08-29"), Some(&45));
        assert!(outcome.push);
    }

    #[test]
    fn test_stamped_goal_removal_drops_remote_day() {
        let ns = UserId::new();
        let local = UserSettings::new(ns);
        let mut remote = UserSettings::new(ns);
        remote.goal_history.insert("2026-08-27".into(), 30);
        remote.updated_at = 100;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::settings("goal_history/2026-08-27"), 200);

        let outcome = merge_settings(local, Some(&row_for(&remote)), &ledger, ns);

        assert!(!outcome.merged.goal_history.contains_key("2026-08-27"));
        assert!(outcome.push);
    }

    #[test]
    fn test_goal_day_collision_resolves_per_day() {
        let ns = UserId::new();
        let mut local = UserSettings::new(ns);
        local.goal_history.insert("2026-08-26".into(), 90);
        let mut remote = UserSettings::new(ns);
        remote.goal_history.insert("2026-08-26".into(), 15);
        remote.updated_at = 500;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::settings("goal_history/2026-08-26"), 900);

        let outcome = merge_settings(local, Some(&row_for(&remote)), &ledger, ns);
        assert_eq!(outcome.merged.goal_history.get("2026-08-26"), Some(&90));

        // The same collision with a stale claim adopts the remote value.
        let mut stale = TimestampLedger::new();
        stale.stamp(ns, &keys::settings("goal_history/2026-08-26"), 100);
        let mut local = UserSettings::new(ns);
        local.goal_history.insert("2026-08-26".into(), 90);
        let mut remote = UserSettings::new(ns);
        remote.goal_history.insert("2026-08-26".into(), 15);
        remote.updated_at = 500;

        let outcome = merge_settings(local, Some(&row_for(&remote)), &stale, ns);
        assert_eq!(outcome.merged.goal_history.get("2026-08-26"), Some(&15));
        assert_eq!(
            outcome.clear_keys,
            vec![keys::settings("goal_history/2026-08-26")]
        );
    }
}
