//! Local timestamp ledger
//!
//! A pure, per-user map from field key to the last local mutation time. The
//! sync engines consult it to decide whether a local value should survive a
//! remote pull; a successful push clears the entry, making the next pull
//! authoritative for that field. Persistence is handled by [`crate::db`];
//! the ledger itself does no I/O.

use std::collections::HashMap;

use crate::models::UserId;

/// Canonical ledger field-key builders.
///
/// Whole-entity keys are `kind/id`; sub-entity granularity appends a path
/// segment. Keeping the format in one place keeps the stores and the merge
/// strategies agreeing on what a field is called.
pub mod keys {
    /// Per-day completion occurrence on a task
    #[must_use]
    pub fn task_day(task_id: &str, day: &str) -> String {
        format!("task/{task_id}/day/{day}")
    }

    /// A preset's name, tracked separately from the rest of the preset
    #[must_use]
    pub fn preset_name(preset_id: &str) -> String {
        format!("preset/{preset_id}/name")
    }

    /// A scalar settings field (or `goal_history/{day}` suffix)
    #[must_use]
    pub fn settings(field: &str) -> String {
        format!("settings/{field}")
    }
}

/// Namespaced map from field key to last-local-mutation time (unix ms).
///
/// Namespacing by owning user keeps timestamps from leaking across account
/// switches on the same device.
#[derive(Debug, Clone, Default)]
pub struct TimestampLedger {
    entries: HashMap<(UserId, String), i64>,
}

impl TimestampLedger {
    /// Empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted `(namespace, field, stamped_at)` rows
    #[must_use]
    pub fn from_rows(rows: impl IntoIterator<Item = (UserId, String, i64)>) -> Self {
        Self {
            entries: rows
                .into_iter()
                .map(|(ns, field, at)| ((ns, field), at))
                .collect(),
        }
    }

    /// Record a local mutation of `field` at `at`
    pub fn stamp(&mut self, ns: UserId, field: &str, at: i64) {
        self.entries.insert((ns, field.to_string()), at);
    }

    /// Last local mutation time for `field`, if still unconfirmed
    #[must_use]
    pub fn get(&self, ns: UserId, field: &str) -> Option<i64> {
        self.entries.get(&(ns, field.to_string())).copied()
    }

    /// Drop the entry for `field` (after a confirmed push, or when adopting
    /// the remote value)
    pub fn clear(&mut self, ns: UserId, field: &str) {
        self.entries.remove(&(ns, field.to_string()));
    }

    /// True if a local stamp exists and is strictly newer than the remote
    /// timestamp, or if the remote has no timestamp at all.
    #[must_use]
    pub fn is_local_newer(&self, ns: UserId, field: &str, remote: Option<i64>) -> bool {
        match (self.get(ns, field), remote) {
            (Some(_), None) => true,
            (Some(local), Some(remote)) => local > remote,
            (None, _) => false,
        }
    }

    /// All live entries for a namespace whose field key starts with `prefix`
    #[must_use]
    pub fn entries_with_prefix(&self, ns: UserId, prefix: &str) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .entries
            .iter()
            .filter(|((entry_ns, field), _)| *entry_ns == ns && field.starts_with(prefix))
            .map(|((_, field), at)| (field.clone(), *at))
            .collect();
        entries.sort();
        entries
    }
}
