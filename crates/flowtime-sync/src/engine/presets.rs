//! Preset sync: whole-entity timestamp merge with an independently tracked
//! `name` field
//!
//! A rename stamps only `preset/{id}/name`, so the merged row can pair a
//! newer remote body with a newer local name. Existing data depends on this
//! recombination; do not extend the pattern to further fields.

use std::collections::{HashMap, HashSet};

use flowtime_core::db::Tombstone;
use flowtime_core::ledger::keys;
use flowtime_core::{Preset, Syncable, TimestampLedger, UserId};

use super::{EngineDriver, MergeOutcome, SyncEngine};
use crate::remote::RemoteFilter;

/// Driver syncing the `presets` collection
pub enum PresetDriver {}

/// Engine over the preset store
pub type PresetEngine = SyncEngine<PresetDriver>;

impl EngineDriver for PresetDriver {
    type Entity = Preset;
    const COLLECTION: &'static str = "presets";

    fn pull_filter(owner: UserId) -> RemoteFilter {
        RemoteFilter::owner(owner.as_str()).with_order("sort_order.asc")
    }

    fn merge(
        local: Vec<Preset>,
        remote: Vec<(Preset, Option<i64>)>,
        ledger: &TimestampLedger,
        tombstones: &[Tombstone],
        ns: UserId,
    ) -> MergeOutcome<Preset> {
        merge_presets(local, remote, ledger, tombstones, ns)
    }
}

/// Reconcile the local preset list with a pulled remote snapshot
pub fn merge_presets(
    local: Vec<Preset>,
    remote: Vec<(Preset, Option<i64>)>,
    ledger: &TimestampLedger,
    tombstones: &[Tombstone],
    ns: UserId,
) -> MergeOutcome<Preset> {
    let dead: HashSet<&str> = tombstones.iter().map(|t| t.id.as_str()).collect();
    let mut local_by_id: HashMap<String, Preset> =
        local.into_iter().map(|p| (p.id_str(), p)).collect();
    let mut outcome = MergeOutcome::default();

    for (remote_preset, remote_ts) in remote {
        let id = remote_preset.id_str();
        if dead.contains(id.as_str()) {
            outcome.delete_remote.push(id);
            continue;
        }
        let Some(local_preset) = local_by_id.remove(&id) else {
            outcome.merged.push(remote_preset);
            continue;
        };

        let key = remote_preset.field_key();
        let local_wins = ledger.is_local_newer(ns, &key, remote_ts);
        let mut merged = if local_wins {
            local_preset.clone()
        } else {
            if ledger.get(ns, &key).is_some() {
                outcome.clear_keys.push(key);
            }
            remote_preset.clone()
        };

        // The name resolves on its own key when a rename claim exists;
        // otherwise it rides with whichever body won above.
        let name_key = keys::preset_name(&id);
        if ledger.get(ns, &name_key).is_some() {
            if ledger.is_local_newer(ns, &name_key, remote_ts) {
                merged.name = local_preset.name.clone();
            } else {
                merged.name = remote_preset.name.clone();
                outcome.clear_keys.push(name_key);
            }
        }

        if local_wins || merged.name != remote_preset.name {
            outcome.push.push(merged.clone());
        }
        outcome.merged.push(merged);
    }

    for (_, preset) in local_by_id {
        outcome.push.push(preset.clone());
        outcome.merged.push(preset);
    }

    outcome
        .merged
        .sort_by(|a, b| a.sort_order.cmp(&b.sort_order));
    outcome
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_stamped_rename_beats_older_remote_row() {
        let ns = UserId::new();
        let mut local = Preset::new(ns, "Deep Work", 1500);
        local.updated_at = 100;
        let mut remote = local.clone();
        remote.name = "Old Name".into();
        remote.updated_at = 50;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::preset_name(&local.id_str()), 100);

        let outcome = merge_presets(
            vec![local.clone()],
            vec![(remote, Some(50))],
            &ledger,
            &[],
            ns,
        );

        assert_eq!(outcome.merged[0].name, "Deep Work");
        // The rename claim is not cleared by the merge; it survives until
        // the push that carries it is confirmed.
        assert!(outcome.clear_keys.is_empty());
        assert_eq!(outcome.push.len(), 1);
    }

    #[test]
    fn test_hybrid_pairs_remote_body_with_local_name() {
        let ns = UserId::new();
        let mut local = Preset::new(ns, "Focus", 1500);
        local.updated_at = 40;
        let mut remote = local.clone();
        remote.name = "Old Focus".into();
        remote.duration_secs = 3000;
        remote.updated_at = 80;

        let mut ledger = TimestampLedger::new();
        // Body claim is stale; rename postdates the remote row.
        ledger.stamp(ns, &local.field_key(), 40);
        ledger.stamp(ns, &keys::preset_name(&local.id_str()), 120);

        let outcome = merge_presets(
            vec![local.clone()],
            vec![(remote, Some(80))],
            &ledger,
            &[],
            ns,
        );

        let merged = &outcome.merged[0];
        assert_eq!(merged.duration_secs, 3000);
        assert_eq!(merged.name, "Focus");
        assert_eq!(outcome.clear_keys, vec![local.field_key()]);
        assert_eq!(outcome.push, vec![merged.clone()]);
    }

    #[test]
    fn test_remote_rename_clears_stale_name_claim() {
        let ns = UserId::new();
        let mut local = Preset::new(ns, "Short Break", 300);
        local.updated_at = 10;
        let mut remote = local.clone();
        remote.name = "Break".into();
        remote.updated_at = 500;

        let mut ledger = TimestampLedger::new();
        ledger.stamp(ns, &keys::preset_name(&local.id_str()), 10);

        let outcome = merge_presets(
            vec![local.clone()],
            vec![(remote, Some(500))],
            &ledger,
            &[],
            ns,
        );

        assert_eq!(outcome.merged[0].name, "Break");
        assert_eq!(outcome.clear_keys, vec![keys::preset_name(&local.id_str())]);
        assert!(outcome.push.is_empty());
    }

    #[test]
    fn test_tombstoned_preset_is_deleted_remotely() {
        let ns = UserId::new();
        let remote = Preset::new(ns, "Gone", 600);
        let id = remote.id_str();
        let tombstones = [Tombstone {
            id: id.clone(),
            deleted_at: 100,
        }];

        let outcome = merge_presets(
            vec![],
            vec![(remote, Some(1))],
            &TimestampLedger::new(),
            &tombstones,
            ns,
        );

        assert!(outcome.merged.is_empty());
        assert_eq!(outcome.delete_remote, vec![id]);
    }

    #[test]
    fn test_merged_list_sorted_by_sort_order() {
        let ns = UserId::new();
        let mut second = Preset::new(ns, "Second", 600);
        second.sort_order = 2;
        let mut first = Preset::new(ns, "First", 300);
        first.sort_order = 1;

        let outcome = merge_presets(
            vec![second],
            vec![(first, Some(1))],
            &TimestampLedger::new(),
            &[],
            ns,
        );

        assert_eq!(outcome.merged[0].name, "First");
        assert_eq!(outcome.merged[1].name, "Second");
    }
}
