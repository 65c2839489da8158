//! Task sync: whole-entity timestamp merge plus per-day completion union

use std::collections::{BTreeSet, HashMap, HashSet};

use flowtime_core::db::Tombstone;
use flowtime_core::ledger::keys;
use flowtime_core::{Syncable, Task, TimestampLedger, UserId};

use super::{EngineDriver, MergeOutcome, SyncEngine};
use crate::remote::RemoteFilter;

/// Driver syncing the `tasks` collection
pub enum TaskDriver {}

/// Engine over the task store
pub type TaskEngine = SyncEngine<TaskDriver>;

impl EngineDriver for TaskDriver {
    type Entity = Task;
    const COLLECTION: &'static str = "tasks";

    // Archived tasks are pulled too; archiving is a soft delete that must
    // win or lose by timestamp like any other field.
    fn pull_filter(owner: UserId) -> RemoteFilter {
        RemoteFilter::owner(owner.as_str()).with_order("created_at.desc")
    }

    fn merge(
        local: Vec<Task>,
        remote: Vec<(Task, Option<i64>)>,
        ledger: &TimestampLedger,
        tombstones: &[Tombstone],
        ns: UserId,
    ) -> MergeOutcome<Task> {
        merge_tasks(local, remote, ledger, tombstones, ns)
    }
}

/// Reconcile the local task list with a pulled remote snapshot.
///
/// The entity body resolves by whole-entity LWW on `task/{id}`; completion
/// days resolve independently per `task/{id}/day/{day}` so a merge can never
/// implicitly drop a day either side added.
pub fn merge_tasks(
    local: Vec<Task>,
    remote: Vec<(Task, Option<i64>)>,
    ledger: &TimestampLedger,
    tombstones: &[Tombstone],
    ns: UserId,
) -> MergeOutcome<Task> {
    let dead: HashSet<&str> = tombstones.iter().map(|t| t.id.as_str()).collect();
    let mut local_by_id: HashMap<String, Task> =
        local.into_iter().map(|t| (t.id_str(), t)).collect();
    let mut outcome = MergeOutcome::default();

    for (remote_task, remote_ts) in remote {
        let id = remote_task.id_str();
        if dead.contains(id.as_str()) {
            outcome.delete_remote.push(id);
            continue;
        }
        let Some(local_task) = local_by_id.remove(&id) else {
            // Remote-only and not tombstoned: adopt as new.
            outcome.merged.push(remote_task);
            continue;
        };

        let key = remote_task.field_key();
        let local_wins = ledger.is_local_newer(ns, &key, remote_ts);
        let mut merged = if local_wins {
            local_task.clone()
        } else {
            if ledger.get(ns, &key).is_some() {
                outcome.clear_keys.push(key);
            }
            remote_task.clone()
        };
        merged.completed_days = merge_completion_days(
            &local_task,
            &remote_task,
            remote_ts,
            ledger,
            ns,
            &mut outcome.clear_keys,
        );

        // Push whenever the merged row differs from what the remote holds.
        if local_wins || merged.completed_days != remote_task.completed_days {
            outcome.push.push(merged.clone());
        }
        outcome.merged.push(merged);
    }

    // Local-only tasks were created since the last confirmed push; they are
    // never dropped by a merge.
    for (_, task) in local_by_id {
        outcome.push.push(task.clone());
        outcome.merged.push(task);
    }

    outcome.merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    outcome
}

/// Per-day union: a day disappears only through a removal this device
/// stamped more recently than the remote row
fn merge_completion_days(
    local: &Task,
    remote: &Task,
    remote_ts: Option<i64>,
    ledger: &TimestampLedger,
    ns: UserId,
    clear_keys: &mut Vec<String>,
) -> BTreeSet<String> {
    let id = local.id_str();
    let mut days = BTreeSet::new();
    for day in local.completed_days.union(&remote.completed_days) {
        let in_local = local.completed_days.contains(day);
        let in_remote = remote.completed_days.contains(day);
        if in_local && in_remote {
            days.insert(day.clone());
            continue;
        }
        let key = keys::task_day(&id, day);
        if in_local {
            // Kept while our addition is unconfirmed; once the claim is
            // cleared a newer remote row lacking the day means it was
            // removed elsewhere.
            if ledger.get(ns, &key).is_some() || remote_ts.is_none() {
                days.insert(day.clone());
            }
        } else if ledger.is_local_newer(ns, &key, remote_ts) {
            // Our removal outranks the remote copy; the stamp survives
            // until the removal is pushed.
        } else {
            days.insert(day.clone());
            if ledger.get(ns, &key).is_some() {
                clear_keys.push(key);
            }
        }
    }
    days
}
