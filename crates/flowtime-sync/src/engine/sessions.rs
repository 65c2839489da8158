//! Session sync: append-only union merge
//!
//! Sessions are never edited or deleted after the fact, so the merge is a
//! plain id union. Losing a completed session is the one unforgivable bug
//! in this subsystem; every branch here errs on the side of keeping both
//! sides.

use std::collections::HashMap;

use flowtime_core::db::Tombstone;
use flowtime_core::{Session, Syncable, TimestampLedger, UserId};

use super::{EngineDriver, MergeOutcome, SyncEngine};
use crate::remote::RemoteFilter;

/// Driver syncing the `sessions` collection
pub enum SessionDriver {}

/// Engine over the session store
pub type SessionEngine = SyncEngine<SessionDriver>;

impl EngineDriver for SessionDriver {
    type Entity = Session;
    const COLLECTION: &'static str = "sessions";

    fn pull_filter(owner: UserId) -> RemoteFilter {
        RemoteFilter::owner(owner.as_str()).with_order("started_at.desc")
    }

    fn merge(
        local: Vec<Session>,
        remote: Vec<(Session, Option<i64>)>,
        _ledger: &TimestampLedger,
        _tombstones: &[Tombstone],
        _ns: UserId,
    ) -> MergeOutcome<Session> {
        merge_sessions(local, remote)
    }
}

/// Union the local and remote session sets by id.
///
/// On an id collision the local copy wins; the device that just produced a
/// session is authoritative for it. Sessions present only locally were
/// recorded offline and are marked for push.
pub fn merge_sessions(
    local: Vec<Session>,
    remote: Vec<(Session, Option<i64>)>,
) -> MergeOutcome<Session> {
    let mut by_id: HashMap<String, Session> = remote
        .into_iter()
        .map(|(session, _)| (session.id_str(), session))
        .collect();

    let mut outcome = MergeOutcome::default();
    for session in local {
        let id = session.id_str();
        if !by_id.contains_key(&id) {
            outcome.push.push(session.clone());
        }
        by_id.insert(id, session);
    }

    outcome.merged = by_id.into_values().collect();
    outcome
        .merged
        .sort_by(|a, b| b.started_at.cmp(&a.started_at));
    outcome
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_union_never_loses_a_session() {
        let ns = UserId::new();
        let locals: Vec<Session> = (0..4).map(|i| Session::new(ns, i * 100, 1500)).collect();
        let remotes: Vec<Session> = (0..3).map(|i| Session::new(ns, i * 100 + 50, 900)).collect();
        // One id on both sides.
        let shared = locals[0].clone();

        let mut remote_input: Vec<(Session, Option<i64>)> =
            remotes.iter().cloned().map(|s| (s, Some(1))).collect();
        remote_input.push((shared, Some(1)));

        let outcome = merge_sessions(locals.clone(), remote_input);

        let merged_ids: HashSet<String> = outcome.merged.iter().map(Session::id_str).collect();
        for session in locals.iter().chain(remotes.iter()) {
            assert!(merged_ids.contains(&session.id_str()));
        }
        assert_eq!(merged_ids.len(), locals.len() + remotes.len());
    }

    #[test]
    fn test_collision_prefers_local_copy() {
        let ns = UserId::new();
        let local = Session::new(ns, 100, 1500);
        let mut remote = local.clone();
        remote.duration_secs = 1;

        let outcome = merge_sessions(vec![local.clone()], vec![(remote, Some(1))]);

        assert_eq!(outcome.merged, vec![local]);
        // Already known remotely: nothing to push.
        assert!(outcome.push.is_empty());
    }

    #[test]
    fn test_offline_session_is_pushed_after_reconnect() {
        let ns = UserId::new();
        let offline = Session::new(ns, 200, 1500);
        let synced = Session::new(ns, 100, 900);

        let outcome = merge_sessions(
            vec![offline.clone(), synced.clone()],
            vec![(synced, Some(1))],
        );

        assert_eq!(outcome.push, vec![offline.clone()]);
        assert_eq!(outcome.merged.len(), 2);
        assert_eq!(outcome.merged[0], offline);
    }

    #[test]
    fn test_merged_sorted_by_start_time_desc() {
        let ns = UserId::new();
        let early = Session::new(ns, 10, 60);
        let late = Session::new(ns, 900, 60);

        let outcome = merge_sessions(vec![early.clone()], vec![(late.clone(), Some(1))]);

        assert_eq!(outcome.merged, vec![late, early]);
    }
}
