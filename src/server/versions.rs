//! Versioned key-value state: per-key version records plus the query table.
//!
//! Holds every invariant-bearing transition of the commit protocol:
//! staging, acknowledgment bookkeeping, commit application, join slot
//! extension, and cull compensation.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::server::ReplicaId;
use crate::utils::{Bitmap, BiphaseError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Query (proposed mutation) ID type. Monotonically increasing; doubles as
/// the logical timestamp of commit order.
pub type QueryId = u64;

/// Capabilities required of the user-facing value type: codec-serializable
/// plus `Default` construction for empty reads.
pub trait ValueType:
    fmt::Debug
    + PartialEq
    + Clone
    + Default
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> ValueType for T where
    T: fmt::Debug
        + PartialEq
        + Clone
        + Default
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Command to the key-value state.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command<V> {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key.
    Put { key: String, value: V },

    /// Delete given key.
    Remove { key: String },
}

impl<V> Command<V> {
    /// Returns the key the command operates on.
    pub fn key(&self) -> &String {
        match self {
            Command::Get { key }
            | Command::Put { key, .. }
            | Command::Remove { key } => key,
        }
    }
}

/// Command execution result returned to clients.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult<V> {
    /// Committed value of the key, or the default value if absent.
    Get { value: V },

    /// Mutation accepted into the staging pipeline.
    Put,

    /// Deletion accepted into the staging pipeline.
    Remove,
}

/// Tag of a query record's mutation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Action {
    Put,
    Remove,

    /// Bookkeeping tag of the most-recently-committed PUT for a key; also
    /// the join-replay marker meaning "already committed, do not ack".
    Done,
}

/// Leader-side acknowledgment bookkeeping attached to a pending query.
#[derive(Debug, Clone)]
pub struct LeaderBookkeeping {
    /// Number of follower slots that have not acknowledged yet; zero means
    /// ready to commit.
    pub acks_remaining: u8,

    /// Which follower slots have acknowledged.
    pub who_acked: Bitmap,
}

impl LeaderBookkeeping {
    /// Creates bookkeeping expecting acknowledgments from `followers` slots.
    pub fn new(followers: u8) -> Self {
        LeaderBookkeeping {
            acks_remaining: followers,
            who_acked: Bitmap::new(followers, false),
        }
    }
}

/// A proposed or committed mutation held in the query table.
#[derive(Debug, Clone)]
pub struct QueryRecord<V> {
    /// Key the mutation applies to.
    pub key: String,

    /// New value; the default value for `Remove`.
    pub value: V,

    /// Mutation tag; flips to `Done` when a PUT commits.
    pub action: Action,

    /// Present on the leader only.
    pub leader_bk: Option<LeaderBookkeeping>,
}

/// Per-key version record.
#[derive(Debug, Clone, Default)]
pub struct VersionRecord {
    /// Identity of the currently-committed version, if any.
    pub committed: Option<QueryId>,

    /// Staged-but-not-committed version ids, in proposal order. Duplicates
    /// forbidden; never contains the committed id.
    pub pending: VecDeque<QueryId>,
}

/// What a commit did, for the caller's logging and telemetry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommitEffect {
    /// A PUT became the committed version.
    Put,

    /// A REMOVE committed; `key_erased` tells whether the key is gone.
    Remove { key_erased: bool },

    /// A join-replayed committed version was installed.
    CaughtUp,
}

/// The in-memory versioned key-value state: key -> version record, plus
/// query id -> query record.
pub struct VersionedKv<V> {
    /// My replica ID (for logging).
    me: ReplicaId,

    /// Map from key -> per-key version record.
    kv: HashMap<String, VersionRecord>,

    /// Map from query id -> pending or committed query record.
    queries: HashMap<QueryId, QueryRecord<V>>,
}

impl<V: ValueType> VersionedKv<V> {
    /// Creates a new empty versioned key-value state.
    pub fn new(me: ReplicaId) -> Self {
        VersionedKv {
            me,
            kv: HashMap::new(),
            queries: HashMap::new(),
        }
    }

    /// Records a newly staged version: appends the id to the key's pending
    /// list and inserts the query record.
    pub fn stage(
        &mut self,
        qid: QueryId,
        key: &str,
        value: V,
        action: Action,
        leader_bk: Option<LeaderBookkeeping>,
    ) -> Result<(), BiphaseError> {
        if self.queries.contains_key(&qid) {
            return logged_err!(self.me; "duplicate query {} staged", qid);
        }

        let record = self.kv.entry(key.to_string()).or_default();
        debug_assert!(!record.pending.contains(&qid));
        record.pending.push_back(qid);

        self.queries.insert(
            qid,
            QueryRecord {
                key: key.to_string(),
                value,
                action,
                leader_bk,
            },
        );
        Ok(())
    }

    /// Applies the commit of query `qid` to the tables. Returns what the
    /// commit did. Unknown ids and ids staged for a since-vanished key are
    /// protocol violations surfaced as errors; callers drop the message.
    pub fn commit(&mut self, qid: QueryId) -> Result<CommitEffect, BiphaseError> {
        let (key, action) = match self.queries.get(&qid) {
            Some(q) => (q.key.clone(), q.action),
            None => {
                return logged_err!(self.me; "commit of unknown query {}", qid);
            }
        };
        let record = match self.kv.get_mut(&key) {
            Some(r) => r,
            None => {
                return logged_err!(self.me; "commit {} for absent key '{}'",
                                            qid, key);
            }
        };

        // a committing version leaves the pending list
        record.pending.retain(|&v| v != qid);

        match action {
            Action::Put => {
                if let Some(prev) = record.committed {
                    self.queries.remove(&prev);
                    record.pending.retain(|&v| v != prev);
                }
                record.committed = Some(qid);
                // keep the record alive for reads by version id
                self.queries.get_mut(&qid).unwrap().action = Action::Done;
                Ok(CommitEffect::Put)
            }

            Action::Remove => {
                if let Some(prev) = record.committed {
                    self.queries.remove(&prev);
                    record.pending.retain(|&v| v != prev);
                }
                self.queries.remove(&qid);
                record.committed = None;
                if record.pending.is_empty() {
                    self.kv.remove(&key);
                    Ok(CommitEffect::Remove { key_erased: true })
                } else {
                    Ok(CommitEffect::Remove { key_erased: false })
                }
            }

            Action::Done => {
                // join catch-up replay of an already-committed version
                record.committed = Some(qid);
                Ok(CommitEffect::CaughtUp)
            }
        }
    }

    /// Reads the committed value of a key; the default value if the key has
    /// no committed version or is absent.
    pub fn read_committed(&self, key: &str) -> V {
        self.kv
            .get(key)
            .and_then(|r| r.committed)
            .and_then(|qid| self.queries.get(&qid))
            .map(|q| q.value.clone())
            .unwrap_or_default()
    }

    /// Returns true if the key has no outstanding (staged-not-committed)
    /// writes, i.e. a local read of the committed value is safe.
    pub fn is_settled(&self, key: &str) -> bool {
        self.kv.get(key).map_or(true, |r| r.pending.is_empty())
    }

    /// Leader-side acknowledgment of `qid` from follower `slot`. Duplicate
    /// acknowledgments are ignored. Returns true if the query became ready
    /// to commit.
    pub fn acknowledge(
        &mut self,
        qid: QueryId,
        slot: u8,
    ) -> Result<bool, BiphaseError> {
        let query = match self.queries.get_mut(&qid) {
            Some(q) => q,
            None => {
                return logged_err!(self.me; "ack of unknown query {}", qid);
            }
        };
        let bk = match query.leader_bk.as_mut() {
            Some(bk) => bk,
            None => {
                return logged_err!(self.me; "ack of query {} without bookkeeping",
                                            qid);
            }
        };

        if bk.who_acked.get(slot)? {
            return Ok(false); // duplicate, ignore
        }
        bk.who_acked.set(slot, true)?;
        bk.acks_remaining -= 1;
        Ok(bk.acks_remaining == 0)
    }

    /// Leader-side join bookkeeping: extends every query record with one
    /// more follower slot. Committed (`Done`) records get a pre-set bit;
    /// pending records gain one more expected acknowledgment.
    pub fn extend_slot(&mut self) {
        for query in self.queries.values_mut() {
            if let Some(bk) = query.leader_bk.as_mut() {
                if query.action == Action::Done {
                    bk.who_acked.push(true);
                } else {
                    bk.who_acked.push(false);
                    bk.acks_remaining += 1;
                }
            }
        }
    }

    /// Rolls back one `extend_slot()` after an aborted join.
    pub fn retract_slot(&mut self) -> Result<(), BiphaseError> {
        for query in self.queries.values_mut() {
            if let Some(bk) = query.leader_bk.as_mut() {
                if bk.who_acked.size() == 0 {
                    continue;
                }
                let last = bk.who_acked.size() - 1;
                let bit = bk.who_acked.remove(last)?;
                if !bit {
                    bk.acks_remaining -= 1;
                }
            }
        }
        Ok(())
    }

    /// Leader-side cull of follower `slot`: erases the slot's bit from every
    /// query record, acknowledging on behalf of the dead follower. Returns
    /// the queries that became ready to commit, in id order.
    pub fn cull_slot(&mut self, slot: u8) -> Result<Vec<QueryId>, BiphaseError> {
        let mut ready = vec![];
        for (&qid, query) in self.queries.iter_mut() {
            if let Some(bk) = query.leader_bk.as_mut() {
                let acked = bk.who_acked.remove(slot)?;
                if !acked {
                    bk.acks_remaining -= 1;
                    if bk.acks_remaining == 0 && query.action != Action::Done {
                        ready.push(qid);
                    }
                }
            }
        }
        ready.sort_unstable();
        Ok(ready)
    }

    /// Snapshot of every query record for join replay, in id order.
    pub fn replay_queries(&self) -> Vec<(QueryId, String, V, Action)> {
        let mut queries: Vec<_> = self
            .queries
            .iter()
            .map(|(&qid, q)| (qid, q.key.clone(), q.value.clone(), q.action))
            .collect();
        queries.sort_unstable_by_key(|(qid, ..)| *qid);
        queries
    }

    /// Ids of every committed version for join replay, in id order.
    pub fn committed_queries(&self) -> Vec<QueryId> {
        let mut committed: Vec<_> =
            self.kv.values().filter_map(|r| r.committed).collect();
        committed.sort_unstable();
        committed
    }

    /// Looks up a query record.
    pub fn query(&self, qid: QueryId) -> Option<&QueryRecord<V>> {
        self.queries.get(&qid)
    }

    /// Number of keys currently present.
    pub fn num_keys(&self) -> usize {
        self.kv.len()
    }

    /// Number of query records currently held.
    pub fn num_queries(&self) -> usize {
        self.queries.len()
    }

    /// Wipes all state (follower recovery path).
    pub fn clear(&mut self) {
        self.kv.clear();
        self.queries.clear();
    }

    /// Checks the cross-table invariants: the query table holds exactly the
    /// ids reachable from version records, and no committed id lingers in
    /// its key's pending list.
    pub fn check_invariants(&self) -> Result<(), BiphaseError> {
        let mut reachable = vec![];
        for (key, record) in self.kv.iter() {
            if let Some(qid) = record.committed {
                if record.pending.contains(&qid) {
                    return logged_err!(self.me; "committed {} still pending for '{}'",
                                                qid, key);
                }
                reachable.push(qid);
            }
            reachable.extend(record.pending.iter().copied());
        }

        reachable.sort_unstable();
        let dup = reachable.windows(2).any(|w| w[0] == w[1]);
        if dup {
            return logged_err!(self.me; "some query id reachable twice");
        }
        if reachable.len() != self.queries.len() {
            return logged_err!(self.me; "query table size {} != reachable ids {}",
                                        self.queries.len(), reachable.len());
        }
        for qid in &reachable {
            if !self.queries.contains_key(qid) {
                return logged_err!(self.me; "reachable id {} missing from queries",
                                            qid);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod versions_tests {
    use super::*;

    fn put_bk(followers: u8) -> Option<LeaderBookkeeping> {
        Some(LeaderBookkeeping::new(followers))
    }

    #[test]
    fn get_empty() {
        let kv: VersionedKv<String> = VersionedKv::new(0);
        assert_eq!(kv.read_committed("Jose"), String::default());
        assert!(kv.is_settled("Jose"));
    }

    #[test]
    fn stage_commit_put() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "Jose", "180".into(), Action::Put, put_bk(0))?;
        assert!(!kv.is_settled("Jose"));
        assert_eq!(kv.read_committed("Jose"), String::default());

        assert_eq!(kv.commit(0)?, CommitEffect::Put);
        assert_eq!(kv.read_committed("Jose"), String::from("180"));
        assert!(kv.is_settled("Jose"));
        assert_eq!(kv.query(0).unwrap().action, Action::Done);
        kv.check_invariants()
    }

    #[test]
    fn put_twice_same_key() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "k", "1".into(), Action::Put, put_bk(0))?;
        kv.stage(1, "k", "2".into(), Action::Put, put_bk(0))?;
        kv.commit(0)?;
        assert_eq!(kv.read_committed("k"), String::from("1"));
        assert!(!kv.is_settled("k"));

        kv.commit(1)?;
        assert_eq!(kv.read_committed("k"), String::from("2"));
        assert!(kv.is_settled("k"));
        // exactly one surviving committed record for the key
        assert_eq!(kv.num_queries(), 1);
        assert_eq!(kv.query(1).unwrap().action, Action::Done);
        assert!(kv.query(0).is_none());
        kv.check_invariants()
    }

    #[test]
    fn put_then_remove() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "a", "1".into(), Action::Put, put_bk(0))?;
        kv.commit(0)?;
        kv.stage(1, "a", String::default(), Action::Remove, put_bk(0))?;
        assert_eq!(
            kv.commit(1)?,
            CommitEffect::Remove { key_erased: true }
        );
        assert_eq!(kv.read_committed("a"), String::default());
        assert_eq!(kv.num_keys(), 0);
        assert_eq!(kv.num_queries(), 0);
        kv.check_invariants()
    }

    #[test]
    fn remove_between_puts() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "k", "1".into(), Action::Put, put_bk(0))?;
        kv.stage(1, "k", "2".into(), Action::Put, put_bk(0))?;
        kv.commit(0)?;
        kv.stage(2, "k", String::default(), Action::Remove, put_bk(0))?;
        // the remove wipes the committed version but the key survives with
        // a later put still pending
        assert_eq!(
            kv.commit(2)?,
            CommitEffect::Remove { key_erased: false }
        );
        assert_eq!(kv.read_committed("k"), String::default());
        assert!(!kv.is_settled("k"));
        kv.check_invariants()?;

        kv.commit(1)?;
        assert_eq!(kv.read_committed("k"), String::from("2"));
        assert!(kv.is_settled("k"));
        kv.check_invariants()
    }

    #[test]
    fn remove_unknown_key_default() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        // a remove staged on an absent key creates the record, then erases
        // it again once committed
        kv.stage(0, "ghost", String::default(), Action::Remove, put_bk(0))?;
        assert_eq!(
            kv.commit(0)?,
            CommitEffect::Remove { key_erased: true }
        );
        assert_eq!(kv.num_keys(), 0);
        kv.check_invariants()
    }

    #[test]
    fn acknowledge_idempotent() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(7, "k", "v".into(), Action::Put, put_bk(2))?;
        assert!(!kv.acknowledge(7, 0)?);
        // duplicate ack from the same slot must not double-decrement
        assert!(!kv.acknowledge(7, 0)?);
        assert_eq!(
            kv.query(7).unwrap().leader_bk.as_ref().unwrap().acks_remaining,
            1
        );
        assert!(kv.acknowledge(7, 1)?);
        Ok(())
    }

    #[test]
    fn acknowledge_unknown_query() {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        assert!(kv.acknowledge(42, 0).is_err());
    }

    #[test]
    fn extend_then_retract_slot() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "k", "v".into(), Action::Put, put_bk(1))?;
        kv.commit(0)?;
        kv.stage(1, "k", "w".into(), Action::Put, put_bk(1))?;

        kv.extend_slot();
        // the Done record got a pre-set bit; the pending one an expected ack
        let done_bk = kv.query(0).unwrap().leader_bk.as_ref().unwrap();
        assert_eq!(done_bk.who_acked.size(), 2);
        assert!(done_bk.who_acked.get(1)?);
        let pend_bk = kv.query(1).unwrap().leader_bk.as_ref().unwrap();
        assert_eq!(pend_bk.acks_remaining, 2);
        assert!(!pend_bk.who_acked.get(1)?);

        kv.retract_slot()?;
        let pend_bk = kv.query(1).unwrap().leader_bk.as_ref().unwrap();
        assert_eq!(pend_bk.acks_remaining, 1);
        assert_eq!(pend_bk.who_acked.size(), 1);
        Ok(())
    }

    #[test]
    fn cull_slot_compensates() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "k", "v".into(), Action::Put, put_bk(2))?;
        kv.stage(1, "l", "w".into(), Action::Put, put_bk(2))?;
        kv.acknowledge(0, 1)?;
        kv.acknowledge(1, 0)?;

        // culling slot 1 completes query 1's quorum only through the
        // compensating decrement; query 0 already had slot 1's ack
        let ready = kv.cull_slot(1)?;
        assert_eq!(ready, vec![1]);
        assert_eq!(
            kv.query(0).unwrap().leader_bk.as_ref().unwrap().acks_remaining,
            1
        );

        // second cull completes query 0
        let ready = kv.cull_slot(0)?;
        assert_eq!(ready, vec![0]);
        Ok(())
    }

    #[test]
    fn replay_snapshots_ordered() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(2, "b", "2".into(), Action::Put, put_bk(0))?;
        kv.stage(1, "a", "1".into(), Action::Put, put_bk(0))?;
        kv.commit(1)?;

        let replay = kv.replay_queries();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].0, 1);
        assert_eq!(replay[0].3, Action::Done);
        assert_eq!(replay[1].0, 2);
        assert_eq!(replay[1].3, Action::Put);
        assert_eq!(kv.committed_queries(), vec![1]);
        Ok(())
    }

    #[test]
    fn commit_unknown_query() {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        assert!(kv.commit(42).is_err());
    }

    #[test]
    fn duplicate_stage_rejected() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "k", "v".into(), Action::Put, None)?;
        assert!(kv
            .stage(0, "k", "v".into(), Action::Put, None)
            .is_err());
        Ok(())
    }

    #[test]
    fn clear_wipes_all() -> Result<(), BiphaseError> {
        let mut kv: VersionedKv<String> = VersionedKv::new(0);
        kv.stage(0, "k", "v".into(), Action::Put, None)?;
        kv.commit(0)?;
        kv.clear();
        assert_eq!(kv.num_keys(), 0);
        assert_eq!(kv.num_queries(), 0);
        assert_eq!(kv.read_committed("k"), String::default());
        Ok(())
    }
}
