//! TwoPhaseAq -- follower join & catch-up.

use super::*;

use crate::server::ReplicaId;
use crate::utils::BiphaseError;

// TwoPhaseAqReplica join / catch-up logic
impl<V: ValueType> TwoPhaseAqReplica<V> {
    /// Handler of Join handshake from a new follower. Hands over every
    /// in-flight query and every committed version atomically with respect
    /// to new proposals (this handler runs to completion before any other
    /// event is dispatched), then admits the joiner into the member list.
    pub(super) fn handle_join(
        &mut self,
        peer: ReplicaId,
        p2p_addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        if !self.is_leader {
            return logged_err!(self.id; "Join message on a follower");
        }
        if self.follower_slot(peer).is_some() {
            return logged_err!(self.id; "Join from existing member {}", peer);
        }
        if !self.transport_hub.is_connected(peer) {
            return logged_err!(self.id; "Join from unconnected peer {}", peer);
        }

        let slot = self.followers.len() as u8;
        pf_info!(self.id; "follower {} '{}' joining at slot {}...",
                          peer, p2p_addr, slot);

        // every query record grows one slot bit: committed records are
        // replayed as Done (no ack expected), pending records become
        // outstanding acknowledgments from the new member
        self.versions.extend_slot();
        for (qid, key, value, action) in self.versions.replay_queries() {
            self.transport_hub.send_msg(
                PeerMsg::Stage {
                    key,
                    value,
                    action,
                    qid,
                    slot,
                },
                peer,
            )?;
        }

        // replay commits so the joiner installs every committed version
        for qid in self.versions.committed_queries() {
            self.transport_hub.send_msg(PeerMsg::Commit { qid }, peer)?;
        }

        // catch-up traffic goes through the joiner's messenger; if that
        // connection died along the way, be pessimistic and abort
        if !self.transport_hub.is_connected(peer) {
            return self.abort_join(peer);
        }

        // admit into member list and liveness tracking, then hand over
        self.followers.push((peer, p2p_addr));
        self.heartbeater.push_slot(true);
        self.transport_hub.send_msg(PeerMsg::Ready, peer)?;
        pf_info!(self.id; "follower {} caught up as slot {}", peer, slot);
        Ok(())
    }

    /// Aborts an in-progress join: rolls back the slot bookkeeping and drops
    /// the joiner's connection. The joiner retries on its own schedule.
    fn abort_join(&mut self, peer: ReplicaId) -> Result<(), BiphaseError> {
        pf_warn!(self.id; "aborting join of follower {}", peer);
        self.versions.retract_slot()?;
        self.transport_hub.disconnect_peer(peer)?;
        Ok(())
    }

    /// Handler of Ready message from the leader: catch-up complete, begin
    /// serving reads locally.
    pub(super) fn handle_ready(
        &mut self,
        peer: ReplicaId,
    ) -> Result<(), BiphaseError> {
        if self.is_leader {
            return logged_err!(self.id; "Ready message on the leader");
        }

        self.ready.store(true, Ordering::SeqCst);
        self.pulse.store(true, Ordering::SeqCst);
        pf_info!(self.id; "caught up <- {}, now serving", peer);
        Ok(())
    }
}
