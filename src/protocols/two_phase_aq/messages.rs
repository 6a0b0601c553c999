//! TwoPhaseAq -- peer-peer messaging.

use super::*;

use crate::server::{ApiReply, Command, CommandResult, ReplicaId};
use crate::utils::BiphaseError;

// TwoPhaseAqReplica peer-peer messages handling
impl<V: ValueType> TwoPhaseAqReplica<V> {
    /// Synthesized handler of peer messages. Messages arriving at the wrong
    /// role, or about unknown query ids, are dropped with an error log.
    pub(super) async fn handle_msg(
        &mut self,
        peer: ReplicaId,
        msg: PeerMsg<V>,
    ) -> Result<(), BiphaseError> {
        match msg {
            PeerMsg::Stage {
                key,
                value,
                action,
                qid,
                slot,
            } => self.handle_stage(peer, key, value, action, qid, slot),

            PeerMsg::Acknowledge { qid, slot } => {
                self.handle_acknowledge(peer, qid, slot)
            }

            PeerMsg::Commit { qid } => self.handle_commit(peer, qid),

            PeerMsg::Join { p2p_addr } => self.handle_join(peer, p2p_addr),

            PeerMsg::Ready => self.handle_ready(peer),

            PeerMsg::Alive { slot } => self.handle_alive(peer, slot),

            PeerMsg::Check { p2p_addr } => self.handle_check(peer, p2p_addr),

            PeerMsg::CheckReply { member } => {
                self.handle_check_reply(member).await
            }

            PeerMsg::Redirect { cmd } => self.handle_redirect(peer, cmd),

            PeerMsg::ReadFwd { key, ticket } => {
                self.handle_read_fwd(peer, key, ticket)
            }

            PeerMsg::ReadBack { ticket, value } => {
                self.handle_read_back(ticket, value)
            }
        }
    }

    /// Handler of Stage message from leader: holds the proposed version
    /// locally and acknowledges, unless the stage is a join-replay of an
    /// already-committed version.
    fn handle_stage(
        &mut self,
        peer: ReplicaId,
        key: String,
        value: V,
        action: Action,
        qid: QueryId,
        slot: u8,
    ) -> Result<(), BiphaseError> {
        if self.is_leader {
            return logged_err!(self.id; "Stage message on the leader");
        }
        pf_trace!(self.id; "received Stage <- {} qid {} key '{}'",
                           peer, qid, key);

        self.versions.stage(qid, &key, value, action, None)?;
        if action != Action::Done {
            self.transport_hub
                .send_msg(PeerMsg::Acknowledge { qid, slot }, LEADER)?;
        }
        Ok(())
    }

    /// Handler of Acknowledge message from a follower. The acking slot is
    /// derived from the sender's stable ID so that acknowledgments racing a
    /// cull cannot be mis-attributed to a shifted slot.
    fn handle_acknowledge(
        &mut self,
        peer: ReplicaId,
        qid: QueryId,
        _slot: u8,
    ) -> Result<(), BiphaseError> {
        if !self.is_leader {
            return logged_err!(self.id; "Acknowledge message on a follower");
        }
        let slot = match self.follower_slot(peer) {
            Some(slot) => slot,
            None => {
                // sender got culled since; its ack is already compensated
                pf_debug!(self.id; "ignoring ack from non-member {}", peer);
                return Ok(());
            }
        };
        pf_trace!(self.id; "received Acknowledge <- {} qid {}", peer, qid);

        if self.versions.acknowledge(qid, slot)? {
            self.commit_query(qid)?;
        }
        Ok(())
    }

    /// Handler of Commit message from leader.
    fn handle_commit(
        &mut self,
        peer: ReplicaId,
        qid: QueryId,
    ) -> Result<(), BiphaseError> {
        if self.is_leader {
            return logged_err!(self.id; "Commit message on the leader");
        }
        pf_trace!(self.id; "received Commit <- {} qid {}", peer, qid);

        self.commit_query(qid)
    }

    /// Handler of Alive heartbeat. On the leader this is a follower's echo
    /// marking its slot alive; on a follower it is the leader's ping, which
    /// sets the pulse and is echoed back.
    fn handle_alive(
        &mut self,
        peer: ReplicaId,
        slot: u8,
    ) -> Result<(), BiphaseError> {
        if self.is_leader {
            if let Some(slot) = self.follower_slot(peer) {
                self.heartbeater.mark_alive(slot)?;
            }
        } else {
            self.pulse.store(true, Ordering::SeqCst);
            self.transport_hub
                .send_msg(PeerMsg::Alive { slot }, LEADER)?;
        }
        Ok(())
    }

    /// Handler of Check message from a follower wondering whether it is
    /// still a member.
    fn handle_check(
        &mut self,
        peer: ReplicaId,
        p2p_addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        if !self.is_leader {
            return logged_err!(self.id; "Check message on a follower");
        }

        let member = self.followers.iter().any(|&(_, addr)| addr == p2p_addr);
        pf_debug!(self.id; "membership check <- {} '{}': {}",
                           peer, p2p_addr, member);
        self.transport_hub
            .send_msg(PeerMsg::CheckReply { member }, peer)?;
        Ok(())
    }

    /// Handler of Redirect message carrying a follower-received mutation.
    fn handle_redirect(
        &mut self,
        peer: ReplicaId,
        cmd: Command<V>,
    ) -> Result<(), BiphaseError> {
        if !self.is_leader {
            return logged_err!(self.id; "Redirect message on a follower");
        }
        pf_trace!(self.id; "received Redirect <- {} key '{}'", peer, cmd.key());

        match cmd {
            Command::Put { key, value } => {
                self.stage_mutation(&key, value, Action::Put)?;
            }
            Command::Remove { key } => {
                self.stage_mutation(&key, V::default(), Action::Remove)?;
            }
            Command::Get { .. } => {
                return logged_err!(self.id; "redirected Get <- {}", peer);
            }
        }
        Ok(())
    }

    /// Handler of ReadFwd message: resolves an apportioned read against my
    /// committed state.
    fn handle_read_fwd(
        &mut self,
        peer: ReplicaId,
        key: String,
        ticket: u64,
    ) -> Result<(), BiphaseError> {
        if !self.is_leader {
            return logged_err!(self.id; "ReadFwd message on a follower");
        }

        let value = self.versions.read_committed(&key);
        self.transport_hub
            .send_msg(PeerMsg::ReadBack { ticket, value }, peer)?;
        Ok(())
    }

    /// Handler of ReadBack message: completes a forwarded read.
    fn handle_read_back(
        &mut self,
        ticket: u64,
        value: V,
    ) -> Result<(), BiphaseError> {
        match self.pending_reads.remove(&ticket) {
            Some((client, req_id)) => {
                self.external_api.send_reply(
                    ApiReply::Reply {
                        id: req_id,
                        result: Some(CommandResult::Get { value }),
                    },
                    client,
                )?;
                Ok(())
            }
            None => {
                // client likely left or state was reset meanwhile
                pf_debug!(self.id; "no pending read for ticket {}", ticket);
                Ok(())
            }
        }
    }
}
