//! TwoPhaseAq -- failure detection & recovery.

use super::*;

use crate::utils::BiphaseError;

use tokio::time::{self, Duration, Instant};

// TwoPhaseAqReplica failure detector logic
impl<V: ValueType> TwoPhaseAqReplica<V> {
    /// Leader-side heartbeat period tick: culls followers that stayed
    /// silent through the last period, pings the survivors, and flushes
    /// commit latency telemetry.
    pub(super) fn heartbeat_tick_leader(
        &mut self,
    ) -> Result<(), BiphaseError> {
        debug_assert_eq!(
            self.heartbeater.num_slots() as usize,
            self.followers.len()
        );

        // dead slots come in descending order, so removals do not disturb
        // the slots still to be culled
        for slot in self.heartbeater.snapshot_and_reset() {
            self.cull_follower(slot)?;
        }

        for (slot, &(fid, _)) in self.followers.iter().enumerate() {
            self.transport_hub
                .send_msg(PeerMsg::Alive { slot: slot as u8 }, fid)?;
        }

        self.flush_commit_stats();
        Ok(())
    }

    /// Removes a silent follower: drops its handle, member entry and
    /// liveness slot, then acknowledges on its behalf; queries whose quorum
    /// completes through the compensation commit immediately.
    fn cull_follower(&mut self, slot: u8) -> Result<(), BiphaseError> {
        let (fid, addr) = self.followers.remove(slot as usize);
        pf_warn!(self.id; "culling silent follower {} '{}' at slot {}",
                          fid, addr, slot);

        self.heartbeater.remove_slot(slot)?;
        self.transport_hub.disconnect_peer(fid)?;

        for qid in self.versions.cull_slot(slot)? {
            self.commit_query(qid)?;
        }
        Ok(())
    }

    /// Logs and drops the commit latency records accumulated over the last
    /// period.
    fn flush_commit_stats(&mut self) {
        let (cnt, stats) = self.commit_stats.summarize(1);
        if cnt > 0 {
            pf_info!(self.id;
                     "{} commits last period, latency mean {:.1} us stdev {:.1} us",
                     cnt, stats[0].0, stats[0].1);
        }
        self.commit_stats.remove_completed(1);
    }

    /// Follower-side heartbeat period tick: a set pulse means the leader
    /// was heard this period; a silent period triggers a membership check
    /// with a reply deadline.
    pub(super) async fn heartbeat_tick_follower(
        &mut self,
    ) -> Result<(), BiphaseError> {
        if self.pulse.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.ready.load(Ordering::SeqCst) {
            // still catching up; if the leader dropped me mid-catch-up the
            // connection is gone and the join must be retried
            if !self.transport_hub.is_connected(LEADER) {
                pf_warn!(self.id; "catch-up connection lost, restarting");
                return self.reset_and_rejoin().await;
            }
            return Ok(());
        }

        if self.check_outstanding {
            return Ok(()); // deadline timer will fire
        }

        pf_debug!(self.id; "silent period, checking membership with leader");
        self.check_outstanding = true;
        self.check_deadline.as_mut().reset(
            Instant::now()
                + Duration::from_millis(self.config.check_timeout_ms),
        );
        self.transport_hub.send_msg(
            PeerMsg::Check {
                p2p_addr: self.p2p_addr,
            },
            LEADER,
        )?;
        Ok(())
    }

    /// Handler of CheckReply from the leader. A negative answer means I was
    /// culled and must rejoin from scratch.
    pub(super) async fn handle_check_reply(
        &mut self,
        member: bool,
    ) -> Result<(), BiphaseError> {
        if self.is_leader || !self.check_outstanding {
            return Ok(());
        }
        // disarming the check also disarms its deadline
        self.check_outstanding = false;

        if !member {
            pf_warn!(self.id; "no longer a member, restarting");
            self.reset_and_rejoin().await?;
        }
        Ok(())
    }

    /// The membership check deadline passed without an answer: treat the
    /// leader connection as lost and rejoin.
    pub(super) async fn handle_check_deadline(
        &mut self,
    ) -> Result<(), BiphaseError> {
        if !self.check_outstanding {
            return Ok(());
        }
        self.check_outstanding = false;

        pf_warn!(self.id; "membership check unanswered, restarting");
        self.reset_and_rejoin().await
    }

    /// Follower recovery path: wipe all protocol state, reconnect to the
    /// leader, and go through the join catch-up again. Loops until the
    /// leader accepts the connection.
    pub(super) async fn reset_and_rejoin(
        &mut self,
    ) -> Result<(), BiphaseError> {
        self.ready.store(false, Ordering::SeqCst);
        self.versions.clear();
        self.pending_reads.clear();
        self.check_outstanding = false;

        // tear down the stale leader connection before dialing anew
        self.transport_hub.leave()?;
        time::sleep(Duration::from_millis(100)).await;

        while let Err(e) = self
            .transport_hub
            .connect_to_peer(LEADER, self.leader_addr)
            .await
        {
            pf_warn!(self.id; "reconnect to leader failed: {}", e);
            time::sleep(Duration::from_millis(self.config.alive_interval_ms))
                .await;
        }

        self.transport_hub.send_msg(
            PeerMsg::Join {
                p2p_addr: self.p2p_addr,
            },
            LEADER,
        )?;
        self.pulse.store(true, Ordering::SeqCst);
        pf_info!(self.id; "reconnected to leader, rejoin sent");
        Ok(())
    }
}
