//! Server heartbeats management module implementation.
//!
//! The failure detector is period-based: one tick per period on both roles.
//! The leader additionally keeps a liveness bit per follower slot, set by
//! incoming alive echoes and snapshot-reset once per period; slots are
//! pushed on join and removed on cull, shifting like the follower vector.

use crate::server::ReplicaId;
use crate::utils::{Bitmap, BiphaseError};

use tokio::time::{self, Duration, Interval, MissedTickBehavior};

/// The heartbeats management module.
pub(crate) struct Heartbeater {
    /// My replica ID.
    me: ReplicaId,

    /// Interval for the periodic heartbeat tick.
    interval: Interval,

    /// Liveness bit per follower slot (leader only; empty on followers).
    alive: Bitmap,
}

impl Heartbeater {
    /// Creates a new heartbeats manager with the given period.
    pub(crate) fn new_and_setup(
        me: ReplicaId,
        period: Duration,
    ) -> Result<Heartbeater, BiphaseError> {
        if period < Duration::from_millis(100) {
            return logged_err!(me; "invalid heartbeat period {:?}", period);
        }

        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Heartbeater {
            me,
            interval,
            alive: Bitmap::new(0, false),
        })
    }

    /// Waits for the next heartbeat period tick. Typically used as a branch
    /// of a `tokio::select!`.
    pub(crate) async fn ticked(&mut self) {
        self.interval.tick().await;
    }

    /// Appends a liveness slot for a newly joined follower.
    pub(crate) fn push_slot(&mut self, alive: bool) {
        self.alive.push(alive);
    }

    /// Removes the liveness slot of a culled follower.
    pub(crate) fn remove_slot(&mut self, slot: u8) -> Result<(), BiphaseError> {
        self.alive.remove(slot)?;
        Ok(())
    }

    /// Marks a follower slot alive upon hearing its echo.
    pub(crate) fn mark_alive(&mut self, slot: u8) -> Result<(), BiphaseError> {
        self.alive.set(slot, true)
    }

    /// Number of liveness slots currently tracked.
    pub(crate) fn num_slots(&self) -> u8 {
        self.alive.size()
    }

    /// Returns the slots that stayed silent through the last period, in
    /// descending order (safe for removal by index), and resets every slot
    /// to silent for the next period.
    pub(crate) fn snapshot_and_reset(&mut self) -> Vec<u8> {
        let mut dead: Vec<u8> = self
            .alive
            .iter()
            .filter_map(|(slot, up)| if up { None } else { Some(slot) })
            .collect();
        dead.reverse();

        for slot in 0..self.alive.size() {
            // infallible within size
            let _ = self.alive.set(slot, false);
        }
        dead
    }
}

#[cfg(test)]
mod heartbeat_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slots_snapshot_reset() -> Result<(), BiphaseError> {
        let mut hb = Heartbeater::new_and_setup(
            0,
            Duration::from_millis(100),
        )?;
        hb.push_slot(true);
        hb.push_slot(true);
        hb.push_slot(true);
        assert_eq!(hb.num_slots(), 3);

        // everyone alive through the first period
        assert_eq!(hb.snapshot_and_reset(), Vec::<u8>::new());

        // only slot 1 echoed back during this period
        hb.mark_alive(1)?;
        assert_eq!(hb.snapshot_and_reset(), vec![2, 0]);

        hb.remove_slot(2)?;
        hb.remove_slot(0)?;
        assert_eq!(hb.num_slots(), 1);
        hb.mark_alive(0)?;
        assert_eq!(hb.snapshot_and_reset(), Vec::<u8>::new());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_period() {
        assert!(
            Heartbeater::new_and_setup(0, Duration::from_millis(10)).is_err()
        );
    }
}
