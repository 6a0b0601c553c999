//! Replication protocol module.

mod two_phase_aq;

pub use two_phase_aq::{
    PeerMsg, ReplicaConfigTwoPhaseAq, TwoPhaseAqClient, TwoPhaseAqReplica,
};
