//! Public interface to the biphase core library, linked by the server,
//! client, rendezvous, and balancer executables.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod balancer;
mod client;
mod protocols;
mod rendezvous;
mod server;

pub use crate::balancer::{BalReply, BalRequest, LoadBalancer, WorkloadParams};
pub use crate::client::{BalancerStub, ClientApiStub, ClientId};
pub use crate::protocols::{
    PeerMsg, ReplicaConfigTwoPhaseAq, TwoPhaseAqClient, TwoPhaseAqReplica,
};
pub use crate::rendezvous::{
    RendezvousReply, RendezvousRequest, RendezvousServer,
};
pub use crate::server::{
    Action, ApiReply, ApiRequest, Command, CommandResult, CommitEffect,
    GenericReplica, LeaderBookkeeping, QueryId, QueryRecord, ReplicaId,
    RequestId, ValueType, VersionRecord, VersionedKv, LEADER,
};
pub use crate::utils::{Bitmap, BiphaseError, Stopwatch, ValidatedConfig};
