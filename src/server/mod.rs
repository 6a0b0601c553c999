//! Server functionality modules and trait.

mod control;
mod external;
mod heartbeat;
mod replica;
mod transport;
mod versions;

pub use external::{ApiReply, ApiRequest, RequestId};
pub use replica::{GenericReplica, ReplicaId, LEADER};
pub use versions::{
    Action, Command, CommandResult, CommitEffect, LeaderBookkeeping, QueryId,
    QueryRecord, ValueType, VersionRecord, VersionedKv,
};

pub(crate) use control::RendezvousStub;
pub(crate) use external::ExternalApi;
pub(crate) use heartbeat::Heartbeater;
pub(crate) use transport::TransportHub;
