//! Generic replica trait implemented by the protocol-specific server struct.

use std::net::SocketAddr;

use crate::utils::BiphaseError;

use async_trait::async_trait;

use tokio::sync::watch;

/// Server replica ID type.
pub type ReplicaId = u8;

/// The rendezvous service hands out ids in registration order, so the
/// permanent leader always holds this id.
pub const LEADER: ReplicaId = 0;

/// Replica trait to be implemented by the protocol server struct.
#[async_trait]
pub trait GenericReplica {
    /// Creates a new replica module and sets up required functionality
    /// modules: contacts the rendezvous service, decides the node's role,
    /// and binds the client-facing and peer-facing listeners.
    async fn new_and_setup(
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        rendezvous: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, BiphaseError>
    where
        Self: Sized;

    /// Main event loop logic of running this replica. Returns only upon
    /// catching a termination signal.
    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), BiphaseError>;

    /// Gets my replica ID.
    fn id(&self) -> ReplicaId;
}
