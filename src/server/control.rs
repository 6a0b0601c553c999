//! Server-side stub for the startup rendezvous exchange.

use std::net::SocketAddr;

use crate::rendezvous::{RendezvousReply, RendezvousRequest};
use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, BiphaseError,
};

use bytes::BytesMut;

/// The rendezvous handshake stub. Contacts the rendezvous service exactly
/// once at startup, registering my peer-peer address and learning the
/// permanent leader's address plus my assigned replica ID.
pub struct RendezvousStub {
    /// My assigned replica ID.
    pub me: ReplicaId,

    /// The permanent leader's peer-peer address.
    pub leader: SocketAddr,
}

impl RendezvousStub {
    /// Connects to the rendezvous service, registers my address, and waits
    /// for the leader answer. The connection is dropped afterwards; the
    /// rendezvous service plays no further role.
    pub async fn new_and_register(
        rendezvous: SocketAddr,
        p2p_addr: SocketAddr,
    ) -> Result<Self, BiphaseError> {
        pf_debug!("s"; "contacting rendezvous '{}'...", rendezvous);
        let stream = tcp_connect_with_retry(rendezvous, 10).await?;
        let (mut conn_read, conn_write) = stream.into_split();

        let mut write_buf = BytesMut::with_capacity(8 + 64);
        let mut write_buf_cursor = 0;
        let req = RendezvousRequest::Register { p2p_addr };
        let mut sent = safe_tcp_write(
            &mut write_buf,
            &mut write_buf_cursor,
            &conn_write,
            Some(&req),
        )?;
        while !sent {
            conn_write.writable().await?;
            sent = safe_tcp_write::<RendezvousRequest, _>(
                &mut write_buf,
                &mut write_buf_cursor,
                &conn_write,
                None,
            )?;
        }

        let mut read_buf = BytesMut::with_capacity(8 + 64);
        let reply: RendezvousReply =
            safe_tcp_read(&mut read_buf, &mut conn_read).await?;
        let RendezvousReply::Leader { id, leader } = reply;
        pf_info!(id; "assigned replica ID {}, leader is '{}'", id, leader);

        Ok(RendezvousStub { me: id, leader })
    }
}

// Unit tests are done together with the `rendezvous` module.
