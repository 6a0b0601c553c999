//! Server internal TCP transport module implementation.
//!
//! NOTE: In concept, all messages are sent through unstable communication
//! channels, and are retried if the sender did not receive an ACK in a timely
//! manner. Here, we use TCP as the communication protocol to get the same
//! effect of "every message a sender wants to send will be retried until
//! eventually delivered"; the per-connection stream also preserves send
//! order, which the commit protocol relies on (a follower can never see a
//! commit before its stage).

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    BiphaseError,
};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peer-peer message wrapper type that includes leave notification variants.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
enum PeerMessage<Msg> {
    /// Normal protocol-specific message.
    Msg { msg: Msg },

    /// Server leave notification.
    Leave,

    /// Reply to leave notification.
    LeaveReply,
}

/// Server internal TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ReplicaId, PeerMessage<Msg>)>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends: flashmap::ReadHandle<
        ReplicaId,
        mpsc::UnboundedSender<PeerMessage<Msg>>,
    >,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ReplicaId, SocketAddr)>,

    /// Receiver side of the connack channel, used when proactively connecting
    /// to some peer. Carries whether the connection attempt succeeded.
    rx_connack: mpsc::UnboundedReceiver<(ReplicaId, bool)>,

    /// Sender side of the disconnect channel, used when proactively dropping
    /// a peer connection (leader-side cull).
    tx_disconnect: mpsc::UnboundedSender<ReplicaId>,

    /// Map from peer ID -> peer messenger task join handles, shared with
    /// the peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<ReplicaId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new server internal TCP transport hub. Spawns the peer
    /// acceptor task. Creates a recv channel for listening on peers'
    /// messages.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        p2p_addr: SocketAddr,
    ) -> Result<Self, BiphaseError> {
        let (tx_recv, rx_recv) =
            mpsc::unbounded_channel::<(ReplicaId, PeerMessage<Msg>)>();

        let (tx_sends_write, tx_sends_read) = flashmap::new::<
            ReplicaId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >();

        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<ReplicaId, JoinHandle<()>>();

        // the connect & connack channels are used to notify the peer acceptor
        // task to proactively connect to some peer; the disconnect channel to
        // proactively drop one
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();
        let (tx_disconnect, rx_disconnect) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = TransportHubAcceptorTask::new(
            me,
            tx_recv.clone(),
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
            rx_disconnect,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            tx_disconnect,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer replica proactively, and spawns the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        self.tx_connect
            .send((id, peer_addr))
            .map_err(BiphaseError::msg)?;
        match self.rx_connack.recv().await {
            Some((ack_id, ok)) => {
                if ack_id != id {
                    logged_err!(
                        self.me;
                        "peer ID mismatch: expected {}, got {}",
                        id,
                        ack_id
                    )
                } else if !ok {
                    logged_err!(self.me; "failed connecting to peer {}", id)
                } else {
                    Ok(())
                }
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Proactively drops the connection to a peer, if one exists. The
    /// messenger task exits once its send channel drains.
    pub(crate) fn disconnect_peer(
        &mut self,
        id: ReplicaId,
    ) -> Result<(), BiphaseError> {
        self.tx_disconnect.send(id).map_err(BiphaseError::msg)?;
        Ok(())
    }

    /// Returns true if a direct connection to given peer currently exists.
    pub(crate) fn is_connected(&self, id: ReplicaId) -> bool {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.contains_key(&id)
    }

    /// Sends a message to a specified peer by sending to the send channel.
    /// Missing peers are silently skipped; death is the failure detector's
    /// business.
    fn send_msg_inner(
        &mut self,
        msg: PeerMessage<Msg>,
        peer: ReplicaId,
    ) -> Result<(), BiphaseError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            tx_send.send(msg).map_err(BiphaseError::msg)?;
        }
        Ok(())
    }

    /// Sends a protocol message to a specified peer.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: ReplicaId,
    ) -> Result<(), BiphaseError> {
        self.send_msg_inner(PeerMessage::Msg { msg }, peer)
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ReplicaId, Msg), BiphaseError> {
        loop {
            match self.rx_recv.recv().await {
                Some((id, peer_msg)) => match peer_msg {
                    PeerMessage::Msg { msg } => return Ok((id, msg)),
                    // leave replies are informational only
                    _ => continue,
                },
                None => return logged_err!(self.me; "recv channel has been closed"),
            }
        }
    }

    /// Broadcasts leave notifications to all connected peers.
    pub(crate) fn leave(&mut self) -> Result<(), BiphaseError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(PeerMessage::Leave)
                .map_err(BiphaseError::msg)?;
        }
        Ok(())
    }
}

/// TransportHub peer acceptor task.
struct TransportHubAcceptorTask<Msg> {
    me: ReplicaId,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
    tx_sends: flashmap::WriteHandle<
        ReplicaId,
        mpsc::UnboundedSender<PeerMessage<Msg>>,
    >,

    peer_listener: TcpListener,
    peer_messenger_handles: flashmap::WriteHandle<ReplicaId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<(ReplicaId, bool)>,
    rx_disconnect: mpsc::UnboundedReceiver<ReplicaId>,

    /// Connection generation per peer ID; lets a stale messenger's exit
    /// notification be told apart from the replacement connection's.
    conn_gens: HashMap<ReplicaId, u64>,

    tx_exit: mpsc::UnboundedSender<(ReplicaId, u64)>,
    rx_exit: mpsc::UnboundedReceiver<(ReplicaId, u64)>,
}

impl<Msg> TransportHubAcceptorTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates the peer acceptor task.
    #[allow(clippy::too_many_arguments)]
    fn new(
        me: ReplicaId,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            ReplicaId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        peer_messenger_handles: flashmap::WriteHandle<
            ReplicaId,
            JoinHandle<()>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<(ReplicaId, bool)>,
        rx_disconnect: mpsc::UnboundedReceiver<ReplicaId>,
    ) -> Self {
        // create an exit mpsc channel for getting notified about termination
        // of peer messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        TransportHubAcceptorTask {
            me,
            tx_recv,
            peer_listener,
            tx_sends,
            peer_messenger_handles,
            rx_connect,
            tx_connack,
            rx_disconnect,
            conn_gens: HashMap::new(),
            tx_exit,
            rx_exit,
        }
    }

    /// Drops any stale entries of a peer ID about to be (re)connected and
    /// hands out the replacement connection's generation number.
    fn next_conn_gen(&mut self, id: ReplicaId) -> u64 {
        let mut tx_sends_guard = self.tx_sends.guard();
        if tx_sends_guard.contains_key(&id) {
            pf_debug!(self.me; "replacing stale connection of peer {}", id);
            tx_sends_guard.remove(id);
        }
        drop(tx_sends_guard);

        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            peer_messenger_handles_guard.remove(id);
        }
        drop(peer_messenger_handles_guard);

        let gen = self.conn_gens.entry(id).or_insert(0);
        *gen += 1;
        *gen
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: ReplicaId,
        conn_addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_u8(self.me).await?; // send my ID

        let gen = self.next_conn_gen(id);
        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        drop(tx_sends_guard);

        let mut messenger = TransportHubMessengerTask::new(
            self.me,
            id,
            gen,
            conn_addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let peer_messenger_handle =
            tokio::spawn(async move { messenger.run().await });
        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        let id = stream.read_u8().await; // receive peer's ID
        if let Err(e) = id {
            return logged_err!(self.me; "error receiving new peer ID: {}", e);
        }
        let id = id.unwrap();

        let gen = self.next_conn_gen(id);
        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        drop(tx_sends_guard);

        let mut messenger = TransportHubMessengerTask::new(
            self.me,
            id,
            gen,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let peer_messenger_handle =
            tokio::spawn(async move { messenger.run().await });
        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        pf_debug!(self.me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a left peer connection. Exit notifications from a
    /// messenger that has since been replaced are ignored; entries already
    /// dropped by a proactive disconnect are tolerated.
    fn remove_left_peer(&mut self, id: ReplicaId, gen: u64) {
        if self.conn_gens.get(&id) != Some(&gen) {
            pf_debug!(self.me; "ignoring stale exit of peer {} gen {}", id, gen);
            return;
        }
        self.conn_gens.remove(&id);

        let mut tx_sends_guard = self.tx_sends.guard();
        if tx_sends_guard.contains_key(&id) {
            tx_sends_guard.remove(id);
        }
        drop(tx_sends_guard);

        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            peer_messenger_handles_guard.remove(id);
        }
    }

    /// Drops the send channel of a peer, letting its messenger task run to
    /// completion of queued sends and exit.
    fn disconnect_peer(&mut self, id: ReplicaId) {
        let mut tx_sends_guard = self.tx_sends.guard();
        if tx_sends_guard.contains_key(&id) {
            tx_sends_guard.remove(id);
            pf_debug!(self.me; "disconnected peer {}", id);
        }
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_acceptor task spawned");

        let local_addr = self.peer_listener.local_addr().unwrap();
        pf_info!(self.me; "accepting peers on '{}'", local_addr);

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    if to_connect.is_none() {
                        pf_error!(self.me; "connect channel closed");
                        break; // channel gets closed and no messages remain
                    }
                    let (peer, conn_addr) = to_connect.unwrap();
                    let ok = match self.connect_new_peer(
                        peer,
                        conn_addr,
                    ).await {
                        Ok(()) => true,
                        Err(e) => {
                            pf_error!(self.me; "error connecting to new peer: {}", e);
                            false
                        },
                    };
                    if let Err(e) = self.tx_connack.send((peer, ok)) {
                        pf_error!(self.me; "error sending to tx_connack: {}", e);
                    }
                },

                // proactive disconnection request
                to_disconnect = self.rx_disconnect.recv() => {
                    if to_disconnect.is_none() {
                        pf_error!(self.me; "disconnect channel closed");
                        break;
                    }
                    self.disconnect_peer(to_disconnect.unwrap());
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!(self.me; "error accepting peer connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_peer(
                        stream,
                        addr,
                    ).await {
                        pf_error!(self.me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                exited = self.rx_exit.recv() => {
                    let (id, gen) = exited.unwrap();
                    self.remove_left_peer(id, gen);
                },
            }
        }
    }
}

/// TransportHub per-peer messenger task.
struct TransportHubMessengerTask<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Corresponding peer's ID.
    id: ReplicaId,
    /// Corresponding peer's address.
    addr: SocketAddr,
    /// This connection's generation number.
    gen: u64,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<(ReplicaId, u64)>,
}

// TransportHub peer_messenger task implementation
impl<Msg> TransportHubMessengerTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a per-peer messenger task.
    fn new(
        me: ReplicaId,
        id: ReplicaId,
        gen: u64,
        addr: SocketAddr,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
        tx_exit: mpsc::UnboundedSender<(ReplicaId, u64)>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        let read_buf = BytesMut::with_capacity(8 + 1024);
        let write_buf = BytesMut::with_capacity(8 + 1024);
        let write_buf_cursor = 0;
        let retrying = false;

        TransportHubMessengerTask {
            me,
            id,
            gen,
            addr,
            conn_read,
            conn_write,
            rx_send,
            read_buf,
            tx_recv,
            write_buf,
            write_buf_cursor,
            retrying,
            tx_exit,
        }
    }

    /// Writes a message through given TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&PeerMessage<Msg>>,
    ) -> Result<bool, BiphaseError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from given TcpStream.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_msg(
        // first 8 bytes being the message length, and the rest bytes being
        // the message itself
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<PeerMessage<Msg>, BiphaseError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(
            self.me;
            "peer_messenger task for {} '{}' spawned",
            self.id,
            self.addr
        );

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(PeerMessage::Leave) => {
                            // I decide to leave, notify peers
                            if Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&PeerMessage::Leave),
                            ).is_ok() {
                                // NOTE: skips `WouldBlock` error check here
                                pf_debug!(self.me; "sent leave notification -> {}", self.id);
                            }
                        },

                        Some(PeerMessage::LeaveReply) => {
                            pf_error!(self.me; "proactively sending LeaveReply msg");
                        },

                        Some(PeerMessage::Msg { .. }) => {
                            match Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(msg.as_ref().unwrap()),
                            ) {
                                Ok(true) => {
                                    // pf_trace!(self.me; "sent -> {} msg {:?}", self.id, msg);
                                }
                                Ok(false) => {
                                    pf_debug!(self.me; "should start retrying msg send -> {}", self.id);
                                    self.retrying = true;
                                }
                                Err(_e) => {
                                    // NOTE: commented out to prevent console
                                    //       lags during benchmarking
                                    // pf_error!(self.me; "error sending -> {}: {}", self.id, e);
                                }
                            }
                        },

                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_msg(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me; "finished retrying last msg send -> {}", self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(self.me; "still should retry last msg send -> {}", self.id);
                        }
                        Err(_e) => {
                            // NOTE: commented out to prevent console lags
                            //       during benchmarking
                            // pf_error!(self.me; "error retrying last msg send -> {}: {}", self.id, e);
                        }
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(PeerMessage::Leave) => {
                            // peer leaving, send dummy reply and break
                            if Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&PeerMessage::LeaveReply),
                            ).is_ok() {
                                // NOTE: skips `WouldBlock` error check here
                                pf_debug!(self.me; "peer {} has left", self.id);
                            }
                            break;
                        },

                        Ok(PeerMessage::LeaveReply) => {
                            // my leave notification is acked by peer, break
                            if let Err(e) = self.tx_recv.send((self.id, PeerMessage::LeaveReply)) {
                                pf_error!(self.me; "error sending to tx_recv for {}: {}", self.id, e);
                            }
                            break;
                        }

                        Ok(PeerMessage::Msg { .. }) => {
                            // pf_trace!(self.me; "recv <- {} msg {:?}", self.id, msg);
                            if let Err(e) = self.tx_recv.send((self.id, msg.unwrap())) {
                                pf_error!(self.me; "error sending to tx_recv for {}: {}", self.id, e);
                            }
                        },

                        Err(_e) => {
                            // NOTE: commented out to prevent console lags
                            //       during benchmarking
                            // pf_error!(self.me; "error receiving msg <- {}: {}", self.id, e);
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send((self.id, self.gen)) {
            pf_error!(self.me; "error sending exit signal for {}: {}", self.id, e);
        }
        pf_debug!(self.me; "peer_messenger task for {} '{}' exited",
                           self.id, self.addr);
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use tokio::time::{self, Duration};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_send_recv() -> Result<(), BiphaseError> {
        let barrier = Arc::new(Barrier::new(3));
        let barrier1 = barrier.clone();
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // replica 1
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, "127.0.0.1:31011".parse()?)
                    .await?;
            barrier1.wait().await;
            hub.connect_to_peer(2, "127.0.0.1:31012".parse()?).await?;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            // send a message to 0
            hub.send_msg(TestMsg("world".into()), 0)?;
            // recv another message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("nice".into()));
            // send another message to 0
            hub.send_msg(TestMsg("job!".into()), 0)?;
            // wait for termination message
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("terminate".into()));
            Ok::<(), BiphaseError>(())
        });
        tokio::spawn(async move {
            // replica 2
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(2, "127.0.0.1:31012".parse()?)
                    .await?;
            barrier2.wait().await;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("hello".into()));
            // send a message to 0
            hub.send_msg(TestMsg("world".into()), 0)?;
            // wait for termination message
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("terminate".into()));
            Ok::<(), BiphaseError>(())
        });
        // replica 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, "127.0.0.1:31010".parse()?).await?;
        barrier.wait().await;
        hub.connect_to_peer(1, "127.0.0.1:31011".parse()?).await?;
        hub.connect_to_peer(2, "127.0.0.1:31012".parse()?).await?;
        assert!(hub.is_connected(1));
        assert!(hub.is_connected(2));
        // send a message to 1 and 2
        hub.send_msg(TestMsg("hello".into()), 1)?;
        hub.send_msg(TestMsg("hello".into()), 2)?;
        // recv a message from both 1 and 2
        let (id, msg) = hub.recv_msg().await?;
        assert!(id == 1 || id == 2);
        assert_eq!(msg, TestMsg("world".into()));
        let (id, msg) = hub.recv_msg().await?;
        assert!(id == 1 || id == 2);
        assert_eq!(msg, TestMsg("world".into()));
        // send another message to 1 only
        hub.send_msg(TestMsg("nice".into()), 1)?;
        // recv another message from 1
        let (id, msg) = hub.recv_msg().await?;
        assert_eq!(id, 1);
        assert_eq!(msg, TestMsg("job!".into()));
        // send termination message to 1 and 2
        hub.send_msg(TestMsg("terminate".into()), 1)?;
        hub.send_msg(TestMsg("terminate".into()), 2)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_peer_leave() -> Result<(), BiphaseError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // replica 1, leaves and comes back as 2
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(1, "127.0.0.1:31111".parse()?)
                    .await?;
            barrier2.wait().await;
            // recv a message from 0
            let (id, msg) = hub.recv_msg().await?;
            assert_eq!(id, 0);
            assert_eq!(msg, TestMsg("goodbye".into()));
            // leave and come back as 2
            hub.leave()?;
            time::sleep(Duration::from_millis(100)).await;
            let mut hub: TransportHub<TestMsg> =
                TransportHub::new_and_setup(2, "127.0.0.1:31112".parse()?)
                    .await?;
            hub.connect_to_peer(0, "127.0.0.1:31110".parse()?).await?;
            // send a message to 0
            hub.send_msg(TestMsg("hello".into()), 0)?;
            Ok::<(), BiphaseError>(())
        });
        // replica 0
        let mut hub: TransportHub<TestMsg> =
            TransportHub::new_and_setup(0, "127.0.0.1:31110".parse()?).await?;
        barrier.wait().await;
        hub.connect_to_peer(1, "127.0.0.1:31111".parse()?).await?;
        assert!(hub.is_connected(1));
        // send a message to 1
        hub.send_msg(TestMsg("goodbye".into()), 1)?;
        // recv a message from 2
        let (id, msg) = hub.recv_msg().await?;
        assert_eq!(id, 2);
        assert_eq!(msg, TestMsg("hello".into()));
        assert!(hub.is_connected(2));
        Ok(())
    }
}
