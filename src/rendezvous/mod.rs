//! Rendezvous service: remembers the first node to register as the
//! permanent leader of the cluster and returns its address to every caller,
//! assigning replica ids in registration order.

use std::net::SocketAddr;

use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, BiphaseError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Request to the rendezvous service.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RendezvousRequest {
    /// New node up, advertising its peer-peer address.
    Register { p2p_addr: SocketAddr },
}

/// Reply from the rendezvous service.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RendezvousReply {
    /// The assigned replica ID and the permanent leader's address. A node
    /// seeing its own address here is the leader.
    Leader {
        id: ReplicaId,
        leader: SocketAddr,
    },
}

/// Standalone rendezvous server.
pub struct RendezvousServer {
    /// The permanent leader's address; fixed by the first registration.
    leader: Option<SocketAddr>,

    /// Next replica ID to assign.
    next_id: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(u64, RendezvousRequest)>,

    /// Map from connection ID -> sender side of its reply channel, shared
    /// with the acceptor task.
    tx_replies:
        flashmap::ReadHandle<u64, mpsc::UnboundedSender<RendezvousReply>>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl RendezvousServer {
    /// Creates a new rendezvous server and binds its listener.
    pub async fn new_and_setup(
        addr: SocketAddr,
    ) -> Result<Self, BiphaseError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<u64, mpsc::UnboundedSender<RendezvousReply>>();

        let listener = tcp_bind_with_retry(addr, 10).await?;
        let mut acceptor =
            RendezvousAcceptorTask::new(tx_req, listener, tx_replies_write);
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        Ok(RendezvousServer {
            leader: None,
            next_id: 0,
            rx_req,
            tx_replies: tx_replies_read,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Handles one registration: the first caller becomes the permanent
    /// leader; everyone learns the leader's address and their assigned ID.
    fn handle_register(
        &mut self,
        conn: u64,
        p2p_addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        if self.leader.is_none() {
            self.leader = Some(p2p_addr);
            pf_info!("r"; "leader elected: '{}'", p2p_addr);
        }
        let id = self.next_id;
        self.next_id += 1;

        let reply = RendezvousReply::Leader {
            id,
            leader: self.leader.unwrap(),
        };
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&conn) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(BiphaseError::msg)?;
                Ok(())
            }
            None => logged_err!("r"; "connection {} no longer active", conn),
        }
    }

    /// Main event loop of the rendezvous server.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), BiphaseError> {
        loop {
            tokio::select! {
                // node registration
                req = self.rx_req.recv() => {
                    match req {
                        Some((conn, RendezvousRequest::Register { p2p_addr })) => {
                            if let Err(e) = self.handle_register(conn, p2p_addr) {
                                pf_error!("r"; "error handling register: {}", e);
                            }
                        },
                        None => {
                            return logged_err!("r"; "req channel has been closed");
                        },
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("r"; "rendezvous caught termination signal");
                    return Ok(());
                }
            }
        }
    }
}

/// RendezvousServer connection acceptor task.
struct RendezvousAcceptorTask {
    tx_req: mpsc::UnboundedSender<(u64, RendezvousRequest)>,
    listener: TcpListener,
    tx_replies:
        flashmap::WriteHandle<u64, mpsc::UnboundedSender<RendezvousReply>>,

    next_conn: u64,
    tx_exit: mpsc::UnboundedSender<u64>,
    rx_exit: mpsc::UnboundedReceiver<u64>,
}

impl RendezvousAcceptorTask {
    fn new(
        tx_req: mpsc::UnboundedSender<(u64, RendezvousRequest)>,
        listener: TcpListener,
        tx_replies: flashmap::WriteHandle<
            u64,
            mpsc::UnboundedSender<RendezvousReply>,
        >,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();
        RendezvousAcceptorTask {
            tx_req,
            listener,
            tx_replies,
            next_conn: 0,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new node connection, numbering it internally.
    fn accept_new_conn(&mut self, stream: TcpStream) {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut tx_replies_guard = self.tx_replies.guard();
        tx_replies_guard.insert(conn, tx_reply);

        let mut servant = RendezvousServantTask::new(
            conn,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { servant.run().await });
        pf_debug!("r"; "accepted node conn {}", conn);
    }

    async fn run(&mut self) {
        pf_debug!("r"; "rendezvous acceptor task spawned");

        let local_addr = self.listener.local_addr().unwrap();
        pf_info!("r"; "accepting nodes on '{}'", local_addr);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept_new_conn(stream),
                        Err(e) => {
                            pf_warn!("r"; "error accepting connection: {}", e);
                        },
                    }
                },

                conn = self.rx_exit.recv() => {
                    let conn = conn.unwrap();
                    let mut tx_replies_guard = self.tx_replies.guard();
                    if tx_replies_guard.contains_key(&conn) {
                        tx_replies_guard.remove(conn);
                    }
                },
            }
        }
    }
}

/// RendezvousServer per-connection servant task.
struct RendezvousServantTask {
    conn: u64,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_req: mpsc::UnboundedSender<(u64, RendezvousRequest)>,
    read_buf: BytesMut,

    rx_reply: mpsc::UnboundedReceiver<RendezvousReply>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<u64>,
}

impl RendezvousServantTask {
    /// Creates a per-connection servant task.
    fn new(
        conn: u64,
        stream: TcpStream,
        tx_req: mpsc::UnboundedSender<(u64, RendezvousRequest)>,
        rx_reply: mpsc::UnboundedReceiver<RendezvousReply>,
        tx_exit: mpsc::UnboundedSender<u64>,
    ) -> Self {
        let (conn_read, conn_write) = stream.into_split();
        RendezvousServantTask {
            conn,
            conn_read,
            conn_write,
            tx_req,
            read_buf: BytesMut::with_capacity(8 + 64),
            rx_reply,
            write_buf: BytesMut::with_capacity(8 + 64),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Writes a reply through given TcpStream.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&RendezvousReply>,
    ) -> Result<bool, BiphaseError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Reads a request from given TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<RendezvousRequest, BiphaseError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                reply = self.rx_reply.recv(), if !self.retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {}
                                Ok(false) => self.retrying = true,
                                Err(_e) => {}
                            }
                        },
                        None => break,
                    }
                },

                _ = self.conn_write.writable(), if self.retrying => {
                    if let Ok(true) = Self::write_reply(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        self.retrying = false;
                    }
                },

                req = Self::read_req(&mut self.read_buf, &mut self.conn_read) => {
                    match req {
                        Ok(req) => {
                            if let Err(e) = self.tx_req.send((self.conn, req)) {
                                pf_error!("r"; "error sending to tx_req: {}", e);
                            }
                        },
                        Err(_e) => break,
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.conn) {
            pf_error!("r"; "error sending exit signal: {}", e);
        }
    }
}

#[cfg(test)]
mod rendezvous_tests {
    use super::*;
    use crate::server::RendezvousStub;
    use tokio::sync::watch;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_register_wins() -> Result<(), BiphaseError> {
        let (_tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let mut server =
                RendezvousServer::new_and_setup("127.0.0.1:32600".parse()?)
                    .await?;
            server.run(rx_term).await
        });

        let first = RendezvousStub::new_and_register(
            "127.0.0.1:32600".parse()?,
            "10.0.0.1:52800".parse()?,
        )
        .await?;
        assert_eq!(first.me, 0);
        assert_eq!(first.leader, "10.0.0.1:52800".parse()?);

        // later registrants get fresh ids but the same leader
        let second = RendezvousStub::new_and_register(
            "127.0.0.1:32600".parse()?,
            "10.0.0.2:52800".parse()?,
        )
        .await?;
        assert_eq!(second.me, 1);
        assert_eq!(second.leader, "10.0.0.1:52800".parse()?);

        let third = RendezvousStub::new_and_register(
            "127.0.0.1:32600".parse()?,
            "10.0.0.3:52800".parse()?,
        )
        .await?;
        assert_eq!(third.me, 2);
        assert_eq!(third.leader, "10.0.0.1:52800".parse()?);
        Ok(())
    }
}
