//! Load-balancer front end: picks the least-loaded backend from a static
//! list and hands out the configured workload parameters. Opaque to the
//! commit protocol.

use std::net::SocketAddr;

use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, BiphaseError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Request to the load balancer.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum BalRequest {
    /// Pick the least-used backend, crediting back the one currently held.
    ChooseNode { current: Option<SocketAddr> },

    /// Configured fraction of put operations.
    GetPutPercent,

    /// Configured fraction of remove operations.
    GetRemPercent,

    /// Configured size of generated values in bytes.
    GetSize,
}

/// Reply from the load balancer.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum BalReply {
    ChooseNode { node: SocketAddr },
    PutPercent { percent: f64 },
    RemPercent { percent: f64 },
    Size { size: u64 },
}

/// Workload parameters handed out to benchmarking clients.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct WorkloadParams {
    /// Fraction of put operations, in [0, 1].
    pub put_percent: f64,

    /// Fraction of remove operations; put + rem must be <= 1.
    pub rem_percent: f64,

    /// Size of generated values in bytes.
    pub data_size: u64,
}

/// Picks the least-used backend not equal to `current`, adjusting the use
/// counts. With a single backend there is no choice to make.
fn choose_backend(
    backends: &[SocketAddr],
    used: &mut [u64],
    current: Option<SocketAddr>,
) -> SocketAddr {
    debug_assert_eq!(backends.len(), used.len());
    if backends.len() == 1 {
        return backends[0];
    }

    let curr = current.and_then(|c| backends.iter().position(|&b| b == c));
    if let Some(ci) = curr {
        used[ci] = used[ci].saturating_sub(1);
    }

    let mut min_i = 0;
    let mut min = u64::MAX;
    for (i, &cnt) in used.iter().enumerate() {
        if Some(i) == curr {
            continue;
        }
        if cnt < min {
            min = cnt;
            min_i = i;
        }
    }
    used[min_i] += 1;
    backends[min_i]
}

/// Standalone load-balancer server.
pub struct LoadBalancer {
    /// Static list of backend addresses.
    backends: Vec<SocketAddr>,

    /// Per-backend use counts.
    used: Vec<u64>,

    /// Workload parameters read from stdin at startup.
    params: WorkloadParams,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(u64, BalRequest)>,

    /// Map from connection ID -> sender side of its reply channel, shared
    /// with the acceptor task.
    tx_replies: flashmap::ReadHandle<u64, mpsc::UnboundedSender<BalReply>>,

    /// Join handle of the acceptor task.
    _acceptor_handle: JoinHandle<()>,
}

impl LoadBalancer {
    /// Creates a new load balancer and binds its listener.
    pub async fn new_and_setup(
        addr: SocketAddr,
        params: WorkloadParams,
        backends: Vec<SocketAddr>,
    ) -> Result<Self, BiphaseError> {
        if !(0.0..=1.0).contains(&params.put_percent) {
            return logged_err!("b"; "invalid put_percent {}", params.put_percent);
        }
        if params.rem_percent < 0.0
            || params.put_percent + params.rem_percent > 1.0
        {
            return logged_err!("b"; "invalid rem_percent {}", params.rem_percent);
        }
        if backends.is_empty() {
            return logged_err!("b"; "empty backends list");
        }

        let (tx_req, rx_req) = mpsc::unbounded_channel();
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<u64, mpsc::UnboundedSender<BalReply>>();

        let listener = tcp_bind_with_retry(addr, 10).await?;
        let mut acceptor =
            BalancerAcceptorTask::new(tx_req, listener, tx_replies_write);
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        let used = vec![0; backends.len()];
        Ok(LoadBalancer {
            backends,
            used,
            params,
            rx_req,
            tx_replies: tx_replies_read,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// Handles one client request.
    fn handle_req(&mut self, conn: u64, req: BalRequest) -> Result<(), BiphaseError> {
        let reply = match req {
            BalRequest::ChooseNode { current } => BalReply::ChooseNode {
                node: choose_backend(&self.backends, &mut self.used, current),
            },
            BalRequest::GetPutPercent => BalReply::PutPercent {
                percent: self.params.put_percent,
            },
            BalRequest::GetRemPercent => BalReply::RemPercent {
                percent: self.params.rem_percent,
            },
            BalRequest::GetSize => BalReply::Size {
                size: self.params.data_size,
            },
        };

        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&conn) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(BiphaseError::msg)?;
                Ok(())
            }
            None => logged_err!("b"; "connection {} no longer active", conn),
        }
    }

    /// Main event loop of the load balancer.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), BiphaseError> {
        pf_info!("b"; "started load balancer with {} backends",
                      self.backends.len());
        loop {
            tokio::select! {
                // client request
                req = self.rx_req.recv() => {
                    match req {
                        Some((conn, req)) => {
                            if let Err(e) = self.handle_req(conn, req) {
                                pf_error!("b"; "error handling request: {}", e);
                            }
                        },
                        None => {
                            return logged_err!("b"; "req channel has been closed");
                        },
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("b"; "balancer caught termination signal");
                    return Ok(());
                }
            }
        }
    }
}

/// LoadBalancer connection acceptor task.
struct BalancerAcceptorTask {
    tx_req: mpsc::UnboundedSender<(u64, BalRequest)>,
    listener: TcpListener,
    tx_replies: flashmap::WriteHandle<u64, mpsc::UnboundedSender<BalReply>>,

    next_conn: u64,
    tx_exit: mpsc::UnboundedSender<u64>,
    rx_exit: mpsc::UnboundedReceiver<u64>,
}

impl BalancerAcceptorTask {
    fn new(
        tx_req: mpsc::UnboundedSender<(u64, BalRequest)>,
        listener: TcpListener,
        tx_replies: flashmap::WriteHandle<u64, mpsc::UnboundedSender<BalReply>>,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();
        BalancerAcceptorTask {
            tx_req,
            listener,
            tx_replies,
            next_conn: 0,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection, numbering it internally.
    fn accept_new_conn(&mut self, stream: TcpStream) {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut tx_replies_guard = self.tx_replies.guard();
        tx_replies_guard.insert(conn, tx_reply);

        let mut servant = BalancerServantTask::new(
            conn,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { servant.run().await });
        pf_debug!("b"; "accepted balancer client conn {}", conn);
    }

    async fn run(&mut self) {
        pf_debug!("b"; "balancer acceptor task spawned");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.accept_new_conn(stream),
                        Err(e) => {
                            pf_warn!("b"; "error accepting connection: {}", e);
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

/// LoadBalancer per-connection servant task.
struct BalancerServantTask {
    conn: u64,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_req: mpsc::UnboundedSender<(u64, BalRequest)>,
    read_buf: BytesMut,

    rx_reply: mpsc::UnboundedReceiver<BalReply>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<u64>,
}

impl BalancerServantTask {
    /// Creates a per-connection servant task.
    fn new(
        conn: u64,
        stream: TcpStream,
        tx_req: mpsc::UnboundedSender<(u64, BalRequest)>,
        rx_reply: mpsc::UnboundedReceiver<BalReply>,
        tx_exit: mpsc::UnboundedSender<u64>,
    ) -> Self {
        let (conn_read, conn_write) = stream.into_split();
        BalancerServantTask {
            conn,
            conn_read,
            conn_write,
            tx_req,
            read_buf: BytesMut::with_capacity(8 + 128),
            rx_reply,
            write_buf: BytesMut::with_capacity(8 + 128),
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
        reply: Option<&BalReply>,
    ) -> Result<bool, BiphaseError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Reads a request from given TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<BalRequest, BiphaseError> {
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
                                pf_error!("b"; "error sending to tx_req: {}", e);
                            }
                        },
                        Err(_e) => break,
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.conn) {
            pf_error!("b"; "error sending exit signal: {}", e);
        }
    }
}

#[cfg(test)]
mod balancer_tests {
    use super::*;
    use crate::client::BalancerStub;
    use tokio::sync::watch;

    #[test]
    fn choose_least_used() {
        let backends: Vec<SocketAddr> = vec![
            "10.0.0.1:52700".parse().unwrap(),
            "10.0.0.2:52700".parse().unwrap(),
            "10.0.0.3:52700".parse().unwrap(),
        ];
        let mut used = vec![0u64; 3];

        // fresh counts: lowest index wins ties
        assert_eq!(choose_backend(&backends, &mut used, None), backends[0]);
        assert_eq!(choose_backend(&backends, &mut used, None), backends[1]);
        assert_eq!(choose_backend(&backends, &mut used, None), backends[2]);
        assert_eq!(used, vec![1, 1, 1]);

        // switching away from backend 0 credits it back but never returns it
        assert_eq!(
            choose_backend(&backends, &mut used, Some(backends[0])),
            backends[1]
        );
        assert_eq!(used, vec![0, 2, 1]);
    }

    #[test]
    fn choose_single_backend() {
        let backends: Vec<SocketAddr> =
            vec!["10.0.0.1:52700".parse().unwrap()];
        let mut used = vec![5u64];
        assert_eq!(
            choose_backend(&backends, &mut used, Some(backends[0])),
            backends[0]
        );
        assert_eq!(used, vec![5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_choose_and_params() -> Result<(), BiphaseError> {
        let backends: Vec<SocketAddr> = vec![
            "10.0.0.1:52700".parse()?,
            "10.0.0.2:52700".parse()?,
        ];
        let backends2 = backends.clone();
        let (_tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let mut balancer = LoadBalancer::new_and_setup(
                "127.0.0.1:32500".parse()?,
                WorkloadParams {
                    put_percent: 0.1,
                    rem_percent: 0.05,
                    data_size: 500,
                },
                backends2,
            )
            .await?;
            balancer.run(rx_term).await
        });

        let mut stub =
            BalancerStub::new_by_connect("127.0.0.1:32500".parse()?).await?;
        assert_eq!(
            stub.call(BalRequest::GetPutPercent).await?,
            BalReply::PutPercent { percent: 0.1 }
        );
        assert_eq!(
            stub.call(BalRequest::GetRemPercent).await?,
            BalReply::RemPercent { percent: 0.05 }
        );
        assert_eq!(
            stub.call(BalRequest::GetSize).await?,
            BalReply::Size { size: 500 }
        );
        assert_eq!(
            stub.call(BalRequest::ChooseNode { current: None }).await?,
            BalReply::ChooseNode { node: backends[0] }
        );
        assert_eq!(
            stub.call(BalRequest::ChooseNode {
                current: Some(backends[0])
            })
            .await?,
            BalReply::ChooseNode { node: backends[1] }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_params() {
        assert!(LoadBalancer::new_and_setup(
            "127.0.0.1:32501".parse().unwrap(),
            WorkloadParams {
                put_percent: 0.9,
                rem_percent: 0.2,
                data_size: 1,
            },
            vec!["10.0.0.1:52700".parse().unwrap()],
        )
        .await
        .is_err());
    }
}
