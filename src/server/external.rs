//! Server external client-facing API module implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClientId;
use crate::server::{Command, CommandResult, ReplicaId, ValueType};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, BiphaseError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// External API request ID type.
pub type RequestId = u64;

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest<V> {
    /// Regular request around a command.
    Req {
        /// Client request ID.
        id: RequestId,

        /// Command to the key-value state.
        cmd: Command<V>,
    },

    /// Client leave notification.
    Leave,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply<V> {
    /// Reply to a regular request.
    Reply {
        /// ID of the corresponding client request.
        id: RequestId,

        /// Command result; `None` means the request was dropped.
        result: Option<CommandResult<V>>,
    },

    /// Reply to a client leave notification.
    Leave,
}

/// The external client-facing API module.
pub(crate) struct ExternalApi<V> {
    /// My replica ID.
    me: ReplicaId,

    /// Maximum number of requests to pick out per batch.
    max_batch_size: usize,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest<V>)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply<V>>>,

    /// Notify used as batch dumping signal, shared with the batch ticker
    /// task.
    batch_notify: Arc<Notify>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Map from client ID -> client servant task join handles, shared with
    /// the client acceptor task.
    _client_servant_handles: flashmap::ReadHandle<ClientId, JoinHandle<()>>,

    /// Join handle of the batch ticker task.
    _batch_ticker_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl<V: ValueType> ExternalApi<V> {
    /// Creates a new external API module. Spawns the client acceptor task
    /// and the batch ticker task. Creates a req channel for buffering
    /// incoming client requests.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
        batch_interval: Duration,
        max_batch_size: usize,
    ) -> Result<Self, BiphaseError> {
        if batch_interval < Duration::from_micros(1) {
            return logged_err!(
                me;
                "batch_interval {:?} too small",
                batch_interval
            );
        }
        if max_batch_size == 0 {
            return logged_err!(me; "invalid max_batch_size {}", max_batch_size);
        }

        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) = flashmap::new::<
            ClientId,
            mpsc::UnboundedSender<ApiReply<V>>,
        >();

        let (client_servant_handles_write, client_servant_handles_read) =
            flashmap::new::<ClientId, JoinHandle<()>>();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let mut acceptor = ExternalApiAcceptorTask::new(
            me,
            tx_req,
            client_listener,
            tx_replies_write,
            client_servant_handles_write,
        );
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        let batch_notify = Arc::new(Notify::new());
        let batch_notify_ref = batch_notify.clone();
        let batch_ticker_handle = tokio::spawn(Self::batch_ticker_task(
            me,
            batch_interval,
            batch_notify_ref,
        ));

        Ok(ExternalApi {
            me,
            max_batch_size,
            rx_req,
            tx_replies: tx_replies_read,
            batch_notify,
            _client_acceptor_handle: client_acceptor_handle,
            _client_servant_handles: client_servant_handles_read,
            _batch_ticker_handle: batch_ticker_handle,
        })
    }

    /// Waits for the next batch dumping signal and collects all requests
    /// currently in the req channel, up to `max_batch_size`. Returns a
    /// non-empty `Vec` of requests on success.
    pub(crate) async fn get_req_batch(
        &mut self,
    ) -> Result<Vec<(ClientId, ApiRequest<V>)>, BiphaseError> {
        let mut batch = Vec::with_capacity(self.max_batch_size);

        while batch.is_empty() {
            self.batch_notify.notified().await;

            while batch.len() < self.max_batch_size {
                match self.rx_req.try_recv() {
                    Ok((client, req)) => batch.push((client, req)),
                    Err(TryRecvError::Empty) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(batch)
    }

    /// Sends a reply back to client by sending to its reply channel.
    pub(crate) fn send_reply(
        &mut self,
        reply: ApiReply<V>,
        client: ClientId,
    ) -> Result<(), BiphaseError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(BiphaseError::msg)?;
                Ok(())
            }
            None => {
                logged_err!(
                    self.me;
                    "client ID {} not found among active clients",
                    client
                )
            }
        }
    }
}

// ExternalApi batch_ticker task implementation
impl<V: ValueType> ExternalApi<V> {
    /// Batch ticker task function.
    async fn batch_ticker_task(
        _me: ReplicaId,
        batch_interval: Duration,
        batch_notify: Arc<Notify>,
    ) {
        let mut interval = time::interval(batch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            batch_notify.notify_one();
        }
    }
}

/// ExternalApi client acceptor task.
struct ExternalApiAcceptorTask<V> {
    me: ReplicaId,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest<V>)>,
    client_listener: TcpListener,

    tx_replies:
        flashmap::WriteHandle<ClientId, mpsc::UnboundedSender<ApiReply<V>>>,
    client_servant_handles: flashmap::WriteHandle<ClientId, JoinHandle<()>>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl<V: ValueType> ExternalApiAcceptorTask<V> {
    /// Creates the client acceptor task.
    fn new(
        me: ReplicaId,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest<V>)>,
        client_listener: TcpListener,
        tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply<V>>,
        >,
        client_servant_handles: flashmap::WriteHandle<ClientId, JoinHandle<()>>,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        ExternalApiAcceptorTask {
            me,
            tx_req,
            client_listener,
            tx_replies,
            client_servant_handles,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection.
    async fn accept_new_client(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BiphaseError> {
        let id = stream.read_u64().await; // receive client ID
        if let Err(e) = id {
            return logged_err!(self.me; "error receiving new client ID: {}", e);
        }
        let id = id.unwrap();

        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate client ID listened: {}", id);
        }
        pf_debug!(self.me; "accepted new client {} '{}'", id, addr);

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply);

        let mut servant = ExternalApiServantTask::new(
            self.me,
            id,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        let client_servant_handle =
            tokio::spawn(async move { servant.run().await });
        let mut client_servant_handles_guard =
            self.client_servant_handles.guard();
        client_servant_handles_guard.insert(id, client_servant_handle);

        Ok(())
    }

    /// Removes handles of a left client connection.
    fn remove_left_client(&mut self, id: ClientId) {
        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            tx_replies_guard.remove(id);
        }

        let mut client_servant_handles_guard =
            self.client_servant_handles.guard();
        if client_servant_handles_guard.contains_key(&id) {
            client_servant_handles_guard.remove(id);
        }
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_acceptor task spawned");

        let local_addr = self.client_listener.local_addr().unwrap();
        pf_info!(self.me; "accepting clients on '{}'", local_addr);

        loop {
            tokio::select! {
                // new client connection accepted
                accepted = self.client_listener.accept() => {
                    if let Err(e) = accepted {
                        pf_warn!(self.me; "error accepting client connection: {}", e);
                        continue;
                    }
                    let (stream, addr) = accepted.unwrap();
                    if let Err(e) = self.accept_new_client(
                        stream,
                        addr,
                    ).await {
                        pf_error!(self.me; "error accepting new client: {}", e);
                    }
                },

                // a client servant task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    self.remove_left_client(id);
                },
            }
        }
    }
}

/// ExternalApi per-client servant task.
struct ExternalApiServantTask<V> {
    me: ReplicaId,

    /// Corresponding client's ID.
    id: ClientId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest<V>)>,
    read_buf: BytesMut,

    rx_reply: mpsc::UnboundedReceiver<ApiReply<V>>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl<V: ValueType> ExternalApiServantTask<V> {
    /// Creates a per-client servant task.
    fn new(
        me: ReplicaId,
        id: ClientId,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest<V>)>,
        rx_reply: mpsc::UnboundedReceiver<ApiReply<V>>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        ExternalApiServantTask {
            me,
            id,
            conn_read,
            conn_write,
            tx_req,
            read_buf: BytesMut::with_capacity(8 + 1024),
            rx_reply,
            write_buf: BytesMut::with_capacity(8 + 1024),
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
        reply: Option<&ApiReply<V>>,
    ) -> Result<bool, BiphaseError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Reads a client request from given TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<ApiRequest<V>, BiphaseError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-client servant task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_servant task for {} spawned", self.id);

        loop {
            tokio::select! {
                // select between getting a new reply to send back and
                // receiving new client request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = self.rx_reply.recv(), if !self.retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {
                                    // pf_trace!(self.me; "replied -> {} reply {:?}", self.id, reply);
                                }
                                Ok(false) => {
                                    self.retrying = true;
                                }
                                Err(_e) => {
                                    // connection likely tearing down
                                }
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // retrying last unsuccessful reply send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_reply(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => {}
                    }
                },

                // receives client request
                req = Self::read_req(&mut self.read_buf, &mut self.conn_read) => {
                    match req {
                        Ok(req) => {
                            // pf_trace!(self.me; "request <- {} req {:?}", self.id, req);
                            if let Err(e) = self.tx_req.send((self.id, req)) {
                                pf_error!(
                                    self.me;
                                    "error sending to tx_req for {}: {}",
                                    self.id, e
                                );
                            }
                        },
                        Err(_e) => {
                            break; // probably the client exited ungracefully
                        }
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                               self.id, e);
        }
        pf_debug!(self.me; "client_servant task for {} exited", self.id);
    }
}

#[cfg(test)]
mod external_tests {
    use super::*;
    use crate::client::ClientApiStub;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_req_reply() -> Result<(), BiphaseError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server-side
            let mut api: ExternalApi<String> = ExternalApi::new_and_setup(
                0,
                "127.0.0.1:31700".parse()?,
                Duration::from_millis(1),
                100,
            )
            .await?;
            barrier2.wait().await;

            let mut reqs = vec![];
            while reqs.len() < 2 {
                reqs.append(&mut api.get_req_batch().await?);
            }
            let client = reqs[0].0;
            assert_eq!(
                reqs[0].1,
                ApiRequest::Req {
                    id: 0,
                    cmd: Command::Put {
                        key: "Jose".into(),
                        value: "123".into(),
                    },
                }
            );
            assert_eq!(
                reqs[1].1,
                ApiRequest::Req {
                    id: 1,
                    cmd: Command::Get { key: "Jose".into() },
                }
            );
            api.send_reply(
                ApiReply::Reply {
                    id: 0,
                    result: Some(CommandResult::Put),
                },
                client,
            )?;
            api.send_reply(
                ApiReply::Reply {
                    id: 1,
                    result: Some(CommandResult::Get {
                        value: "123".into(),
                    }),
                },
                client,
            )?;
            Ok::<(), BiphaseError>(())
        });

        // client-side
        barrier.wait().await;
        let mut api_stub: ClientApiStub<String> =
            ClientApiStub::new_by_connect(2857, "127.0.0.1:31700".parse()?)
                .await?;
        let mut sent = api_stub.send_req(Some(&ApiRequest::Req {
            id: 0,
            cmd: Command::Put {
                key: "Jose".into(),
                value: "123".into(),
            },
        }))?;
        while !sent {
            sent = api_stub.send_req(None)?;
        }
        let mut sent = api_stub.send_req(Some(&ApiRequest::Req {
            id: 1,
            cmd: Command::Get { key: "Jose".into() },
        }))?;
        while !sent {
            sent = api_stub.send_req(None)?;
        }
        assert_eq!(
            api_stub.recv_reply().await?,
            ApiReply::Reply {
                id: 0,
                result: Some(CommandResult::Put),
            }
        );
        assert_eq!(
            api_stub.recv_reply().await?,
            ApiReply::Reply {
                id: 1,
                result: Some(CommandResult::Get {
                    value: "123".into()
                }),
            }
        );
        Ok(())
    }
}
