//! Client API communication stub implementation.

use std::marker::PhantomData;
use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest, ValueType};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, BiphaseError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client API connection stub over an established server connection.
pub struct ClientApiStub<V> {
    /// My client ID.
    id: ClientId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Request write buffer for deadlock avoidance.
    req_buf: BytesMut,

    /// Request write buffer cursor at first unwritten byte.
    req_buf_cursor: usize,

    /// Reply read buffer for cancellation safety.
    reply_buf: BytesMut,

    _marker: PhantomData<V>,
}

impl<V: ValueType> ClientApiStub<V> {
    /// Connects to the given server address, sending my client ID as the
    /// opening handshake.
    pub async fn new_by_connect(
        id: ClientId,
        addr: SocketAddr,
    ) -> Result<Self, BiphaseError> {
        pf_debug!(id; "connecting to server '{}'...", addr);
        let mut stream = tcp_connect_with_retry(addr, 10).await?;
        stream.write_u64(id).await?; // send my client ID

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientApiStub {
            id,
            conn_read,
            conn_write,
            req_buf: BytesMut::with_capacity(8 + 1024),
            req_buf_cursor: 0,
            reply_buf: BytesMut::with_capacity(8 + 1024),
            _marker: PhantomData,
        })
    }

    /// Sends a request to the established server connection. Returns:
    ///   - `Ok(true)` if successful
    ///   - `Ok(false)` if socket full and may block; in this case, the input
    ///     request is saved and the next calls to `send_req()` must give arg
    ///     `req == None` to retry until successful (typically after doing a
    ///     few `recv_reply()`s to free up some buffer space)
    ///   - `Err(err)` if any unexpected error occurs
    pub fn send_req(
        &mut self,
        req: Option<&ApiRequest<V>>,
    ) -> Result<bool, BiphaseError> {
        let sent = safe_tcp_write(
            &mut self.req_buf,
            &mut self.req_buf_cursor,
            &self.conn_write,
            req,
        )?;
        if !sent {
            pf_debug!(self.id; "send_req would block; TCP buffer full?");
        }
        Ok(sent)
    }

    /// Receives a reply from the established server connection.
    pub async fn recv_reply(&mut self) -> Result<ApiReply<V>, BiphaseError> {
        safe_tcp_read(&mut self.reply_buf, &mut self.conn_read).await
    }

    /// Forgets about the TCP connection, consuming the stub. The write half
    /// is left open so in-flight requests still drain.
    pub fn forget(self) {
        self.conn_write.forget();
    }
}

// Exercised as the client side of the `server::external` module tests.
