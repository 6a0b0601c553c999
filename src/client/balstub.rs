//! Client-side stub for querying the load-balancer front end.

use std::net::SocketAddr;

use crate::balancer::{BalReply, BalRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, BiphaseError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Load-balancer connection stub; simple blocking call/reply style.
pub struct BalancerStub {
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
}

impl BalancerStub {
    /// Connects to the given load-balancer address.
    pub async fn new_by_connect(
        addr: SocketAddr,
    ) -> Result<Self, BiphaseError> {
        pf_debug!("c"; "connecting to balancer '{}'...", addr);
        let stream = tcp_connect_with_retry(addr, 10).await?;
        let (conn_read, conn_write) = stream.into_split();

        Ok(BalancerStub {
            conn_read,
            conn_write,
            req_buf: BytesMut::with_capacity(8 + 128),
            req_buf_cursor: 0,
            reply_buf: BytesMut::with_capacity(8 + 128),
        })
    }

    /// Makes one request to the balancer and waits for its reply.
    pub async fn call(
        &mut self,
        req: BalRequest,
    ) -> Result<BalReply, BiphaseError> {
        let mut sent = safe_tcp_write(
            &mut self.req_buf,
            &mut self.req_buf_cursor,
            &self.conn_write,
            Some(&req),
        )?;
        while !sent {
            self.conn_write.writable().await?;
            sent = safe_tcp_write::<BalRequest, _>(
                &mut self.req_buf,
                &mut self.req_buf_cursor,
                &self.conn_write,
                None,
            )?;
        }

        safe_tcp_read(&mut self.reply_buf, &mut self.conn_read).await
    }
}

// Exercised as the client side of the `balancer` module tests.
