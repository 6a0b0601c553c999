//! TwoPhaseAq -- client request entrance.

use super::*;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest, Command, CommandResult};
use crate::utils::BiphaseError;

// TwoPhaseAqReplica client requests entrance
impl<V: ValueType> TwoPhaseAqReplica<V> {
    /// Handler of client request batch chan recv.
    pub(super) fn handle_req_batch(
        &mut self,
        req_batch: Vec<(ClientId, ApiRequest<V>)>,
    ) -> Result<(), BiphaseError> {
        debug_assert!(!req_batch.is_empty());

        for (client, req) in req_batch {
            match req {
                ApiRequest::Req {
                    id,
                    cmd: Command::Get { key },
                } => self.handle_get(client, id, key)?,

                ApiRequest::Req {
                    id,
                    cmd: Command::Put { key, value },
                } => self.handle_put(client, id, key, value)?,

                ApiRequest::Req {
                    id,
                    cmd: Command::Remove { key },
                } => self.handle_remove(client, id, key)?,

                ApiRequest::Leave => {
                    self.external_api.send_reply(ApiReply::Leave, client)?;
                }
            }
        }
        Ok(())
    }

    /// Handler of client read. The leader answers from its committed state.
    /// A ready follower answers locally only while the key has no
    /// outstanding writes; otherwise (and while un-ready) the read is
    /// apportioned to the leader by ticket.
    fn handle_get(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        key: String,
    ) -> Result<(), BiphaseError> {
        let ready = self.ready.load(Ordering::SeqCst);
        if self.is_leader || (ready && self.versions.is_settled(&key)) {
            let value = self.versions.read_committed(&key);
            self.external_api.send_reply(
                ApiReply::Reply {
                    id: req_id,
                    result: Some(CommandResult::Get { value }),
                },
                client,
            )?;
            return Ok(());
        }

        // apportioned fallback: resolve against the leader
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending_reads.insert(ticket, (client, req_id));
        self.transport_hub
            .send_msg(PeerMsg::ReadFwd { key, ticket }, LEADER)?;
        pf_trace!(self.id; "read forwarded to leader, ticket {}", ticket);
        Ok(())
    }

    /// Handler of client put. Mutations on a follower are redirected to the
    /// leader; the client is acknowledged upon staging/redirect.
    fn handle_put(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        key: String,
        value: V,
    ) -> Result<(), BiphaseError> {
        if self.is_leader {
            self.stage_mutation(&key, value, Action::Put)?;
        } else {
            self.transport_hub.send_msg(
                PeerMsg::Redirect {
                    cmd: Command::Put { key, value },
                },
                LEADER,
            )?;
        }

        self.external_api.send_reply(
            ApiReply::Reply {
                id: req_id,
                result: Some(CommandResult::Put),
            },
            client,
        )?;
        Ok(())
    }

    /// Handler of client remove; same redirect rule as put.
    fn handle_remove(
        &mut self,
        client: ClientId,
        req_id: RequestId,
        key: String,
    ) -> Result<(), BiphaseError> {
        if self.is_leader {
            self.stage_mutation(&key, V::default(), Action::Remove)?;
        } else {
            self.transport_hub.send_msg(
                PeerMsg::Redirect {
                    cmd: Command::Remove { key },
                },
                LEADER,
            )?;
        }

        self.external_api.send_reply(
            ApiReply::Reply {
                id: req_id,
                result: Some(CommandResult::Remove),
            },
            client,
        )?;
        Ok(())
    }
}
