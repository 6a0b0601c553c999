//! Replication protocol: two-phase commit with apportioned queries.
//!
//! All mutations funnel through the permanent leader, which stages them to
//! every follower and commits once all acknowledgments (or compensating
//! culls) arrive. Reads on followers are served locally while the key has no
//! outstanding writes and otherwise resolved by the leader.

mod failure;
mod joining;
mod messages;
mod request;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::{ClientApiStub, ClientId};
use crate::server::{
    Action, ApiReply, ApiRequest, Command, CommandResult, ExternalApi,
    GenericReplica, Heartbeater, LeaderBookkeeping, QueryId, RendezvousStub,
    ReplicaId, RequestId, TransportHub, ValueType, VersionedKv, LEADER,
};
use crate::utils::{BiphaseError, Stopwatch, ValidatedConfig};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::watch;
use tokio::time::{self, Duration, Sleep};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigTwoPhaseAq {
    /// Client request batching interval in millisecs.
    pub batch_interval_ms: u64,

    /// Client request batching maximum batch size.
    pub max_batch_size: usize,

    /// Heartbeat period in millisecs; also the cull window on the leader
    /// and the pulse inspection period on followers.
    pub alive_interval_ms: u64,

    /// Deadline for the leader's answer to a membership check, in millisecs.
    pub check_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigTwoPhaseAq {
    fn default() -> Self {
        ReplicaConfigTwoPhaseAq {
            batch_interval_ms: 1,
            max_batch_size: 5000,
            alive_interval_ms: 5000,
            check_timeout_ms: 2500,
        }
    }
}

impl ValidatedConfig for ReplicaConfigTwoPhaseAq {
    fn validate(&self) -> Result<(), BiphaseError> {
        if self.batch_interval_ms == 0 {
            Err(BiphaseError(format!(
                "invalid batch_interval_ms '{}'",
                self.batch_interval_ms
            )))
        } else if self.alive_interval_ms < 100 {
            Err(BiphaseError(format!(
                "invalid alive_interval_ms '{}'",
                self.alive_interval_ms
            )))
        } else if self.check_timeout_ms == 0
            || self.check_timeout_ms >= self.alive_interval_ms
        {
            // the membership check must resolve within the same period
            Err(BiphaseError(format!(
                "check_timeout_ms '{}' does not fit period '{}'",
                self.check_timeout_ms, self.alive_interval_ms
            )))
        } else {
            Ok(())
        }
    }
}

/// Peer-peer message type.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum PeerMsg<V> {
    /// Leader -> follower: proposal of a new version of a key. `slot` is the
    /// receiver's index in the leader's follower vector.
    Stage {
        key: String,
        value: V,
        action: Action,
        qid: QueryId,
        slot: u8,
    },

    /// Follower -> leader: the staged version is held locally.
    Acknowledge { qid: QueryId, slot: u8 },

    /// Leader -> follower: apply the pending version.
    Commit { qid: QueryId },

    /// New follower -> leader: catch-up handshake, advertising the address
    /// used for membership checks.
    Join { p2p_addr: SocketAddr },

    /// Leader -> follower: catch-up complete, begin serving.
    Ready,

    /// Heartbeat, leader -> follower and echoed back.
    Alive { slot: u8 },

    /// Follower -> leader: am I still a member?
    Check { p2p_addr: SocketAddr },

    /// Leader -> follower: membership check answer.
    CheckReply { member: bool },

    /// Follower -> leader: redirected client mutation.
    Redirect { cmd: Command<V> },

    /// Follower -> leader: apportioned read resolution request.
    ReadFwd { key: String, ticket: u64 },

    /// Leader -> follower: apportioned read answer.
    ReadBack { ticket: u64, value: V },
}

/// TwoPhaseAq server replica module.
pub struct TwoPhaseAqReplica<V: ValueType> {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Am I the permanent leader?
    is_leader: bool,

    /// Configuration parameters struct.
    config: ReplicaConfigTwoPhaseAq,

    /// Address string for client requests API.
    _api_addr: SocketAddr,

    /// Address string for internal peer-peer communication; also my identity
    /// for membership checks.
    p2p_addr: SocketAddr,

    /// The permanent leader's peer-peer address.
    leader_addr: SocketAddr,

    /// ExternalApi module.
    external_api: ExternalApi<V>,

    /// TransportHub module.
    transport_hub: TransportHub<PeerMsg<V>>,

    /// Heartbeater module.
    heartbeater: Heartbeater,

    /// Versioned key-value state: version records plus the query table.
    versions: VersionedKv<V>,

    /// Next query ID to assign (leader only; single-writer).
    next_query: QueryId,

    /// Follower handles, slot-indexed (leader only). Slots shift only on
    /// cull, in step with acknowledgment bits and liveness slots.
    followers: Vec<(ReplicaId, SocketAddr)>,

    /// Stage-to-commit latency records (leader only), flushed per period.
    commit_stats: Stopwatch,

    /// Am I finished joining the system?
    ready: AtomicBool,

    /// Has the leader contacted me since the last period? (follower only)
    pulse: AtomicBool,

    /// A membership check is in flight (follower only).
    check_outstanding: bool,

    /// Deadline for the in-flight membership check; armed by resetting and
    /// meaningful only while `check_outstanding` is set.
    check_deadline: Pin<Box<Sleep>>,

    /// Next apportioned-read ticket to assign (follower only).
    next_ticket: u64,

    /// Reads forwarded to the leader, awaiting resolution (follower only).
    pending_reads: HashMap<u64, (ClientId, RequestId)>,
}

// TwoPhaseAqReplica coordinator helpers
impl<V: ValueType> TwoPhaseAqReplica<V> {
    /// Leader-side write pipeline: allocates the next query ID, stages the
    /// mutation locally, and broadcasts the stage to all followers. Commits
    /// inline when there is no follower to wait for.
    fn stage_mutation(
        &mut self,
        key: &str,
        value: V,
        action: Action,
    ) -> Result<QueryId, BiphaseError> {
        debug_assert!(self.is_leader);
        let qid = self.next_query;
        self.next_query += 1;

        self.versions.stage(
            qid,
            key,
            value.clone(),
            action,
            Some(LeaderBookkeeping::new(self.followers.len() as u8)),
        )?;
        self.commit_stats.record_now(qid as usize, 0)?;
        pf_debug!(self.id; "staged {:?} query {} key '{}'", action, qid, key);

        if self.followers.is_empty() {
            self.commit_query(qid)?;
        } else {
            for (slot, &(fid, _)) in self.followers.iter().enumerate() {
                self.transport_hub.send_msg(
                    PeerMsg::Stage {
                        key: key.to_string(),
                        value: value.clone(),
                        action,
                        qid,
                        slot: slot as u8,
                    },
                    fid,
                )?;
            }
        }
        Ok(qid)
    }

    /// Applies the commit of a query locally; the leader additionally
    /// forwards the commit to every follower and records the end-to-end
    /// staging latency.
    fn commit_query(
        &mut self,
        qid: QueryId,
    ) -> Result<(), BiphaseError> {
        let effect = self.versions.commit(qid)?;
        pf_debug!(self.id; "committed query {} effect {:?}", qid, effect);

        if self.is_leader {
            for &(fid, _) in self.followers.iter() {
                self.transport_hub.send_msg(PeerMsg::Commit { qid }, fid)?;
            }
            if self.commit_stats.has_id(qid as usize) {
                self.commit_stats.record_now(qid as usize, 1)?;
            }
        }
        Ok(())
    }

    /// Maps a peer's stable replica ID to its current follower slot.
    fn follower_slot(&self, peer: ReplicaId) -> Option<u8> {
        self.followers
            .iter()
            .position(|&(fid, _)| fid == peer)
            .map(|slot| slot as u8)
    }
}

#[async_trait]
impl<V: ValueType> GenericReplica for TwoPhaseAqReplica<V> {
    async fn new_and_setup(
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        rendezvous: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, BiphaseError> {
        // parse and validate protocol-specific configs
        let config = parsed_config!(config_str => ReplicaConfigTwoPhaseAq;
                                    batch_interval_ms, max_batch_size,
                                    alive_interval_ms, check_timeout_ms)?;

        // contact the rendezvous service; the first registrant is the
        // permanent leader
        let rendezvous_stub =
            RendezvousStub::new_and_register(rendezvous, p2p_addr).await?;
        let id = rendezvous_stub.me;
        let leader_addr = rendezvous_stub.leader;
        let is_leader = leader_addr == p2p_addr;
        if is_leader {
            pf_info!(id; "running as the leader");
        } else {
            pf_info!(id; "running as a follower of '{}'", leader_addr);
        }

        // setup transport hub module; followers proactively connect to the
        // leader
        let mut transport_hub =
            TransportHub::new_and_setup(id, p2p_addr).await?;
        if !is_leader {
            transport_hub.connect_to_peer(LEADER, leader_addr).await?;
        }

        // setup heartbeats management module
        let heartbeater = Heartbeater::new_and_setup(
            id,
            Duration::from_millis(config.alive_interval_ms),
        )?;

        // setup external API module, ready to take in client requests
        let external_api = ExternalApi::new_and_setup(
            id,
            api_addr,
            Duration::from_millis(config.batch_interval_ms),
            config.max_batch_size,
        )
        .await?;

        Ok(TwoPhaseAqReplica {
            id,
            is_leader,
            config,
            _api_addr: api_addr,
            p2p_addr,
            leader_addr,
            external_api,
            transport_hub,
            heartbeater,
            versions: VersionedKv::new(id),
            next_query: 0,
            followers: vec![],
            commit_stats: Stopwatch::new(),
            ready: AtomicBool::new(is_leader),
            pulse: AtomicBool::new(is_leader),
            check_outstanding: false,
            check_deadline: Box::pin(time::sleep(Duration::ZERO)),
            next_ticket: 0,
            pending_reads: HashMap::new(),
        })
    }

    async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), BiphaseError> {
        // followers ask the leader to be caught up; `ready` flips once the
        // catch-up completes
        if !self.is_leader {
            self.transport_hub.send_msg(
                PeerMsg::Join {
                    p2p_addr: self.p2p_addr,
                },
                LEADER,
            )?;
            self.pulse.store(true, Ordering::SeqCst);
        }

        // main event loop
        loop {
            tokio::select! {
                // client request batch
                req_batch = self.external_api.get_req_batch() => {
                    if let Err(e) = req_batch {
                        pf_error!(self.id; "error getting req batch: {}", e);
                        continue;
                    }
                    let req_batch = req_batch.unwrap();
                    if let Err(e) = self.handle_req_batch(req_batch) {
                        pf_error!(self.id; "error handling req batch: {}", e);
                    }
                },

                // message from peer
                msg = self.transport_hub.recv_msg() => {
                    if let Err(e) = msg {
                        pf_error!(self.id; "error receiving peer msg: {}", e);
                        continue;
                    }
                    let (peer, msg) = msg.unwrap();
                    if let Err(e) = self.handle_msg(peer, msg).await {
                        pf_error!(self.id; "error handling peer msg: {}", e);
                    }
                },

                // heartbeat period tick
                _ = self.heartbeater.ticked() => {
                    if self.is_leader {
                        if let Err(e) = self.heartbeat_tick_leader() {
                            pf_error!(self.id; "error in heartbeat tick: {}", e);
                        }
                    } else if let Err(e) = self.heartbeat_tick_follower().await {
                        pf_error!(self.id; "error in heartbeat tick: {}", e);
                    }
                },

                // membership check deadline passed without an answer
                () = self.check_deadline.as_mut(), if self.check_outstanding => {
                    if let Err(e) = self.handle_check_deadline().await {
                        pf_error!(self.id; "error handling check deadline: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "server caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    fn id(&self) -> ReplicaId {
        self.id
    }
}

/// TwoPhaseAq client-side endpoint.
pub struct TwoPhaseAqClient<V: ValueType> {
    /// Client ID.
    id: ClientId,

    /// Address of the server to talk to.
    server: SocketAddr,

    /// API stub for communicating with the current server.
    api_stub: Option<ClientApiStub<V>>,

    /// Next request ID to assign.
    next_req: RequestId,
}

impl<V: ValueType> TwoPhaseAqClient<V> {
    /// Creates a new client endpoint targeting the given server address.
    pub fn new(server: SocketAddr) -> Self {
        let id: ClientId = rand::random();
        TwoPhaseAqClient {
            id,
            server,
            api_stub: None,
            next_req: 0,
        }
    }

    /// Gets my client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Establishes connection to the service.
    pub async fn connect(&mut self) -> Result<(), BiphaseError> {
        // disallow reconnection without leaving
        if self.api_stub.is_some() {
            return logged_err!(self.id; "reconnecting without leaving");
        }

        let api_stub =
            ClientApiStub::new_by_connect(self.id, self.server).await?;
        self.api_stub = Some(api_stub);
        Ok(())
    }

    /// Leaves the service: sends a leave notification and forgets about the
    /// current TCP connection.
    pub async fn leave(&mut self) -> Result<(), BiphaseError> {
        if let Some(mut api_stub) = self.api_stub.take() {
            let mut sent = api_stub.send_req(Some(&ApiRequest::Leave))?;
            while !sent {
                sent = api_stub.send_req(None)?;
            }

            while api_stub.recv_reply().await? != ApiReply::Leave {}
            pf_debug!(self.id; "left current server connection");
            api_stub.forget();
        }
        Ok(())
    }

    /// Sends a request to the service.
    pub fn send_req(
        &mut self,
        req: Option<&ApiRequest<V>>,
    ) -> Result<bool, BiphaseError> {
        match self.api_stub {
            Some(ref mut api_stub) => api_stub.send_req(req),
            None => Err(BiphaseError::msg("client not set up")),
        }
    }

    /// Receives a reply from the service.
    pub async fn recv_reply(&mut self) -> Result<ApiReply<V>, BiphaseError> {
        match self.api_stub {
            Some(ref mut api_stub) => api_stub.recv_reply().await,
            None => Err(BiphaseError::msg("client not set up")),
        }
    }

    /// Issues one command and waits for its reply, discarding stale replies
    /// of earlier dropped requests.
    async fn do_cmd(
        &mut self,
        cmd: Command<V>,
    ) -> Result<CommandResult<V>, BiphaseError> {
        let req_id = self.next_req;
        self.next_req += 1;

        let req = ApiRequest::Req { id: req_id, cmd };
        let mut sent = self.send_req(Some(&req))?;
        while !sent {
            sent = self.send_req(None)?;
        }

        loop {
            match self.recv_reply().await? {
                ApiReply::Reply { id, result } if id == req_id => {
                    return match result {
                        Some(result) => Ok(result),
                        None => Err(BiphaseError::msg("request dropped")),
                    };
                }
                _ => continue,
            }
        }
    }

    /// Reads the committed value of a key; the default value if absent.
    pub async fn get(&mut self, key: &str) -> Result<V, BiphaseError> {
        match self.do_cmd(Command::Get { key: key.into() }).await? {
            CommandResult::Get { value } => Ok(value),
            result => {
                logged_err!(self.id; "unexpected get result {:?}", result)
            }
        }
    }

    /// Writes a new value for a key.
    pub async fn put(
        &mut self,
        key: &str,
        value: V,
    ) -> Result<(), BiphaseError> {
        match self
            .do_cmd(Command::Put {
                key: key.into(),
                value,
            })
            .await?
        {
            CommandResult::Put => Ok(()),
            result => {
                logged_err!(self.id; "unexpected put result {:?}", result)
            }
        }
    }

    /// Deletes a key.
    pub async fn remove(&mut self, key: &str) -> Result<(), BiphaseError> {
        match self.do_cmd(Command::Remove { key: key.into() }).await? {
            CommandResult::Remove => Ok(()),
            result => {
                logged_err!(self.id; "unexpected remove result {:?}", result)
            }
        }
    }
}

#[cfg(test)]
mod two_phase_aq_tests {
    use super::*;
    use crate::rendezvous::RendezvousServer;

    use tokio::time::{self, Duration};

    /// Spawns a rendezvous server on the given address.
    async fn start_rendezvous(addr: SocketAddr) -> Result<(), BiphaseError> {
        let (tx_term, rx_term) = watch::channel(false);
        std::mem::forget(tx_term);
        let mut server = RendezvousServer::new_and_setup(addr).await?;
        tokio::spawn(async move { server.run(rx_term).await });
        time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    /// Spawns a replica node and lets it run in the background.
    async fn start_node(
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        rendezvous: SocketAddr,
    ) -> Result<(), BiphaseError> {
        let (tx_term, rx_term) = watch::channel(false);
        std::mem::forget(tx_term);
        let mut node = TwoPhaseAqReplica::<String>::new_and_setup(
            api_addr, p2p_addr, rendezvous, None,
        )
        .await?;
        tokio::spawn(async move { node.run(rx_term).await });
        Ok(())
    }

    /// Polls a key on the given endpoint until it holds the wanted value.
    async fn await_value(
        client: &mut TwoPhaseAqClient<String>,
        key: &str,
        want: &str,
    ) -> Result<(), BiphaseError> {
        for _ in 0..500 {
            if client.get(key).await? == want {
                return Ok(());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        Err(BiphaseError(format!(
            "key '{}' never reached value '{}'",
            key, want
        )))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_node_rw() -> Result<(), BiphaseError> {
        let rendezvous: SocketAddr = "127.0.0.1:33600".parse()?;
        start_rendezvous(rendezvous).await?;

        let api_addr: SocketAddr = "127.0.0.1:33700".parse()?;
        start_node(api_addr, "127.0.0.1:33800".parse()?, rendezvous).await?;

        // a lone leader commits inline, so effects are visible immediately
        let mut client = TwoPhaseAqClient::<String>::new(api_addr);
        client.connect().await?;
        client.put("a", "1".into()).await?;
        assert_eq!(client.get("a").await?, "1");
        client.remove("a").await?;
        assert_eq!(client.get("a").await?, "");
        client.leave().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_node_replication() -> Result<(), BiphaseError> {
        let rendezvous: SocketAddr = "127.0.0.1:33601".parse()?;
        start_rendezvous(rendezvous).await?;

        // the first node to register becomes the leader
        let leader_api: SocketAddr = "127.0.0.1:33701".parse()?;
        start_node(leader_api, "127.0.0.1:33801".parse()?, rendezvous).await?;
        let follower_api: SocketAddr = "127.0.0.1:33702".parse()?;
        start_node(follower_api, "127.0.0.1:33802".parse()?, rendezvous)
            .await?;

        let mut client_l = TwoPhaseAqClient::<String>::new(leader_api);
        client_l.connect().await?;
        let mut client_f = TwoPhaseAqClient::<String>::new(follower_api);
        client_f.connect().await?;

        // a write at the leader propagates to the follower
        client_l.put("x", "42".into()).await?;
        await_value(&mut client_l, "x", "42").await?;
        await_value(&mut client_f, "x", "42").await?;

        // a write at the follower is redirected to the leader
        client_f.put("y", "7".into()).await?;
        await_value(&mut client_l, "y", "7").await?;
        await_value(&mut client_f, "y", "7").await?;

        // a remove flows through the same pipeline
        client_l.remove("x").await?;
        await_value(&mut client_l, "x", "").await?;
        await_value(&mut client_f, "x", "").await?;

        client_l.leave().await?;
        client_f.leave().await?;
        Ok(())
    }
}
