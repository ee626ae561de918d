//! The cluster router.
//!
//! One task that owns every cross-subsystem channel:
//!
//! - inbound peer frames (accepted and dialed connections) go through the
//!   gossip runner; payloads the failure detector does not own come back
//!   here and are dispatched to the rendezvous engine or the pairing
//!   registry;
//! - [`ClusterRequest`]s from the engine and [`PairingNet`] commands from
//!   the registry become signed gossip frames, with request-id
//!   correlation for their replies;
//! - membership events drive the hash ring, the per-peer dial tasks and
//!   the persisted membership snapshot.
//!
//! The router never blocks on a remote reply: multi-step operations
//! (claim fan-outs, holder lookups) run in spawned aggregator tasks that
//! feed results back through channels.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use wasl_gossip::MembershipEvent;
use wasl_pairing::PairingNet;
use wasl_proto::{GossipPayload, Handshake, PairForwardOp, PeerMessage, MAX_FRAME_BYTES};
use wasl_rendezvous::ClusterRequest;
use wasl_ring::RingNode;
use wasl_transport::connector::check_handshake_fresh;
use wasl_transport::{ConnectionKind, RegisterOutcome, TransportConfig, CLOSE_REASON_DUPLICATE};
use wasl_types::{
    DailyPointEntry, HourlyTokenEntry, MembershipEntry, PeerStatus, ServerId,
};

use crate::state::{now_ms, AppState};

/// Cluster claim/lookup aggregation budget.
const AGGREGATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// How often stale pending correlations are purged.
const PENDING_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

type QueryReply = Option<(Vec<DailyPointEntry>, Vec<HourlyTokenEntry>)>;

#[derive(Default)]
struct Pending {
    replicate: HashMap<u64, oneshot::Sender<bool>>,
    query: HashMap<u64, oneshot::Sender<QueryReply>>,
    claims: HashMap<u64, oneshot::Sender<bool>>,
    lookups: HashMap<u64, oneshot::Sender<Option<(ServerId, Option<String>)>>>,
}

impl Pending {
    fn purge_closed(&mut self) {
        self.replicate.retain(|_, tx| !tx.is_closed());
        self.query.retain(|_, tx| !tx.is_closed());
        self.claims.retain(|_, tx| !tx.is_closed());
        self.lookups.retain(|_, tx| !tx.is_closed());
    }
}

/// The router task and its channel ends.
pub struct ClusterRouter {
    state: Arc<AppState>,
    inbound: mpsc::Receiver<(ServerId, PeerMessage)>,
    gossip_out: mpsc::Receiver<(ServerId, PeerMessage)>,
    events: mpsc::Receiver<MembershipEvent>,
    cluster_requests: mpsc::Receiver<ClusterRequest>,
    pairing_net: mpsc::Receiver<PairingNet>,
    /// Payloads produced by aggregator subtasks.
    internal: mpsc::Receiver<(ServerId, GossipPayload)>,
    internal_tx: mpsc::Sender<(ServerId, GossipPayload)>,

    pending: Pending,
    next_req_id: u64,
    connectors: HashMap<ServerId, JoinHandle<()>>,
    transport_config: TransportConfig,
}

impl ClusterRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<AppState>,
        inbound: mpsc::Receiver<(ServerId, PeerMessage)>,
        gossip_out: mpsc::Receiver<(ServerId, PeerMessage)>,
        events: mpsc::Receiver<MembershipEvent>,
        cluster_requests: mpsc::Receiver<ClusterRequest>,
        pairing_net: mpsc::Receiver<PairingNet>,
        transport_config: TransportConfig,
    ) -> Self {
        let (internal_tx, internal) = mpsc::channel(256);
        Self {
            state,
            inbound,
            gossip_out,
            events,
            cluster_requests,
            pairing_net,
            internal,
            internal_tx,
            pending: Pending::default(),
            next_req_id: 1,
            connectors: HashMap::new(),
            transport_config,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut purge = tokio::time::interval(PENDING_PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some((from, message)) = self.inbound.recv() => {
                    self.handle_inbound(from, message).await;
                }
                Some((to, message)) = self.gossip_out.recv() => {
                    if let Err(err) = self.state.peers.send(&to, message).await {
                        tracing::trace!(peer = %to, error = %err, "gossip frame undeliverable");
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_membership_event(event).await;
                }
                Some(request) = self.cluster_requests.recv() => {
                    self.handle_cluster_request(request).await;
                }
                Some(command) = self.pairing_net.recv() => {
                    self.handle_pairing_net(command).await;
                }
                Some((to, payload)) = self.internal.recv() => {
                    self.send_payload(&to, payload).await;
                }
                _ = purge.tick() => {
                    self.pending.purge_closed();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("cluster router stopping");
                    for (_, connector) in self.connectors.drain() {
                        connector.abort();
                    }
                    return;
                }
            }
        }
    }

    async fn handle_inbound(&mut self, from: ServerId, message: PeerMessage) {
        match message {
            PeerMessage::Gossip(envelope) => {
                match self.state.runner.handle_envelope(envelope).await {
                    Ok(Some((sender, payload))) => {
                        self.handle_payload(sender, payload).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::debug!(peer = %from, error = %err, "envelope handling failed");
                    }
                }
            }
            // Handshakes are consumed by the socket accept paths; one
            // arriving mid-stream is a protocol violation worth ignoring.
            PeerMessage::Handshake(_) | PeerMessage::HandshakeAck(_) => {
                tracing::trace!(peer = %from, "unexpected mid-stream handshake");
            }
        }
    }

    async fn handle_payload(&mut self, from: ServerId, payload: GossipPayload) {
        match payload {
            GossipPayload::RvReplicate {
                req_id,
                daily_points,
                hourly_tokens,
                relays,
            } => {
                let accepted = self
                    .state
                    .engine
                    .handle_replicate(daily_points, hourly_tokens, relays)
                    .await;
                self.send_payload(&from, GossipPayload::RvReplicateAck { req_id, accepted })
                    .await;
            }
            GossipPayload::RvReplicateAck { req_id, accepted } => {
                if let Some(reply) = self.pending.replicate.remove(&req_id) {
                    let _ = reply.send(accepted);
                }
            }
            GossipPayload::RvQueryForward {
                req_id,
                daily_points,
                hourly_tokens,
            } => {
                let (daily_entries, hourly_entries) = self
                    .state
                    .engine
                    .handle_query_forward(&daily_points, &hourly_tokens, now_ms())
                    .await;
                self.send_payload(
                    &from,
                    GossipPayload::RvQueryResult {
                        req_id,
                        daily_entries,
                        hourly_entries,
                    },
                )
                .await;
            }
            GossipPayload::RvQueryResult {
                req_id,
                daily_entries,
                hourly_entries,
            } => {
                if let Some(reply) = self.pending.query.remove(&req_id) {
                    let _ = reply.send(Some((daily_entries, hourly_entries)));
                }
            }
            GossipPayload::PairForward { op } => self.handle_pair_forward(from, op).await,
            // SWIM payloads never reach here; the runner consumes them.
            other => {
                tracing::trace!(peer = %from, ?other, "unexpected passthrough payload");
            }
        }
    }

    async fn handle_pair_forward(&mut self, from: ServerId, op: PairForwardOp) {
        match op {
            PairForwardOp::Claim {
                req_id,
                code,
                holder,
            } => {
                let granted = self.state.pairing.claim_code(&code, &holder);
                let existing = if granted {
                    None
                } else {
                    self.state.pairing.lookup_holder(&code)
                };
                self.send_payload(
                    &from,
                    GossipPayload::PairForward {
                        op: PairForwardOp::ClaimResult {
                            req_id,
                            granted,
                            holder: existing,
                        },
                    },
                )
                .await;
            }
            PairForwardOp::ClaimResult {
                req_id, granted, ..
            } => {
                if let Some(reply) = self.pending.claims.remove(&req_id) {
                    let _ = reply.send(granted);
                }
            }
            PairForwardOp::Release { code, holder } => {
                self.state.pairing.release_code(&code, &holder);
            }
            PairForwardOp::Lookup { req_id, code } => {
                let holder = self.state.pairing.lookup_holder(&code);
                let endpoint = match &holder {
                    Some(server_id) if *server_id == self.state.server_id => {
                        Some(self.state.config.public_endpoint())
                    }
                    Some(server_id) => {
                        let membership = self.state.membership.lock().await;
                        membership.entry(server_id).map(|e| e.endpoint.clone())
                    }
                    None => None,
                };
                self.send_payload(
                    &from,
                    GossipPayload::PairForward {
                        op: PairForwardOp::LookupResult {
                            req_id,
                            holder,
                            endpoint,
                        },
                    },
                )
                .await;
            }
            PairForwardOp::LookupResult {
                req_id,
                holder,
                endpoint,
            } => {
                if let Some(reply) = self.pending.lookups.remove(&req_id) {
                    let _ = reply.send(holder.map(|h| (h, endpoint)));
                }
            }
            PairForwardOp::Request {
                requester_code,
                target_code,
                origin,
            } => {
                // Runs off-router: the bounce path sends on the pairing
                // channel this task consumes.
                let pairing = Arc::clone(&self.state.pairing);
                tokio::spawn(async move {
                    pairing
                        .handle_remote_request(origin, &requester_code, &target_code)
                        .await;
                });
            }
            PairForwardOp::Response {
                requester_code,
                target_code,
                accepted,
            } => {
                self.state
                    .pairing
                    .handle_remote_response(&requester_code, &target_code, accepted)
                    .await;
            }
            PairForwardOp::Cancel {
                requester_code,
                target_code,
            } => {
                self.state
                    .pairing
                    .handle_remote_cancel(&requester_code, &target_code);
            }
        }
    }

    async fn handle_cluster_request(&mut self, request: ClusterRequest) {
        match request {
            ClusterRequest::Replicate {
                to,
                daily_points,
                hourly_tokens,
                relays,
                reply,
            } => {
                let req_id = self.alloc_req_id();
                self.pending.replicate.insert(req_id, reply);
                let payload = GossipPayload::RvReplicate {
                    req_id,
                    daily_points,
                    hourly_tokens,
                    relays,
                };
                if !self.send_payload(&to, payload).await {
                    if let Some(reply) = self.pending.replicate.remove(&req_id) {
                        let _ = reply.send(false);
                    }
                }
            }
            ClusterRequest::QueryForward {
                to,
                daily_points,
                hourly_tokens,
                reply,
            } => {
                let req_id = self.alloc_req_id();
                self.pending.query.insert(req_id, reply);
                let payload = GossipPayload::RvQueryForward {
                    req_id,
                    daily_points,
                    hourly_tokens,
                };
                if !self.send_payload(&to, payload).await {
                    if let Some(reply) = self.pending.query.remove(&req_id) {
                        let _ = reply.send(None);
                    }
                }
            }
        }
    }

    async fn handle_pairing_net(&mut self, command: PairingNet) {
        match command {
            PairingNet::ClaimCode { code, reply } => {
                let owners = self.code_owners(&code).await;

                // Local verdict first: an owner that already granted the
                // code to someone else vetoes immediately.
                let local_involved = owners.is_empty()
                    || owners.iter().any(|n| n.server_id == self.state.server_id);
                if local_involved && !self.state.pairing.claim_code(&code, &self.state.server_id) {
                    let _ = reply.send(false);
                    return;
                }

                let mut waiters = Vec::new();
                let local_server_id = self.state.server_id.clone();
                for owner in owners.iter().filter(|n| n.server_id != local_server_id) {
                    let req_id = self.alloc_req_id();
                    let (tx, rx) = oneshot::channel();
                    self.pending.claims.insert(req_id, tx);
                    let payload = GossipPayload::PairForward {
                        op: PairForwardOp::Claim {
                            req_id,
                            code: code.clone(),
                            holder: self.state.server_id.clone(),
                        },
                    };
                    if self.send_payload(&owner.server_id, payload).await {
                        waiters.push(rx);
                    } else {
                        self.pending.claims.remove(&req_id);
                    }
                }

                // Aggregate off-router: any explicit denial loses the
                // claim; timeouts grant (availability over consistency).
                tokio::spawn(async move {
                    let mut granted = true;
                    for waiter in waiters {
                        match tokio::time::timeout(AGGREGATE_TIMEOUT, waiter).await {
                            Ok(Ok(false)) => {
                                granted = false;
                                break;
                            }
                            _ => {}
                        }
                    }
                    let _ = reply.send(granted);
                });
            }
            PairingNet::ReleaseCode { code } => {
                let owners = self.code_owners(&code).await;
                self.state
                    .pairing
                    .release_code(&code, &self.state.server_id);
                for owner in owners
                    .iter()
                    .filter(|n| n.server_id != self.state.server_id)
                {
                    let payload = GossipPayload::PairForward {
                        op: PairForwardOp::Release {
                            code: code.clone(),
                            holder: self.state.server_id.clone(),
                        },
                    };
                    self.send_payload(&owner.server_id, payload).await;
                }
            }
            PairingNet::ForwardRequest {
                requester_code,
                target_code,
                reply,
            } => {
                // Fast path: this server already knows the holder.
                if let Some(holder) = self.state.pairing.lookup_holder(&target_code) {
                    if holder == self.state.server_id {
                        // Stale claim: the code is not actually hosted here.
                        let _ = reply.send(false);
                        return;
                    }
                    let payload = GossipPayload::PairForward {
                        op: PairForwardOp::Request {
                            requester_code,
                            target_code,
                            origin: self.state.server_id.clone(),
                        },
                    };
                    let _ = reply.send(self.send_payload(&holder, payload).await);
                    return;
                }

                // Ask the code's ring owners who holds it.
                let owners = self.code_owners(&target_code).await;
                let mut waiters = Vec::new();
                let local_server_id = self.state.server_id.clone();
                for owner in owners.iter().filter(|n| n.server_id != local_server_id) {
                    let req_id = self.alloc_req_id();
                    let (tx, rx) = oneshot::channel();
                    self.pending.lookups.insert(req_id, tx);
                    let payload = GossipPayload::PairForward {
                        op: PairForwardOp::Lookup {
                            req_id,
                            code: target_code.clone(),
                        },
                    };
                    if self.send_payload(&owner.server_id, payload).await {
                        waiters.push(rx);
                    } else {
                        self.pending.lookups.remove(&req_id);
                    }
                }

                let internal = self.internal_tx.clone();
                let origin = self.state.server_id.clone();
                tokio::spawn(async move {
                    for waiter in waiters {
                        if let Ok(Ok(Some((holder, _endpoint)))) =
                            tokio::time::timeout(AGGREGATE_TIMEOUT, waiter).await
                        {
                            if holder == origin {
                                continue;
                            }
                            let payload = GossipPayload::PairForward {
                                op: PairForwardOp::Request {
                                    requester_code,
                                    target_code,
                                    origin,
                                },
                            };
                            let delivered = internal.send((holder, payload)).await.is_ok();
                            let _ = reply.send(delivered);
                            return;
                        }
                    }
                    let _ = reply.send(false);
                });
            }
            PairingNet::ForwardResponse {
                origin,
                requester_code,
                target_code,
                accepted,
            } => {
                let payload = GossipPayload::PairForward {
                    op: PairForwardOp::Response {
                        requester_code,
                        target_code,
                        accepted,
                    },
                };
                self.send_payload(&origin, payload).await;
            }
            PairingNet::ForwardCancel {
                requester_code,
                target_code,
            } => {
                if let Some(holder) = self.state.pairing.lookup_holder(&target_code) {
                    if holder != self.state.server_id {
                        let payload = GossipPayload::PairForward {
                            op: PairForwardOp::Cancel {
                                requester_code,
                                target_code,
                            },
                        };
                        self.send_payload(&holder, payload).await;
                    }
                }
                // Unknown holder: the remote expiry timer cleans up.
            }
        }
    }

    async fn handle_membership_event(&mut self, event: MembershipEvent) {
        match event {
            MembershipEvent::Updated(entry) => {
                self.apply_ring_update(&entry).await;

                let is_self = entry.server_id == self.state.server_id;
                match entry.status {
                    PeerStatus::Alive if !is_self => self.ensure_connector(&entry),
                    PeerStatus::Failed | PeerStatus::Left => {
                        self.drop_connector(&entry.server_id).await;
                    }
                    _ => {}
                }
                self.persist_membership().await;
            }
            MembershipEvent::Removed(server_id) => {
                {
                    let mut ring = self.state.ring.write().await;
                    let _ = ring.remove_node(&server_id);
                }
                self.drop_connector(&server_id).await;
                self.persist_membership().await;
            }
        }
    }

    async fn apply_ring_update(&self, entry: &MembershipEntry) {
        let mut ring = self.state.ring.write().await;
        if ring.node(&entry.server_id).is_some() {
            let _ = ring.update_status(&entry.server_id, entry.status);
        } else if entry.status != PeerStatus::Left {
            let _ = ring.add_node(RingNode {
                server_id: entry.server_id.clone(),
                node_id: entry.node_id,
                endpoint: entry.endpoint.clone(),
                status: entry.status,
            });
        }
    }

    /// Spawn a dial task for a peer unless one is already running.
    fn ensure_connector(&mut self, entry: &MembershipEntry) {
        if let Some(existing) = self.connectors.get(&entry.server_id) {
            if !existing.is_finished() {
                return;
            }
        }

        tracing::debug!(peer = %entry.server_id, endpoint = %entry.endpoint, "starting dial task");
        let handle = tokio::spawn(wasl_transport::connect_peer(
            Arc::clone(&self.state.peers),
            Arc::clone(&self.state.keypair),
            self.transport_config.clone(),
            self.state.config.public_endpoint(),
            peer_metadata(&self.state.config.network.region),
            entry.server_id.clone(),
            entry.endpoint.clone(),
            self.state.inbound_peer.clone(),
            self.state.shutdown.subscribe(),
        ));
        self.connectors.insert(entry.server_id.clone(), handle);
    }

    async fn drop_connector(&mut self, server_id: &ServerId) {
        if let Some(handle) = self.connectors.remove(server_id) {
            handle.abort();
        }
        self.state.peers.unregister(server_id).await;
    }

    async fn persist_membership(&self) {
        let snapshot = {
            let membership = self.state.membership.lock().await;
            membership.snapshot()
        };
        let store = self.state.engine.store();
        let mut conn = store.lock().await;
        if let Err(err) = wasl_store::queries::membership::save_all(&mut conn, &snapshot) {
            tracing::warn!(error = %err, "membership snapshot failed");
        }
    }

    async fn code_owners(&self, code: &str) -> Vec<RingNode> {
        let ring = self.state.ring.read().await;
        ring.responsible_nodes(code, self.state.config.dht.replication_factor)
    }

    /// Sign and send one payload; false when undeliverable.
    async fn send_payload(&self, to: &ServerId, payload: GossipPayload) -> bool {
        let envelope = match self.state.runner.build_envelope(payload).await {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "envelope build failed");
                return false;
            }
        };
        match self.state.peers.send(to, PeerMessage::Gossip(envelope)).await {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(peer = %to, error = %err, "payload undeliverable");
                false
            }
        }
    }

    fn alloc_req_id(&mut self) -> u64 {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        req_id
    }
}

fn peer_metadata(region: &str) -> std::collections::BTreeMap<String, String> {
    let mut metadata = std::collections::BTreeMap::new();
    if !region.is_empty() {
        metadata.insert("region".to_string(), region.to_string());
    }
    metadata
}

// ---------------------------------------------------------------------------
// Incoming peer connections (`GET /cluster`)
// ---------------------------------------------------------------------------

/// `GET /cluster` — server↔server WebSocket upgrade.
pub async fn cluster_ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_peer_socket(socket, state))
}

async fn handle_peer_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // The dialing side speaks first.
    let handshake = match tokio::time::timeout(
        std::time::Duration::from_secs(8),
        read_peer_handshake(&mut receiver),
    )
    .await
    {
        Ok(Some(handshake)) => handshake,
        _ => {
            tracing::trace!("peer handshake missing or late");
            return;
        }
    };

    if handshake.verify().is_err() || check_handshake_fresh(&handshake, now_ms()).is_err() {
        // Authentication failures are dropped without a hint.
        let mut membership = state.membership.lock().await;
        membership.record_drop(wasl_gossip::DropReason::BadSignature);
        return;
    }
    let peer_id = handshake.server_id.clone();

    // Answer with our own signed handshake.
    let ack = match Handshake::build(
        &state.keypair,
        &state.config.public_endpoint(),
        peer_metadata(&state.config.network.region),
        now_ms(),
    ) {
        Ok(ack) => ack,
        Err(err) => {
            tracing::warn!(error = %err, "handshake_ack build failed");
            return;
        }
    };
    let Ok(ack_json) = PeerMessage::HandshakeAck(ack).to_json() else {
        return;
    };
    if sender.send(Message::Text(ack_json)).await.is_err() {
        return;
    }

    let mut rx = match state.peers.register(peer_id.clone(), ConnectionKind::Incoming).await {
        RegisterOutcome::Registered(rx) => rx,
        RegisterOutcome::RejectDuplicate => {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: CLOSE_REASON_DUPLICATE.into(),
                })))
                .await;
            return;
        }
    };

    tracing::info!(peer = %peer_id, "peer connected (incoming)");

    // First contact doubles as a membership seed.
    let known = {
        let membership = state.membership.lock().await;
        membership.entry(&peer_id).is_some()
    };
    if !known {
        let entry = MembershipEntry {
            server_id: handshake.server_id.clone(),
            node_id: handshake.node_id,
            endpoint: handshake.endpoint.clone(),
            public_key: handshake.public_key.clone(),
            status: PeerStatus::Alive,
            incarnation: 0,
            last_seen_ms: now_ms(),
            metadata: handshake.metadata.clone(),
        };
        if let Err(err) = state.runner.add_seed(entry).await {
            tracing::debug!(error = %err, "handshake seed failed");
        }
    }

    let replaced = loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(message) = frame else {
                    break true;
                };
                let Ok(json) = message.to_json() else {
                    continue;
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break false;
                }
            }
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else {
                    break false;
                };
                match frame {
                    Message::Text(text) => {
                        match PeerMessage::from_json(&text) {
                            Ok(message) => {
                                if state
                                    .inbound_peer
                                    .send((peer_id.clone(), message))
                                    .await
                                    .is_err()
                                {
                                    break false;
                                }
                            }
                            Err(err) => {
                                tracing::trace!(peer = %peer_id, error = %err, "bad peer frame");
                            }
                        }
                    }
                    Message::Close(_) => break false,
                    _ => {}
                }
            }
        }
    };

    if !replaced {
        state.peers.unregister(&peer_id).await;
    }
    tracing::info!(peer = %peer_id, "peer disconnected (incoming)");
}

async fn read_peer_handshake<S>(receiver: &mut S) -> Option<Handshake>
where
    S: futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => {
                return match PeerMessage::from_json(&text) {
                    Ok(PeerMessage::Handshake(handshake)) => Some(handshake),
                    _ => None,
                };
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
    None
}
