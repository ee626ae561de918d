//! The pairing registry and pair-request state machine.
//!
//! Requests move `PENDING → MATCHED | REJECTED | EXPIRED | CANCELLED`;
//! every terminal transition aborts the request's timer and frees its
//! bookkeeping. A request exists on the requester's server and, when the
//! target lives elsewhere, on the target's server too; each side runs its
//! own expiry timer so no cross-server expiry traffic is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use wasl_proto::ServerMessage;
use wasl_types::{pairing, ConnId, ServerId};

use crate::{ClientSink, PairError, PairView, PairingConfig, PairingNet, Result};

/// A live code registration.
struct CodeRegistration {
    #[allow(dead_code)]
    public_key: String,
    conn_id: ConnId,
    #[allow(dead_code)]
    registered_at_ms: u64,
}

/// Who initiated a request, as seen from this server.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Party {
    /// A client connected here.
    Local(ConnId),
    /// A client on another server (its server id).
    Remote(ServerId),
}

/// One pending pair request.
struct PairRequest {
    requester: Party,
    /// Target's local connection; `None` when the target is remote.
    target_conn: Option<ConnId>,
    timer: Option<JoinHandle<()>>,
}

/// An established pair, per code.
struct Pairing {
    peer_code: String,
    paired_at_ms: u64,
}

/// `(requester_code, target_code)`.
type RequestKey = (String, String);

#[derive(Default)]
struct State {
    codes: HashMap<String, CodeRegistration>,
    by_conn: HashMap<ConnId, String>,
    requests: HashMap<RequestKey, PairRequest>,
    pairs: HashMap<String, Pairing>,
    /// Ring-owner view: code -> holder server (cluster uniqueness).
    claims: HashMap<String, ServerId>,
}

/// The pairing registry. One per server process.
pub struct PairingRegistry {
    server_id: ServerId,
    config: PairingConfig,
    sink: Arc<dyn ClientSink>,
    net: mpsc::Sender<PairingNet>,
    state: Mutex<State>,
}

impl PairingRegistry {
    /// Create a registry.
    pub fn new(
        server_id: ServerId,
        config: PairingConfig,
        sink: Arc<dyn ClientSink>,
        net: mpsc::Sender<PairingNet>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id,
            config,
            sink,
            net,
            state: Mutex::new(State::default()),
        })
    }

    /// Number of live code registrations (for `/stats`).
    pub fn registered_codes(&self) -> usize {
        self.lock().codes.len()
    }

    /// Number of pending pair requests (for `/stats`).
    pub fn pending_requests(&self) -> usize {
        self.lock().requests.len()
    }

    /// The code a connection registered, if any.
    pub fn code_for_conn(&self, conn_id: ConnId) -> Option<String> {
        self.lock().by_conn.get(&conn_id).cloned()
    }

    /// Register a client-picked pairing code for a connection.
    ///
    /// The code must be free locally *and* on its ring owners; a taken
    /// code is the client's problem to re-pick.
    ///
    /// # Errors
    ///
    /// [`PairError::InvalidCode`] or [`PairError::CodeTaken`].
    pub async fn register(
        self: &Arc<Self>,
        conn_id: ConnId,
        code: &str,
        public_key: &str,
    ) -> Result<()> {
        pairing::validate_code(code).map_err(|_| PairError::InvalidCode)?;

        let needs_cleanup = {
            let state = self.lock();
            if state.codes.contains_key(code) {
                return Err(PairError::CodeTaken);
            }
            state.by_conn.contains_key(&conn_id)
        };
        if needs_cleanup {
            // One code per connection; re-registering means the old
            // code is released first.
            self.connection_closed(conn_id).await;
        }

        // Cluster-wide uniqueness check against the ring owners. An
        // unreachable cluster grants optimistically (availability first;
        // the claim owners converge when they come back).
        let (reply_tx, reply_rx) = oneshot::channel();
        self.net
            .send(PairingNet::ClaimCode {
                code: code.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| PairError::ClusterClosed)?;
        let granted = match tokio::time::timeout(self.config.claim_timeout, reply_rx).await {
            Ok(Ok(granted)) => granted,
            _ => true,
        };
        if !granted {
            return Err(PairError::CodeTaken);
        }

        let mut state = self.lock();
        if state.codes.contains_key(code) {
            return Err(PairError::CodeTaken);
        }
        state.codes.insert(
            code.to_string(),
            CodeRegistration {
                public_key: public_key.to_string(),
                conn_id,
                registered_at_ms: now_ms(),
            },
        );
        state.by_conn.insert(conn_id, code.to_string());
        tracing::debug!(code, conn_id, "pairing code registered");
        Ok(())
    }

    /// Tear down everything a closing connection owned: its code, its
    /// pending requests (both directions) and its pairs.
    pub async fn connection_closed(self: &Arc<Self>, conn_id: ConnId) {
        let mut deliveries: Vec<(ConnId, ServerMessage)> = Vec::new();
        let mut net_sends: Vec<PairingNet> = Vec::new();

        {
            let mut state = self.lock();
            let Some(code) = state.by_conn.remove(&conn_id) else {
                return;
            };
            state.codes.remove(&code);
            net_sends.push(PairingNet::ReleaseCode { code: code.clone() });

            // Cancel requests this connection was party to
            let keys: Vec<RequestKey> = state
                .requests
                .iter()
                .filter(|(key, request)| {
                    key.0 == code
                        || key.1 == code
                        || request.requester == Party::Local(conn_id)
                        || request.target_conn == Some(conn_id)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                let Some(mut request) = state.requests.remove(&key) else {
                    continue;
                };
                abort_timer(&mut request);
                let (requester_code, target_code) = key;

                if requester_code == code {
                    // Our outgoing request: the target learns it is gone
                    match request.target_conn {
                        Some(target_conn) => {
                            deliveries.push((target_conn, ServerMessage::PairRejected));
                        }
                        None => net_sends.push(PairingNet::ForwardCancel {
                            requester_code,
                            target_code,
                        }),
                    }
                } else {
                    // Incoming request: the requester learns it is gone
                    match request.requester {
                        Party::Local(requester_conn) => {
                            deliveries.push((requester_conn, ServerMessage::PairRejected));
                        }
                        Party::Remote(origin) => net_sends.push(PairingNet::ForwardResponse {
                            origin,
                            requester_code,
                            target_code,
                            accepted: false,
                        }),
                    }
                }
            }

            // Pairs die with the connection
            if let Some(pairing) = state.pairs.remove(&code) {
                state.pairs.remove(&pairing.peer_code);
            }
            tracing::debug!(code, conn_id, "pairing code released");
        }

        for (conn, message) in deliveries {
            self.sink.send(conn, message);
        }
        for send in net_sends {
            let _ = self.net.send(send).await;
        }
    }

    /// Start a pair request from a local connection.
    ///
    /// # Errors
    ///
    /// [`PairError::NotRegistered`], [`PairError::TooManyPending`], or
    /// [`PairError::UnknownTarget`] when no server holds the code.
    pub async fn pair_request(self: &Arc<Self>, conn_id: ConnId, target_code: &str) -> Result<()> {
        pairing::validate_code(target_code).map_err(|_| PairError::InvalidCode)?;

        let (requester_code, local_target) = {
            let state = self.lock();
            let requester_code = state
                .by_conn
                .get(&conn_id)
                .cloned()
                .ok_or(PairError::NotRegistered)?;
            if requester_code == target_code {
                return Err(PairError::UnknownTarget);
            }
            let key = (requester_code.clone(), target_code.to_string());
            if state.requests.contains_key(&key) {
                // Already pending; idempotent
                return Ok(());
            }
            if state.pending_for_target(target_code) >= self.config.max_pending_per_target {
                return Err(PairError::TooManyPending);
            }
            let local_target = state.codes.get(target_code).map(|reg| reg.conn_id);
            (requester_code, local_target)
        };

        let key = (requester_code.clone(), target_code.to_string());

        match local_target {
            Some(target_conn) => {
                {
                    let mut state = self.lock();
                    state.requests.insert(
                        key.clone(),
                        PairRequest {
                            requester: Party::Local(conn_id),
                            target_conn: Some(target_conn),
                            timer: None,
                        },
                    );
                }
                self.sink.send(
                    target_conn,
                    ServerMessage::PairIncoming {
                        from_code: requester_code,
                    },
                );
                self.arm_timer(key, true);
                Ok(())
            }
            None => {
                // Remote target: record first so a fast response finds it
                {
                    let mut state = self.lock();
                    state.requests.insert(
                        key.clone(),
                        PairRequest {
                            requester: Party::Local(conn_id),
                            target_conn: None,
                            timer: None,
                        },
                    );
                }

                let (reply_tx, reply_rx) = oneshot::channel();
                self.net
                    .send(PairingNet::ForwardRequest {
                        requester_code: key.0.clone(),
                        target_code: key.1.clone(),
                        reply: reply_tx,
                    })
                    .await
                    .map_err(|_| PairError::ClusterClosed)?;
                let forwarded = match tokio::time::timeout(self.config.claim_timeout, reply_rx).await
                {
                    Ok(Ok(forwarded)) => forwarded,
                    _ => false,
                };

                if !forwarded {
                    let mut state = self.lock();
                    state.requests.remove(&key);
                    return Err(PairError::UnknownTarget);
                }
                self.arm_timer(key, true);
                Ok(())
            }
        }
    }

    /// A local target answers an incoming request.
    ///
    /// `peer_code` is the requester's code (the `targetCode` field of the
    /// client's `pair_response`).
    ///
    /// # Errors
    ///
    /// [`PairError::NotRegistered`] or [`PairError::NoPendingRequest`].
    pub async fn pair_response(
        self: &Arc<Self>,
        conn_id: ConnId,
        peer_code: &str,
        accepted: bool,
    ) -> Result<()> {
        let (responder_code, mut request) = {
            let mut state = self.lock();
            let responder_code = state
                .by_conn
                .get(&conn_id)
                .cloned()
                .ok_or(PairError::NotRegistered)?;
            let key = (peer_code.to_string(), responder_code.clone());
            let request = state
                .requests
                .remove(&key)
                .ok_or(PairError::NoPendingRequest)?;
            (responder_code, request)
        };
        abort_timer(&mut request);

        if accepted {
            let now = now_ms();
            {
                let mut state = self.lock();
                state.pairs.insert(
                    responder_code.clone(),
                    Pairing {
                        peer_code: peer_code.to_string(),
                        paired_at_ms: now,
                    },
                );
                state.pairs.insert(
                    peer_code.to_string(),
                    Pairing {
                        peer_code: responder_code.clone(),
                        paired_at_ms: now,
                    },
                );
            }
            self.sink.send(
                conn_id,
                ServerMessage::PairMatched {
                    peer_code: peer_code.to_string(),
                    is_initiator: false,
                },
            );
            match request.requester {
                Party::Local(requester_conn) => {
                    self.sink.send(
                        requester_conn,
                        ServerMessage::PairMatched {
                            peer_code: responder_code,
                            is_initiator: true,
                        },
                    );
                }
                Party::Remote(origin) => {
                    let _ = self
                        .net
                        .send(PairingNet::ForwardResponse {
                            origin,
                            requester_code: peer_code.to_string(),
                            target_code: responder_code,
                            accepted: true,
                        })
                        .await;
                }
            }
        } else {
            match request.requester {
                Party::Local(requester_conn) => {
                    self.sink.send(requester_conn, ServerMessage::PairRejected);
                }
                Party::Remote(origin) => {
                    let _ = self
                        .net
                        .send(PairingNet::ForwardResponse {
                            origin,
                            requester_code: peer_code.to_string(),
                            target_code: responder_code,
                            accepted: false,
                        })
                        .await;
                }
            }
        }
        Ok(())
    }

    /// A local requester withdraws its pending request.
    ///
    /// # Errors
    ///
    /// [`PairError::NotRegistered`] or [`PairError::NoPendingRequest`].
    pub async fn pair_cancel(self: &Arc<Self>, conn_id: ConnId, target_code: &str) -> Result<()> {
        let (requester_code, mut request) = {
            let mut state = self.lock();
            let requester_code = state
                .by_conn
                .get(&conn_id)
                .cloned()
                .ok_or(PairError::NotRegistered)?;
            let key = (requester_code.clone(), target_code.to_string());
            let request = state
                .requests
                .remove(&key)
                .ok_or(PairError::NoPendingRequest)?;
            (requester_code, request)
        };
        abort_timer(&mut request);

        match request.target_conn {
            Some(target_conn) => {
                self.sink.send(target_conn, ServerMessage::PairRejected);
            }
            None => {
                let _ = self
                    .net
                    .send(PairingNet::ForwardCancel {
                        requester_code,
                        target_code: target_code.to_string(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// A request forwarded from the requester's server arrives for a
    /// local target.
    pub async fn handle_remote_request(
        self: &Arc<Self>,
        origin: ServerId,
        requester_code: &str,
        target_code: &str,
    ) {
        let target_conn = {
            let state = self.lock();
            let over_limit =
                state.pending_for_target(target_code) >= self.config.max_pending_per_target;
            match state.codes.get(target_code) {
                Some(reg) if !over_limit => Some(reg.conn_id),
                _ => None,
            }
        };

        let Some(target_conn) = target_conn else {
            // Unknown here (or over the amplification bound): tell the
            // origin so the requester sees a rejection, not a timeout.
            let _ = self
                .net
                .send(PairingNet::ForwardResponse {
                    origin,
                    requester_code: requester_code.to_string(),
                    target_code: target_code.to_string(),
                    accepted: false,
                })
                .await;
            return;
        };

        let key = (requester_code.to_string(), target_code.to_string());
        {
            let mut state = self.lock();
            if state.requests.contains_key(&key) {
                return;
            }
            state.requests.insert(
                key.clone(),
                PairRequest {
                    requester: Party::Remote(origin),
                    target_conn: Some(target_conn),
                    timer: None,
                },
            );
        }
        self.sink.send(
            target_conn,
            ServerMessage::PairIncoming {
                from_code: requester_code.to_string(),
            },
        );
        // The requester's server runs the warning; we only expire.
        self.arm_timer(key, false);
    }

    /// A response routed back from the target's server arrives for a
    /// local requester.
    pub async fn handle_remote_response(
        self: &Arc<Self>,
        requester_code: &str,
        target_code: &str,
        accepted: bool,
    ) {
        let (requester_conn, mut request) = {
            let mut state = self.lock();
            let key = (requester_code.to_string(), target_code.to_string());
            let Some(request) = state.requests.remove(&key) else {
                return;
            };
            match &request.requester {
                Party::Local(conn) => (*conn, request),
                Party::Remote(_) => {
                    // Not ours to resolve; put it back untouched.
                    state.requests.insert(key, request);
                    return;
                }
            }
        };
        abort_timer(&mut request);

        if accepted {
            let now = now_ms();
            let mut state = self.lock();
            state.pairs.insert(
                requester_code.to_string(),
                Pairing {
                    peer_code: target_code.to_string(),
                    paired_at_ms: now,
                },
            );
            state.pairs.insert(
                target_code.to_string(),
                Pairing {
                    peer_code: requester_code.to_string(),
                    paired_at_ms: now,
                },
            );
            drop(state);
            self.sink.send(
                requester_conn,
                ServerMessage::PairMatched {
                    peer_code: target_code.to_string(),
                    is_initiator: true,
                },
            );
        } else {
            self.sink.send(requester_conn, ServerMessage::PairRejected);
        }
    }

    /// A cancel routed from the requester's server arrives for a local
    /// target.
    pub fn handle_remote_cancel(self: &Arc<Self>, requester_code: &str, target_code: &str) {
        let request = {
            let mut state = self.lock();
            let key = (requester_code.to_string(), target_code.to_string());
            state.requests.remove(&key)
        };
        if let Some(mut request) = request {
            abort_timer(&mut request);
            if let Some(target_conn) = request.target_conn {
                self.sink.send(target_conn, ServerMessage::PairRejected);
            }
        }
    }

    /// Ring-owner side of a code claim. Grants iff no other holder is
    /// recorded and the code is not hosted locally by someone else.
    pub fn claim_code(&self, code: &str, holder: &ServerId) -> bool {
        let mut state = self.lock();
        if state.codes.contains_key(code) && *holder != self.server_id {
            return false;
        }
        match state.claims.get(code) {
            Some(existing) if existing != holder => false,
            _ => {
                state.claims.insert(code.to_string(), holder.clone());
                true
            }
        }
    }

    /// Ring-owner side of a code release.
    pub fn release_code(&self, code: &str, holder: &ServerId) {
        let mut state = self.lock();
        if state.claims.get(code) == Some(holder) {
            state.claims.remove(code);
        }
    }

    /// Which server holds a code, as far as this owner knows.
    pub fn lookup_holder(&self, code: &str) -> Option<ServerId> {
        let state = self.lock();
        if state.codes.contains_key(code) {
            return Some(self.server_id.clone());
        }
        state.claims.get(code).cloned()
    }

    /// Arm the warn/expire timer for a pending request.
    fn arm_timer(self: &Arc<Self>, key: RequestKey, warn: bool) {
        let registry = Arc::clone(self);
        let warning_lead = self.config.request_timeout.saturating_sub(self.config.warning_time);
        let warning_time = self.config.warning_time;
        let timer_key = key.clone();

        let handle = tokio::spawn(async move {
            if warn {
                tokio::time::sleep(warning_lead).await;
                registry.on_warn(&timer_key);
                tokio::time::sleep(warning_time).await;
            } else {
                tokio::time::sleep(warning_lead + warning_time).await;
            }
            registry.on_expire(&timer_key);
        });

        let mut state = self.lock();
        match state.requests.get_mut(&key) {
            Some(request) => request.timer = Some(handle),
            // Resolved before the timer was attached
            None => handle.abort(),
        }
    }

    fn on_warn(&self, key: &RequestKey) {
        let requester_conn = {
            let state = self.lock();
            match state.requests.get(key) {
                Some(PairRequest {
                    requester: Party::Local(conn),
                    ..
                }) => Some(*conn),
                _ => None,
            }
        };
        if let Some(conn) = requester_conn {
            self.sink.send(
                conn,
                ServerMessage::PairWarning {
                    seconds_remaining: self.config.warning_time.as_secs(),
                },
            );
        }
    }

    fn on_expire(&self, key: &RequestKey) {
        let request = {
            let mut state = self.lock();
            state.requests.remove(key)
        };
        let Some(request) = request else {
            return;
        };
        tracing::debug!(requester = %key.0, target = %key.1, "pair request expired");
        if let Party::Local(conn) = request.requester {
            self.sink.send(conn, ServerMessage::PairExpired);
        }
        if let Some(target_conn) = request.target_conn {
            self.sink.send(target_conn, ServerMessage::PairExpired);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl State {
    fn pending_for_target(&self, target_code: &str) -> usize {
        self.requests.keys().filter(|key| key.1 == target_code).count()
    }
}

impl PairView for PairingRegistry {
    fn is_paired(&self, a: &str, b: &str) -> bool {
        let ttl = self.config.pair_ttl.as_millis() as u64;
        let now = now_ms();
        let state = self.lock();
        matches!(
            state.pairs.get(a),
            Some(pairing)
                if pairing.peer_code == b && now.saturating_sub(pairing.paired_at_ms) < ttl
        )
    }

    fn paired_peer(&self, code: &str) -> Option<String> {
        let state = self.lock();
        state.pairs.get(code).map(|p| p.peer_code.clone())
    }

    fn conn_for_code(&self, code: &str) -> Option<ConnId> {
        let state = self.lock();
        state.codes.get(code).map(|reg| reg.conn_id)
    }
}

fn abort_timer(request: &mut PairRequest) {
    if let Some(timer) = request.timer.take() {
        timer.abort();
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records every delivery for assertions.
    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(ConnId, ServerMessage)>>,
    }

    impl ClientSink for RecordingSink {
        fn send(&self, conn_id: ConnId, message: ServerMessage) -> bool {
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((conn_id, message));
            true
        }
    }

    impl RecordingSink {
        fn messages_for(&self, conn_id: ConnId) -> Vec<ServerMessage> {
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .filter(|(c, _)| *c == conn_id)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    struct Harness {
        registry: Arc<PairingRegistry>,
        sink: Arc<RecordingSink>,
        net: mpsc::Receiver<PairingNet>,
    }

    fn make_harness(config: PairingConfig) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let (net_tx, net_rx) = mpsc::channel(64);
        let registry = PairingRegistry::new(
            ServerId::from_public_key(&[1u8; 32]),
            config,
            Arc::<RecordingSink>::clone(&sink) as Arc<dyn ClientSink>,
            net_tx,
        );
        Harness {
            registry,
            sink,
            net: net_rx,
        }
    }

    fn fast_config() -> PairingConfig {
        PairingConfig {
            request_timeout: Duration::from_millis(80),
            warning_time: Duration::from_millis(40),
            claim_timeout: Duration::from_millis(50),
            ..PairingConfig::default()
        }
    }

    /// Grants every claim/forward so single-server flows run unattended.
    fn auto_grant(mut net: mpsc::Receiver<PairingNet>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = net.recv().await {
                match request {
                    PairingNet::ClaimCode { reply, .. } => {
                        let _ = reply.send(true);
                    }
                    PairingNet::ForwardRequest { reply, .. } => {
                        let _ = reply.send(true);
                    }
                    _ => {}
                }
            }
        })
    }

    #[tokio::test]
    async fn test_register_and_reuse_cycle() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;

        registry.register(1, "ABC234", "PK_A").await.expect("register");
        assert_eq!(registry.registered_codes(), 1);

        // Same code on another connection is taken
        let err = registry.register(2, "ABC234", "PK_B").await.expect_err("taken");
        assert!(matches!(err, PairError::CodeTaken));

        // register . unregister . register succeeds
        registry.connection_closed(1).await;
        assert_eq!(registry.registered_codes(), 0);
        registry.register(3, "ABC234", "PK_C").await.expect("register again");
    }

    #[tokio::test]
    async fn test_register_rejects_bad_code() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let err = harness
            .registry
            .register(1, "abc", "PK")
            .await
            .expect_err("invalid");
        assert!(matches!(err, PairError::InvalidCode));
    }

    #[tokio::test]
    async fn test_register_denied_by_cluster() {
        let mut harness = make_harness(fast_config());
        let registry = Arc::clone(&harness.registry);

        let router = tokio::spawn(async move {
            if let Some(PairingNet::ClaimCode { reply, .. }) = harness.net.recv().await {
                let _ = reply.send(false);
            }
        });

        let err = registry.register(1, "ABC234", "PK").await.expect_err("denied");
        assert!(matches!(err, PairError::CodeTaken));
        router.await.expect("router");
    }

    #[tokio::test]
    async fn test_same_server_pair_flow() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        let sink = harness.sink;

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");

        registry.pair_request(1, "XYZ567").await.expect("request");
        assert_eq!(
            sink.messages_for(2),
            vec![ServerMessage::PairIncoming {
                from_code: "ABC234".to_string()
            }]
        );

        registry.pair_response(2, "ABC234", true).await.expect("response");

        let bob_msgs = sink.messages_for(2);
        assert!(bob_msgs.contains(&ServerMessage::PairMatched {
            peer_code: "ABC234".to_string(),
            is_initiator: false,
        }));
        let alice_msgs = sink.messages_for(1);
        assert!(alice_msgs.contains(&ServerMessage::PairMatched {
            peer_code: "XYZ567".to_string(),
            is_initiator: true,
        }));

        assert!(registry.is_paired("ABC234", "XYZ567"));
        assert!(registry.is_paired("XYZ567", "ABC234"));
        assert_eq!(registry.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_rejection_notifies_requester() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        let sink = harness.sink;

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");
        registry.pair_request(1, "XYZ567").await.expect("request");
        registry.pair_response(2, "ABC234", false).await.expect("response");

        assert!(sink.messages_for(1).contains(&ServerMessage::PairRejected));
        assert!(!registry.is_paired("ABC234", "XYZ567"));
    }

    #[tokio::test]
    async fn test_warning_then_expiry() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        let sink = harness.sink;

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");
        registry.pair_request(1, "XYZ567").await.expect("request");

        tokio::time::sleep(Duration::from_millis(200)).await;

        let alice = sink.messages_for(1);
        assert!(alice.iter().any(|m| matches!(m, ServerMessage::PairWarning { .. })));
        assert!(alice.contains(&ServerMessage::PairExpired));
        assert!(sink.messages_for(2).contains(&ServerMessage::PairExpired));
        assert_eq!(registry.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_response_cancels_timer() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        let sink = harness.sink;

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");
        registry.pair_request(1, "XYZ567").await.expect("request");
        registry.pair_response(2, "ABC234", true).await.expect("response");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!sink.messages_for(1).contains(&ServerMessage::PairExpired));
        assert!(!sink.messages_for(2).contains(&ServerMessage::PairExpired));
    }

    #[tokio::test]
    async fn test_cancel_notifies_target() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        let sink = harness.sink;

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");
        registry.pair_request(1, "XYZ567").await.expect("request");
        registry.pair_cancel(1, "XYZ567").await.expect("cancel");

        assert!(sink.messages_for(2).contains(&ServerMessage::PairRejected));
        assert_eq!(registry.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_pending_bound_per_target() {
        let config = PairingConfig {
            max_pending_per_target: 2,
            ..fast_config()
        };
        let harness = make_harness(config);
        let _router = auto_grant(harness.net);
        let registry = harness.registry;

        registry.register(10, "TARGET", "PK_T").await.expect("target");
        for (conn, code) in [(1u64, "AAAAAA"), (2u64, "BBBBBB"), (3u64, "CCCCCC")] {
            registry.register(conn, code, "PK").await.expect("register");
        }

        registry.pair_request(1, "TARGET").await.expect("first");
        registry.pair_request(2, "TARGET").await.expect("second");
        let err = registry.pair_request(3, "TARGET").await.expect_err("third");
        assert!(matches!(err, PairError::TooManyPending));
    }

    #[tokio::test]
    async fn test_unregistered_requester_rejected() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let err = harness
            .registry
            .pair_request(99, "ABC234")
            .await
            .expect_err("must fail");
        assert!(matches!(err, PairError::NotRegistered));
    }

    #[tokio::test]
    async fn test_response_without_request_rejected() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        registry.register(1, "ABC234", "PK").await.expect("register");
        let err = registry
            .pair_response(1, "XYZ567", true)
            .await
            .expect_err("must fail");
        assert!(matches!(err, PairError::NoPendingRequest));
    }

    #[tokio::test]
    async fn test_remote_request_delivers_and_responds() {
        let harness = make_harness(fast_config());
        let registry = Arc::clone(&harness.registry);
        let sink = Arc::clone(&harness.sink);
        let mut net = harness.net;
        let origin = ServerId::from_public_key(&[9u8; 32]);

        // Bob is local; claim grants come from a stub router
        let grant = tokio::spawn(async move {
            if let Some(PairingNet::ClaimCode { reply, .. }) = net.recv().await {
                let _ = reply.send(true);
            }
            net
        });
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");
        let mut net = grant.await.expect("router");

        registry
            .handle_remote_request(origin.clone(), "ABC234", "XYZ567")
            .await;
        assert!(sink.messages_for(2).contains(&ServerMessage::PairIncoming {
            from_code: "ABC234".to_string()
        }));

        registry.pair_response(2, "ABC234", true).await.expect("respond");
        match net.recv().await.expect("forward") {
            PairingNet::ForwardResponse {
                origin: o,
                requester_code,
                target_code,
                accepted,
            } => {
                assert_eq!(o, origin);
                assert_eq!(requester_code, "ABC234");
                assert_eq!(target_code, "XYZ567");
                assert!(accepted);
            }
            other => panic!("wrong net send: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_request_for_unknown_code_bounces() {
        let harness = make_harness(fast_config());
        let registry = Arc::clone(&harness.registry);
        let mut net = harness.net;
        let origin = ServerId::from_public_key(&[9u8; 32]);

        registry
            .handle_remote_request(origin.clone(), "ABC234", "NOCODE")
            .await;
        match net.recv().await.expect("bounce") {
            PairingNet::ForwardResponse { accepted, .. } => assert!(!accepted),
            other => panic!("wrong net send: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_response_matches_local_requester() {
        let harness = make_harness(fast_config());
        let registry = Arc::clone(&harness.registry);
        let sink = Arc::clone(&harness.sink);
        let mut net = harness.net;

        // Alice local, Bob remote: grant the claim, then accept the forward
        let router = tokio::spawn(async move {
            while let Some(request) = net.recv().await {
                match request {
                    PairingNet::ClaimCode { reply, .. } => {
                        let _ = reply.send(true);
                    }
                    PairingNet::ForwardRequest { reply, .. } => {
                        let _ = reply.send(true);
                        break;
                    }
                    _ => {}
                }
            }
        });

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.pair_request(1, "XYZ567").await.expect("request");
        router.await.expect("router");

        registry.handle_remote_response("ABC234", "XYZ567", true).await;
        assert!(sink.messages_for(1).contains(&ServerMessage::PairMatched {
            peer_code: "XYZ567".to_string(),
            is_initiator: true,
        }));
        assert!(registry.is_paired("ABC234", "XYZ567"));
    }

    #[tokio::test]
    async fn test_connection_close_cancels_everything() {
        let harness = make_harness(fast_config());
        let _router = auto_grant(harness.net);
        let registry = harness.registry;
        let sink = harness.sink;

        registry.register(1, "ABC234", "PK_A").await.expect("alice");
        registry.register(2, "XYZ567", "PK_B").await.expect("bob");
        registry.pair_request(1, "XYZ567").await.expect("request");

        registry.connection_closed(1).await;

        // Code freed, request gone, target informed
        assert_eq!(registry.registered_codes(), 1);
        assert_eq!(registry.pending_requests(), 0);
        assert!(sink.messages_for(2).contains(&ServerMessage::PairRejected));
        assert!(registry.conn_for_code("ABC234").is_none());
    }

    #[tokio::test]
    async fn test_pair_view_claims() {
        let harness = make_harness(fast_config());
        let registry = harness.registry;
        let holder_a = ServerId::from_public_key(&[5u8; 32]);
        let holder_b = ServerId::from_public_key(&[6u8; 32]);

        assert!(registry.claim_code("ABC234", &holder_a));
        // Same holder re-claims fine; another holder is denied
        assert!(registry.claim_code("ABC234", &holder_a));
        assert!(!registry.claim_code("ABC234", &holder_b));
        assert_eq!(registry.lookup_holder("ABC234"), Some(holder_a.clone()));

        // Release by the wrong holder is a no-op
        registry.release_code("ABC234", &holder_b);
        assert_eq!(registry.lookup_holder("ABC234"), Some(holder_a.clone()));
        registry.release_code("ABC234", &holder_a);
        assert_eq!(registry.lookup_holder("ABC234"), None);
    }
}
