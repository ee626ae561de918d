//! Shared server state handed to every HTTP/WebSocket handler.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use wasl_gossip::{GossipRunner, Membership};
use wasl_identity::Keypair;
use wasl_pairing::{PairingRegistry, SignalingRelay};
use wasl_proto::PeerMessage;
use wasl_rendezvous::Engine;
use wasl_ring::HashRing;
use wasl_transport::PeerManager;
use wasl_types::ServerId;

use crate::client::ClientRegistry;
use crate::config::ServerConfig;

/// Process-wide counters not owned by a subsystem.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub rate_limit_trips: AtomicU64,
    pub protocol_strikes: AtomicU64,
    pub unknown_types: AtomicU64,
}

/// Everything the handlers need, dependency-injected so tests can run
/// several logical servers in one process.
pub struct AppState {
    pub config: ServerConfig,
    pub keypair: Arc<Keypair>,
    pub server_id: ServerId,
    pub ephemeral_id: String,
    pub started_at: Instant,

    pub clients: Arc<ClientRegistry>,
    pub pairing: Arc<PairingRegistry>,
    pub relay: SignalingRelay,
    pub engine: Arc<Engine>,

    pub membership: Arc<Mutex<Membership>>,
    pub runner: Arc<GossipRunner>,
    pub peers: Arc<PeerManager>,
    pub ring: Arc<RwLock<HashRing>>,

    /// Inbound peer frames (from accepted `/cluster` sockets and dialed
    /// connections) headed for the cluster router.
    pub inbound_peer: mpsc::Sender<(ServerId, PeerMessage)>,

    pub metrics: Metrics,
    pub shutdown: broadcast::Sender<()>,
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
