//! Directory-service client.
//!
//! Best-effort REST against the bootstrap directory: register at
//! startup, heartbeat on an interval (the response doubles as the gossip
//! seed list), deregister at shutdown. Every failure is logged and
//! retried with capped exponential backoff, forever by default or up to
//! `max_retries` when configured; nothing here is ever fatal — a cluster
//! keeps running with the directory down.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use wasl_gossip::GossipRunner;
use wasl_identity::keypair::derive_node_id;
use wasl_types::{MembershipEntry, PeerStatus, ServerId};

use crate::state::now_ms;

/// Backoff cap for directory retries.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Registration body for `POST /servers`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    server_id: &'a str,
    endpoint: &'a str,
    public_key: &'a str,
    region: &'a str,
}

/// Heartbeat body for `POST /servers/heartbeat`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    server_id: &'a str,
}

/// A peer entry in a heartbeat response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryPeer {
    pub server_id: String,
    pub endpoint: String,
    pub public_key: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    peers: Vec<DirectoryPeer>,
}

/// The directory client and its heartbeat loop.
pub struct BootstrapClient {
    http: reqwest::Client,
    base_url: String,
    server_id: ServerId,
    endpoint: String,
    public_key: String,
    region: String,
    heartbeat_interval: Duration,
    retry_interval: Duration,
    /// Registration attempts before giving up; `None` retries forever.
    max_retries: Option<u32>,
    runner: Arc<GossipRunner>,
}

impl BootstrapClient {
    /// Create a client. Returns `None` when no directory is configured.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: &str,
        server_id: ServerId,
        endpoint: String,
        public_key: String,
        region: String,
        heartbeat_interval: Duration,
        retry_interval: Duration,
        max_retries: Option<u32>,
        request_timeout: Duration,
        runner: Arc<GossipRunner>,
    ) -> Option<Self> {
        if base_url.is_empty() {
            return None;
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .ok()?;
        Some(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            server_id,
            endpoint,
            public_key,
            region,
            heartbeat_interval,
            retry_interval,
            max_retries,
            runner,
        })
    }

    /// Register, heartbeat until shutdown, then deregister.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        // Registration retries (forever unless max_retries caps it);
        // shutdown can interrupt at any point.
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                result = self.register() => {
                    match result {
                        Ok(()) => break,
                        Err(err) => {
                            attempt = attempt.saturating_add(1);
                            if self.retries_exhausted(attempt) {
                                tracing::error!(
                                    error = %err,
                                    attempt,
                                    "directory registration retries exhausted, giving up"
                                );
                                return;
                            }
                            let delay = self.backoff(attempt);
                            tracing::warn!(error = %err, ?delay, "directory registration failed");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.recv() => return,
                            }
                        }
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
        tracing::info!(directory = %self.base_url, "registered with directory");

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.heartbeat().await {
                        Ok(peers) => self.seed_peers(peers).await,
                        Err(err) => {
                            tracing::debug!(error = %err, "directory heartbeat failed");
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        if let Err(err) = self.deregister().await {
            tracing::debug!(error = %err, "directory deregistration failed");
        }
    }

    async fn register(&self) -> reqwest::Result<()> {
        self.http
            .post(format!("{}/servers", self.base_url))
            .json(&RegisterRequest {
                server_id: self.server_id.as_str(),
                endpoint: &self.endpoint,
                public_key: &self.public_key,
                region: &self.region,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn heartbeat(&self) -> reqwest::Result<Vec<DirectoryPeer>> {
        let response: HeartbeatResponse = self
            .http
            .post(format!("{}/servers/heartbeat", self.base_url))
            .json(&HeartbeatRequest {
                server_id: self.server_id.as_str(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.success {
            tracing::debug!("directory heartbeat reported failure");
        }
        Ok(response.peers)
    }

    async fn deregister(&self) -> reqwest::Result<()> {
        self.http
            .delete(format!("{}/servers/{}", self.base_url, self.server_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Feed directory peers into gossip as alive seeds.
    async fn seed_peers(&self, peers: Vec<DirectoryPeer>) {
        for peer in peers {
            let Some(entry) = directory_peer_entry(&peer) else {
                tracing::debug!(server_id = %peer.server_id, "skipping malformed directory peer");
                continue;
            };
            if entry.server_id == self.server_id {
                continue;
            }
            if let Err(err) = self.runner.add_seed(entry).await {
                tracing::debug!(error = %err, "seeding peer failed");
                return;
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_interval
            .saturating_mul(2u32.saturating_pow(attempt.min(8)))
            .min(MAX_RETRY_INTERVAL)
    }

    /// Whether `attempt` failures have used up the configured budget.
    fn retries_exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_retries, Some(max) if attempt > max)
    }
}

/// Convert a directory entry into a membership seed, validating that the
/// advertised id matches the public key.
pub fn directory_peer_entry(peer: &DirectoryPeer) -> Option<MembershipEntry> {
    let server_id = ServerId::parse(&peer.server_id).ok()?;
    let key = server_id.decode_public_key().ok()?;

    let mut metadata = std::collections::BTreeMap::new();
    if !peer.region.is_empty() {
        metadata.insert("region".to_string(), peer.region.clone());
    }

    Some(MembershipEntry {
        node_id: derive_node_id(&key),
        server_id,
        endpoint: peer.endpoint.clone(),
        public_key: peer.public_key.clone(),
        status: PeerStatus::Alive,
        incarnation: 0,
        last_seen_ms: now_ms(),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wasl_gossip::{GossipConfig, Membership};
    use wasl_identity::Keypair;

    fn make_client(max_retries: Option<u32>) -> BootstrapClient {
        let keypair = Arc::new(Keypair::from_secret_bytes(&[1u8; 32]));
        let local = MembershipEntry {
            server_id: keypair.server_id(),
            node_id: keypair.node_id(),
            endpoint: "ws://127.0.0.1:9443".to_string(),
            public_key: keypair.public_key_base64(),
            status: PeerStatus::Alive,
            incarnation: 0,
            last_seen_ms: 0,
            metadata: Default::default(),
        };
        let membership = Arc::new(tokio::sync::Mutex::new(Membership::new(
            GossipConfig::default(),
            local,
        )));
        let (out_tx, _out_rx) = mpsc::channel(4);
        let (event_tx, _event_rx) = mpsc::channel(4);
        let runner = Arc::new(GossipRunner::new(
            membership,
            Arc::clone(&keypair),
            GossipConfig::default(),
            out_tx,
            event_tx,
        ));

        BootstrapClient::new(
            "http://127.0.0.1:9",
            keypair.server_id(),
            "ws://127.0.0.1:9443".to_string(),
            keypair.public_key_base64(),
            String::new(),
            Duration::from_secs(60),
            Duration::from_secs(2),
            max_retries,
            Duration::from_secs(1),
            runner,
        )
        .expect("client")
    }

    #[test]
    fn test_retry_budget() {
        // No cap: never exhausted
        let unlimited = make_client(None);
        assert!(!unlimited.retries_exhausted(1_000_000));

        // max_retries bounds the retries after the initial attempt
        let capped = make_client(Some(3));
        assert!(!capped.retries_exhausted(1));
        assert!(!capped.retries_exhausted(3));
        assert!(capped.retries_exhausted(4));

        // Zero means one attempt, no retries
        let single_shot = make_client(Some(0));
        assert!(single_shot.retries_exhausted(1));
    }

    #[test]
    fn test_directory_peer_entry_valid() {
        let keypair = Keypair::from_secret_bytes(&[3u8; 32]);
        let peer = DirectoryPeer {
            server_id: keypair.server_id().to_string(),
            endpoint: "ws://203.0.113.9:9443".to_string(),
            public_key: keypair.public_key_base64(),
            region: "ap-south".to_string(),
        };

        let entry = directory_peer_entry(&peer).expect("valid peer");
        assert_eq!(entry.server_id, keypair.server_id());
        assert_eq!(entry.node_id, keypair.node_id());
        assert_eq!(entry.status, PeerStatus::Alive);
        assert_eq!(entry.metadata.get("region").map(String::as_str), Some("ap-south"));
    }

    #[test]
    fn test_directory_peer_entry_rejects_garbage_id() {
        let peer = DirectoryPeer {
            server_id: "not-a-server-id".to_string(),
            endpoint: "ws://x:1".to_string(),
            public_key: "zzz".to_string(),
            region: String::new(),
        };
        assert!(directory_peer_entry(&peer).is_none());
    }
}
