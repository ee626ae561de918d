//! Server configuration.
//!
//! Loaded from a TOML file (`$WASL_DATA_DIR/config.toml` by default) with
//! environment-variable overrides for the handful of values that differ
//! per deployment. Every option has a default; a wasl server boots with
//! no config file at all.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener and advertised-endpoint settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Identity key location.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Directory-service settings.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    /// Failure-detector settings.
    #[serde(default)]
    pub gossip: GossipSection,
    /// Replication settings.
    #[serde(default)]
    pub dht: DhtConfig,
    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Client-connection settings.
    #[serde(default)]
    pub client: ClientConfig,
    /// Expiry-sweep settings.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port. 0 = OS-assigned (useful in tests).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Endpoint advertised to peers and the directory,
    /// e.g. `ws://203.0.113.7:9443`. Empty = derived from host:port.
    #[serde(default)]
    pub public_endpoint: String,
    /// Deployment region label carried in membership metadata.
    #[serde(default)]
    pub region: String,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Key file path. Empty = `$data_dir/server.key`.
    #[serde(default)]
    pub key_path: String,
    /// Prefix for the per-boot ephemeral id.
    #[serde(default = "default_ephemeral_prefix")]
    pub ephemeral_id_prefix: String,
}

/// Bootstrap (directory service) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Directory base URL. Empty disables bootstrap entirely.
    #[serde(default)]
    pub server_url: String,
    /// Heartbeat period in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// First retry delay in seconds (backs off exponentially, capped).
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// Registration attempts before giving up. Absent = retry forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_bootstrap_timeout")]
    pub request_timeout_secs: u64,
}

/// Gossip configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipSection {
    /// Probe tick in milliseconds.
    #[serde(default = "default_gossip_interval")]
    pub interval_ms: u64,
    /// Direct-probe timeout in milliseconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Probe-start to `suspect` in milliseconds.
    #[serde(default = "default_suspicion_timeout")]
    pub suspicion_timeout_ms: u64,
    /// `suspect` to `failed` in milliseconds.
    #[serde(default = "default_failure_timeout")]
    pub failure_timeout_ms: u64,
    /// Helpers per indirect probe.
    #[serde(default = "default_indirect_ping_count")]
    pub indirect_ping_count: usize,
    /// Anti-entropy period in seconds.
    #[serde(default = "default_state_exchange")]
    pub state_exchange_interval_secs: u64,
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,
    #[serde(default = "default_read_quorum")]
    pub read_quorum: usize,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    /// Cross-server RPC timeout in seconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend. Only `sqlite` is supported; anything else fails
    /// startup rather than running with a store that cannot hold the
    /// replication contract.
    #[serde(default = "default_storage_backend", rename = "type")]
    pub backend: String,
    /// Data directory. Empty = platform default.
    #[serde(default, rename = "path")]
    pub data_dir: String,
}

/// Client-connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Simultaneous connections allowed per client public key.
    #[serde(default = "default_max_connections_per_peer")]
    pub max_connections_per_peer: usize,
    /// Expected client heartbeat period in seconds (informational; the
    /// greeting does not advertise it yet).
    #[serde(default = "default_client_heartbeat")]
    pub heartbeat_interval_secs: u64,
    /// Idle window in seconds; a connection silent longer is closed.
    #[serde(default = "default_client_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Pair-request approval window in seconds.
    #[serde(default = "default_pair_timeout")]
    pub pair_request_timeout_secs: u64,
    /// Warning lead time in seconds.
    #[serde(default = "default_pair_warning")]
    pub pair_request_warning_secs: u64,
    /// Token-bucket refill: messages per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    /// Bounded outbound queue length per client.
    #[serde(default = "default_client_queue")]
    pub outbound_queue: usize,
}

/// Cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Sweep period in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

// Default value functions

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9443
}

fn default_ephemeral_prefix() -> String {
    "srv-".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_retry_interval() -> u64 {
    2
}

fn default_bootstrap_timeout() -> u64 {
    12
}

fn default_gossip_interval() -> u64 {
    1000
}

fn default_probe_timeout() -> u64 {
    1500
}

fn default_suspicion_timeout() -> u64 {
    5000
}

fn default_failure_timeout() -> u64 {
    10_000
}

fn default_indirect_ping_count() -> usize {
    2
}

fn default_state_exchange() -> u64 {
    30
}

fn default_replication_factor() -> usize {
    3
}

fn default_write_quorum() -> usize {
    2
}

fn default_read_quorum() -> usize {
    1
}

fn default_virtual_nodes() -> usize {
    150
}

fn default_rpc_timeout() -> u64 {
    5
}

fn default_max_connections_per_peer() -> usize {
    20
}

fn default_client_heartbeat() -> u64 {
    30
}

fn default_client_heartbeat_timeout() -> u64 {
    60
}

fn default_storage_backend() -> String {
    "sqlite".to_string()
}

fn default_pair_timeout() -> u64 {
    120
}

fn default_pair_warning() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    100
}

fn default_client_queue() -> usize {
    32
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_endpoint: String::new(),
            region: String::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: String::new(),
            ephemeral_id_prefix: default_ephemeral_prefix(),
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            retry_interval_secs: default_retry_interval(),
            max_retries: None,
            request_timeout_secs: default_bootstrap_timeout(),
        }
    }
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            interval_ms: default_gossip_interval(),
            probe_timeout_ms: default_probe_timeout(),
            suspicion_timeout_ms: default_suspicion_timeout(),
            failure_timeout_ms: default_failure_timeout(),
            indirect_ping_count: default_indirect_ping_count(),
            state_exchange_interval_secs: default_state_exchange(),
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            write_quorum: default_write_quorum(),
            read_quorum: default_read_quorum(),
            virtual_nodes: default_virtual_nodes(),
            rpc_timeout_secs: default_rpc_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: String::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections_per_peer: default_max_connections_per_peer(),
            heartbeat_interval_secs: default_client_heartbeat(),
            heartbeat_timeout_secs: default_client_heartbeat_timeout(),
            pair_request_timeout_secs: default_pair_timeout(),
            pair_request_warning_secs: default_pair_warning(),
            rate_limit_per_minute: default_rate_limit(),
            outbound_queue: default_client_queue(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl ServerConfig {
    /// Load configuration: file (if present), then env overrides.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or unparsable config files; a missing file is
    /// not an error.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `WASL_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("WASL_HOST") {
            self.network.host = host;
        }
        if let Ok(port) = std::env::var("WASL_PORT") {
            if let Ok(port) = port.parse() {
                self.network.port = port;
            }
        }
        if let Ok(endpoint) = std::env::var("WASL_PUBLIC_ENDPOINT") {
            self.network.public_endpoint = endpoint;
        }
        if let Ok(region) = std::env::var("WASL_REGION") {
            self.network.region = region;
        }
        if let Ok(url) = std::env::var("WASL_BOOTSTRAP_URL") {
            self.bootstrap.server_url = url;
        }
        if let Ok(dir) = std::env::var("WASL_DATA_DIR") {
            self.storage.data_dir = dir;
        }
    }

    /// The advertised endpoint, derived from host:port when not set.
    pub fn public_endpoint(&self) -> String {
        if self.network.public_endpoint.is_empty() {
            format!("ws://{}:{}", self.network.host, self.network.port)
        } else {
            self.network.public_endpoint.clone()
        }
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// Resolved identity key path.
    pub fn key_path(&self) -> PathBuf {
        if self.identity.key_path.is_empty() {
            self.data_dir().join("server.key")
        } else {
            PathBuf::from(&self.identity.key_path)
        }
    }

    /// Gossip tunables in `wasl-gossip` form.
    pub fn gossip_config(&self) -> wasl_gossip::GossipConfig {
        wasl_gossip::GossipConfig {
            tick_interval: Duration::from_millis(self.gossip.interval_ms),
            probe_timeout: Duration::from_millis(self.gossip.probe_timeout_ms),
            suspicion_timeout: Duration::from_millis(self.gossip.suspicion_timeout_ms),
            failure_timeout: Duration::from_millis(self.gossip.failure_timeout_ms),
            indirect_ping_count: self.gossip.indirect_ping_count,
            state_exchange_interval: Duration::from_secs(self.gossip.state_exchange_interval_secs),
            failed_gc_horizon: Duration::from_millis(self.gossip.failure_timeout_ms * 10),
            max_piggyback: 8,
        }
    }

    /// Replication tunables in `wasl-rendezvous` form.
    pub fn replication_config(&self) -> wasl_rendezvous::ReplicationConfig {
        wasl_rendezvous::ReplicationConfig {
            replication_factor: self.dht.replication_factor,
            write_quorum: self.dht.write_quorum,
            read_quorum: self.dht.read_quorum,
            rpc_timeout: Duration::from_secs(self.dht.rpc_timeout_secs),
            ..wasl_rendezvous::ReplicationConfig::default()
        }
    }

    /// Pairing tunables in `wasl-pairing` form.
    pub fn pairing_config(&self) -> wasl_pairing::PairingConfig {
        wasl_pairing::PairingConfig {
            request_timeout: Duration::from_secs(self.client.pair_request_timeout_secs),
            warning_time: Duration::from_secs(self.client.pair_request_warning_secs),
            ..wasl_pairing::PairingConfig::default()
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("WASL_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("WASL_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".wasl"))
            .unwrap_or_else(|_| PathBuf::from("/var/lib/wasl"))
    }
}
