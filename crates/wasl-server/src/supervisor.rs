//! Server lifecycle.
//!
//! Builds every subsystem in dependency order (store → identity →
//! ring/membership → transport → engine/pairing → HTTP), runs the
//! periodic cleanup sweep, and tears everything down on shutdown:
//! broadcast the signal, close client sockets with a normal-closure
//! status, persist the membership snapshot, deregister from the
//! directory.
//!
//! Everything is dependency-injected through [`AppState`], so tests can
//! run several logical servers inside one process on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use wasl_gossip::{GossipRunner, Membership};
use wasl_identity::Keypair;
use wasl_pairing::{ClientSink, PairView, PairingRegistry, SignalingRelay};
use wasl_rendezvous::Engine;
use wasl_ring::{HashRing, RingNode};
use wasl_store::queries::identity as identity_queries;
use wasl_transport::{PeerManager, TransportConfig};
use wasl_types::{MembershipEntry, PeerStatus};

use crate::admin;
use crate::client::{handler::ws_handler, ClientRegistry, CLOSE_SHUTTING_DOWN};
use crate::cluster::{cluster_ws_handler, ClusterRouter};
use crate::config::ServerConfig;
use crate::state::{now_ms, AppState, Metrics};

/// A running wasl server.
pub struct Server {
    pub state: Arc<AppState>,
    pub local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Build and start every subsystem.
    ///
    /// # Errors
    ///
    /// Startup is all-or-nothing: an unreadable identity key or a broken
    /// store aborts here rather than booting a server that could desync
    /// the ring.
    pub async fn start(config: ServerConfig) -> anyhow::Result<Server> {
        anyhow::ensure!(
            config.storage.backend == "sqlite",
            "unsupported storage backend: {}",
            config.storage.backend
        );
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        // Identity: fatal if unreadable.
        let keypair = Arc::new(Keypair::load_or_generate(&config.key_path())?);
        let server_id = keypair.server_id();
        let ephemeral_id = Keypair::ephemeral_id(&config.identity.ephemeral_id_prefix);
        tracing::info!(server_id = %server_id, ephemeral_id, "starting wasl server");

        // Store: fatal if it cannot open or migrate.
        let store_conn = wasl_store::open(&data_dir.join("wasl.db"))?;
        if identity_queries::load(&store_conn)?.is_none() {
            // The key file is authoritative; the row makes the data dir
            // self-contained for backups.
            let secret_key: [u8; 32] = std::fs::read(config.key_path())?
                .try_into()
                .map_err(|_| anyhow::anyhow!("identity key file has wrong length"))?;
            identity_queries::save(
                &store_conn,
                &identity_queries::IdentityRow {
                    secret_key,
                    server_id: server_id.to_string(),
                    created_at_ms: now_ms(),
                },
            )?;
        }
        let membership_snapshot =
            wasl_store::queries::membership::load_all(&store_conn).unwrap_or_default();
        let store = Arc::new(Mutex::new(store_conn));

        // Ring seeded with the local node.
        let mut ring = HashRing::new(config.dht.virtual_nodes);
        ring.add_node(RingNode {
            server_id: server_id.clone(),
            node_id: keypair.node_id(),
            endpoint: config.public_endpoint(),
            status: PeerStatus::Alive,
        })
        .context("seeding local ring node")?;
        let ring = Arc::new(RwLock::new(ring));

        // Membership with the local entry.
        let local_entry = MembershipEntry {
            server_id: server_id.clone(),
            node_id: keypair.node_id(),
            endpoint: config.public_endpoint(),
            public_key: keypair.public_key_base64(),
            status: PeerStatus::Alive,
            incarnation: 0,
            last_seen_ms: now_ms(),
            metadata: region_metadata(&config.network.region),
        };
        let membership = Arc::new(Mutex::new(Membership::new(
            config.gossip_config(),
            local_entry,
        )));

        // Channels between subsystems.
        let (inbound_peer_tx, inbound_peer_rx) = mpsc::channel(256);
        let (gossip_out_tx, gossip_out_rx) = mpsc::channel(1024);
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (cluster_req_tx, cluster_req_rx) = mpsc::channel(64);
        let (pairing_net_tx, pairing_net_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel(4);

        let runner = Arc::new(GossipRunner::new(
            Arc::clone(&membership),
            Arc::clone(&keypair),
            config.gossip_config(),
            gossip_out_tx,
            events_tx,
        ));

        let peers = PeerManager::new(server_id.clone(), 64);

        let engine = Arc::new(Engine::new(
            server_id.clone(),
            config.replication_config(),
            Arc::clone(&store),
            Arc::clone(&ring),
            cluster_req_tx,
            now_ms(),
        ));

        let clients = Arc::new(ClientRegistry::new(
            config.client.outbound_queue,
            config.client.max_connections_per_peer,
        ));

        let pairing = PairingRegistry::new(
            server_id.clone(),
            config.pairing_config(),
            Arc::clone(&clients) as Arc<dyn ClientSink>,
            pairing_net_tx,
        );

        let relay = SignalingRelay::new(
            Arc::clone(&pairing) as Arc<dyn PairView>,
            Arc::clone(&clients) as Arc<dyn ClientSink>,
        );

        let state = Arc::new(AppState {
            config,
            keypair,
            server_id,
            ephemeral_id,
            started_at: Instant::now(),
            clients,
            pairing,
            relay,
            engine,
            membership,
            runner,
            peers,
            ring,
            inbound_peer: inbound_peer_tx,
            metrics: Metrics::default(),
            shutdown: shutdown_tx,
        });

        // Rehydrate membership from the snapshot (best effort).
        for entry in membership_snapshot {
            if entry.server_id == state.server_id {
                continue;
            }
            if let Err(err) = state.runner.add_seed(entry).await {
                tracing::debug!(error = %err, "snapshot seed failed");
            }
        }

        let mut tasks = Vec::new();

        // Gossip loop
        {
            let runner = Arc::clone(&state.runner);
            let shutdown = state.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                runner.run(shutdown).await;
            }));
        }

        // Cluster router
        {
            let router = ClusterRouter::new(
                Arc::clone(&state),
                inbound_peer_rx,
                gossip_out_rx,
                events_rx,
                cluster_req_rx,
                pairing_net_rx,
                TransportConfig::default(),
            );
            let shutdown = state.shutdown.subscribe();
            tasks.push(tokio::spawn(router.run(shutdown)));
        }

        // Cleanup sweep
        {
            let state = Arc::clone(&state);
            let mut shutdown = state.shutdown.subscribe();
            let interval = Duration::from_secs(state.config.cleanup.interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match state.engine.sweep_expired(now_ms()).await {
                                Ok((daily, hourly, relays)) if daily + hourly + relays > 0 => {
                                    tracing::info!(daily, hourly, relays, "cleanup sweep");
                                }
                                Ok(_) => {}
                                Err(err) => tracing::warn!(error = %err, "cleanup sweep failed"),
                            }
                        }
                        _ = shutdown.recv() => return,
                    }
                }
            }));
        }

        // Directory bootstrap (optional)
        if let Some(bootstrap) = crate::bootstrap::BootstrapClient::new(
            &state.config.bootstrap.server_url,
            state.server_id.clone(),
            state.config.public_endpoint(),
            state.keypair.public_key_base64(),
            state.config.network.region.clone(),
            Duration::from_secs(state.config.bootstrap.heartbeat_interval_secs),
            Duration::from_secs(state.config.bootstrap.retry_interval_secs),
            state.config.bootstrap.max_retries,
            Duration::from_secs(state.config.bootstrap.request_timeout_secs),
            Arc::clone(&state.runner),
        ) {
            let shutdown = state.shutdown.subscribe();
            tasks.push(tokio::spawn(bootstrap.run(shutdown)));
        }

        // HTTP listener: clients, cluster peers, admin.
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/cluster", get(cluster_ws_handler))
            .route("/health", get(admin::health))
            .route("/stats", get(admin::stats))
            .route("/metrics", get(admin::metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&state));

        let bind_addr = format!(
            "{}:{}",
            state.config.network.host, state.config.network.port
        );
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {bind_addr}"))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening");

        {
            let mut shutdown = state.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                });
                if let Err(err) = serve.await {
                    tracing::error!(error = %err, "HTTP server error");
                }
            }));
        }

        Ok(Server {
            state,
            local_addr,
            tasks,
        })
    }

    /// The HTTP/WebSocket base URL of this server.
    pub fn http_base(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// The WebSocket base URL of this server.
    pub fn ws_base(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Graceful shutdown: signal every task, close client sockets with a
    /// normal closure, persist the membership snapshot.
    pub async fn shutdown(self) {
        tracing::info!(server_id = %self.state.server_id, "shutting down");
        let _ = self.state.shutdown.send(());
        self.state.clients.close_all(CLOSE_SHUTTING_DOWN);

        // Final membership snapshot
        let snapshot = {
            let membership = self.state.membership.lock().await;
            membership.snapshot()
        };
        {
            let store = self.state.engine.store();
            let mut conn = store.lock().await;
            if let Err(err) = wasl_store::queries::membership::save_all(&mut conn, &snapshot) {
                tracing::warn!(error = %err, "final membership snapshot failed");
            }
        }

        // Let tasks drain (the bootstrap client deregisters from the
        // directory here), then cut off stragglers.
        for mut task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        tracing::info!("stopped");
    }
}

/// Run a server until Ctrl-C.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let server = Server::start(config).await?;
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

fn region_metadata(region: &str) -> std::collections::BTreeMap<String, String> {
    let mut metadata = std::collections::BTreeMap::new();
    if !region.is_empty() {
        metadata.insert("region".to_string(), region.to_string());
    }
    metadata
}
