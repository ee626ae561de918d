//! The rendezvous engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use wasl_proto::Redirect;
use wasl_ring::{HashRing, RingNode};
use wasl_store::queries::{relays as relay_queries, rendezvous as rv_queries};
use wasl_types::{
    DailyPointEntry, DeadDropHit, HourlyTokenEntry, LiveMatch, PeerId, RelayEntry, ServerId,
    VectorClock, DAILY_POINT_TTL_MS, HOURLY_TOKEN_TTL_MS,
};

use crate::{ClusterRequest, RendezvousError, ReplicationConfig, Result};

/// Result of a publish: how many owners acked, and whether that met the
/// write quorum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Acks received, local write included.
    pub acks: usize,
    /// The quorum actually required (bounded by cluster size).
    pub quorum_target: usize,
    /// Whether `acks >= quorum_target`.
    pub quorum_met: bool,
}

/// Result of a query: resolved hits plus redirects for what this server
/// could not answer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOutcome {
    pub dead_drops: Vec<DeadDropHit>,
    pub live_matches: Vec<LiveMatch>,
    pub redirects: Vec<Redirect>,
}

impl QueryOutcome {
    /// Whether every queried key was resolved here or via forwards.
    pub fn is_complete(&self) -> bool {
        self.redirects.is_empty()
    }
}

/// Running counters exposed via `/stats`.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub daily_publishes: AtomicU64,
    pub hourly_publishes: AtomicU64,
    pub queries: AtomicU64,
    pub forwards_sent: AtomicU64,
    pub forward_failures: AtomicU64,
    pub replications_handled: AtomicU64,
}

/// The rendezvous engine. One per server process.
pub struct Engine {
    server_id: ServerId,
    config: ReplicationConfig,
    store: Arc<Mutex<Connection>>,
    ring: Arc<RwLock<HashRing>>,
    cluster: mpsc::Sender<ClusterRequest>,
    /// Per-writer monotonic counter seeding vector clocks. Seeded from
    /// wall time at boot so a restarted server never reuses a counter.
    write_counter: AtomicU64,
    stats: EngineStats,
}

impl Engine {
    /// Create an engine.
    pub fn new(
        server_id: ServerId,
        config: ReplicationConfig,
        store: Arc<Mutex<Connection>>,
        ring: Arc<RwLock<HashRing>>,
        cluster: mpsc::Sender<ClusterRequest>,
        now_ms: u64,
    ) -> Self {
        Self {
            server_id,
            config,
            store,
            ring,
            cluster,
            write_counter: AtomicU64::new(now_ms),
            stats: EngineStats::default(),
        }
    }

    /// Counter snapshot for `/stats`.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Shared handle to the underlying store connection.
    pub fn store(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.store)
    }

    /// Publish a daily point on behalf of a client.
    ///
    /// Writes locally when this server is among the key's owners, fans
    /// out to the remaining owners, and reports quorum.
    ///
    /// # Errors
    ///
    /// Only local write failures error; unreachable replicas just reduce
    /// the ack count.
    pub async fn publish_daily(
        &self,
        point_hash: &str,
        peer_id: &PeerId,
        dead_drop: Option<String>,
        relay_id: Option<PeerId>,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<PublishOutcome> {
        self.stats.daily_publishes.fetch_add(1, Ordering::Relaxed);

        let ttl = ttl_ms.unwrap_or(DAILY_POINT_TTL_MS).min(DAILY_POINT_TTL_MS);
        let entry = DailyPointEntry {
            point_hash: point_hash.to_string(),
            peer_id: peer_id.clone(),
            dead_drop,
            relay_id,
            expires_at_ms: now_ms + ttl,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            vector_clock: self.next_clock(),
        };

        let owners = self.owners(point_hash).await;
        let (local_write, remote) = self.split_owners(&owners);

        let mut acks = 0;
        if local_write {
            let mut conn = self.store.lock().await;
            rv_queries::upsert_daily_point(&mut conn, &entry)?;
            acks += 1;
        }

        acks += self
            .replicate(remote, vec![entry], Vec::new(), Vec::new())
            .await;

        Ok(self.outcome(acks, owners.len()))
    }

    /// Publish an hourly token on behalf of a client.
    ///
    /// # Errors
    ///
    /// Same contract as [`Engine::publish_daily`].
    pub async fn publish_hourly(
        &self,
        token_hash: &str,
        peer_id: &PeerId,
        relay_id: Option<PeerId>,
        ttl_ms: Option<u64>,
        now_ms: u64,
    ) -> Result<PublishOutcome> {
        self.stats.hourly_publishes.fetch_add(1, Ordering::Relaxed);

        let ttl = ttl_ms.unwrap_or(HOURLY_TOKEN_TTL_MS).min(HOURLY_TOKEN_TTL_MS);
        let entry = HourlyTokenEntry {
            token_hash: token_hash.to_string(),
            peer_id: peer_id.clone(),
            relay_id,
            expires_at_ms: now_ms + ttl,
            created_at_ms: now_ms,
            vector_clock: self.next_clock(),
        };

        let owners = self.owners(token_hash).await;
        let (local_write, remote) = self.split_owners(&owners);

        let mut acks = 0;
        if local_write {
            let mut conn = self.store.lock().await;
            rv_queries::upsert_hourly_token(&mut conn, &entry)?;
            acks += 1;
        }

        acks += self
            .replicate(remote, Vec::new(), vec![entry], Vec::new())
            .await;

        Ok(self.outcome(acks, owners.len()))
    }

    /// Resolve a batch of daily-point and hourly-token hashes.
    ///
    /// Keys this server owns are read locally (failing open to empty).
    /// Keys owned elsewhere fan out to up to `read_quorum` of their
    /// owners in parallel; the results are unioned and de-duplicated by
    /// `(hash, peer_id)` under vector-clock merge. A key none of whose
    /// contacted owners answered comes back as a redirect for the client
    /// to chase itself.
    pub async fn query(
        &self,
        daily_points: &[String],
        hourly_tokens: &[String],
        now_ms: u64,
    ) -> QueryOutcome {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let mut daily_entries: Vec<DailyPointEntry> = Vec::new();
        let mut hourly_entries: Vec<HourlyTokenEntry> = Vec::new();
        // Remote work grouped per owner server, one batch each
        let mut forwards: BTreeMap<ServerId, (RingNode, Vec<String>, Vec<String>)> =
            BTreeMap::new();
        // Which owners each remote key was assigned to, for redirects
        let mut remote_daily: Vec<(String, Vec<RingNode>)> = Vec::new();
        let mut remote_hourly: Vec<(String, Vec<RingNode>)> = Vec::new();

        for hash in daily_points {
            match self.route(hash).await {
                KeyRoute::Local => {
                    let conn = self.store.lock().await;
                    daily_entries.extend(
                        rv_queries::daily_points_for(&conn, hash, now_ms).unwrap_or_default(),
                    );
                }
                KeyRoute::Remote(owners) => {
                    for owner in &owners {
                        let slot = forwards
                            .entry(owner.server_id.clone())
                            .or_insert_with(|| (owner.clone(), Vec::new(), Vec::new()));
                        slot.1.push(hash.clone());
                    }
                    remote_daily.push((hash.clone(), owners));
                }
            }
        }
        for hash in hourly_tokens {
            match self.route(hash).await {
                KeyRoute::Local => {
                    let conn = self.store.lock().await;
                    hourly_entries.extend(
                        rv_queries::hourly_tokens_for(&conn, hash, now_ms).unwrap_or_default(),
                    );
                }
                KeyRoute::Remote(owners) => {
                    for owner in &owners {
                        let slot = forwards
                            .entry(owner.server_id.clone())
                            .or_insert_with(|| (owner.clone(), Vec::new(), Vec::new()));
                        slot.2.push(hash.clone());
                    }
                    remote_hourly.push((hash.clone(), owners));
                }
            }
        }

        // All owner batches in parallel; any answer resolves its keys.
        let batches: Vec<(ServerId, Vec<String>, Vec<String>)> = forwards
            .into_values()
            .map(|(owner, daily, hourly)| (owner.server_id, daily, hourly))
            .collect();
        self.stats
            .forwards_sent
            .fetch_add(batches.len() as u64, Ordering::Relaxed);

        let answers = join_all(batches.iter().map(|(server_id, daily, hourly)| async move {
            (
                server_id.clone(),
                self.forward_query(server_id, daily, hourly).await,
            )
        }))
        .await;

        let mut reached: BTreeSet<ServerId> = BTreeSet::new();
        for (server_id, answer) in answers {
            match answer {
                Some((owner_daily, owner_hourly)) => {
                    daily_entries.extend(owner_daily);
                    hourly_entries.extend(owner_hourly);
                    reached.insert(server_id);
                }
                None => {
                    self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Redirect the keys none of whose owners answered, grouped under
        // the key's primary owner.
        let mut redirect_map: BTreeMap<ServerId, Redirect> = BTreeMap::new();
        for (hash, owners) in remote_daily {
            if let Some(primary) = unreached_primary(&owners, &reached) {
                redirect_slot(&mut redirect_map, primary)
                    .daily_points
                    .push(hash);
            }
        }
        for (hash, owners) in remote_hourly {
            if let Some(primary) = unreached_primary(&owners, &reached) {
                redirect_slot(&mut redirect_map, primary)
                    .hourly_tokens
                    .push(hash);
            }
        }

        QueryOutcome {
            dead_drops: dedup_daily(daily_entries, now_ms),
            live_matches: dedup_hourly(hourly_entries, now_ms),
            redirects: redirect_map.into_values().collect(),
        }
    }

    /// Register (or refresh) a client relay and replicate it.
    ///
    /// # Errors
    ///
    /// Local write failures only.
    pub async fn announce_relay(
        &self,
        peer_id: &PeerId,
        max_connections: u32,
        public_key: Option<String>,
        now_ms: u64,
    ) -> Result<()> {
        let entry = RelayEntry {
            peer_id: peer_id.clone(),
            max_connections,
            connected_count: 0,
            public_key,
            registered_at_ms: now_ms,
            last_update_ms: now_ms,
        };

        {
            let conn = self.store.lock().await;
            relay_queries::upsert_relay(&conn, &entry)?;
        }

        let owners = self.owners(peer_id).await;
        let (_, remote) = self.split_owners(&owners);
        self.replicate(remote, Vec::new(), Vec::new(), vec![entry])
            .await;
        Ok(())
    }

    /// Update a relay's load figure and replicate it.
    ///
    /// Returns false if the relay was never announced here.
    ///
    /// # Errors
    ///
    /// Local write failures only.
    pub async fn update_relay_load(
        &self,
        peer_id: &PeerId,
        connected_count: u32,
        now_ms: u64,
    ) -> Result<bool> {
        let entry = {
            let conn = self.store.lock().await;
            if !relay_queries::update_relay_load(&conn, peer_id, connected_count, now_ms)? {
                return Ok(false);
            }
            relay_queries::get_relay(&conn, peer_id)?
        };

        if let Some(entry) = entry {
            let owners = self.owners(peer_id).await;
            let (_, remote) = self.split_owners(&owners);
            self.replicate(remote, Vec::new(), Vec::new(), vec![entry])
                .await;
        }
        Ok(true)
    }

    /// Pick up to `limit` random relays with spare capacity.
    pub async fn pick_available_relays(
        &self,
        exclude: &[PeerId],
        max_cap_ratio: f64,
        limit: usize,
        now_ms: u64,
    ) -> Vec<RelayEntry> {
        let fresh_after = now_ms.saturating_sub(self.config.relay_freshness.as_millis() as u64);
        let mut candidates: Vec<RelayEntry> = {
            let conn = self.store.lock().await;
            relay_queries::list_fresh_relays(&conn, fresh_after).unwrap_or_default()
        };
        candidates.retain(|r| r.has_capacity(max_cap_ratio) && !exclude.contains(&r.peer_id));
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(limit);
        candidates
    }

    /// Drop a relay registration (client disconnected).
    ///
    /// # Errors
    ///
    /// Local write failures only.
    pub async fn relay_disconnect(&self, peer_id: &PeerId) -> Result<()> {
        let conn = self.store.lock().await;
        relay_queries::delete_relay(&conn, peer_id)?;
        Ok(())
    }

    /// Apply a replication batch from a peer. Returns the ack value.
    pub async fn handle_replicate(
        &self,
        daily_points: Vec<DailyPointEntry>,
        hourly_tokens: Vec<HourlyTokenEntry>,
        relays: Vec<RelayEntry>,
    ) -> bool {
        self.stats
            .replications_handled
            .fetch_add(1, Ordering::Relaxed);

        let mut conn = self.store.lock().await;
        for entry in &daily_points {
            if let Err(err) = rv_queries::upsert_daily_point(&mut conn, entry) {
                tracing::warn!(error = %err, "replicated daily point rejected");
                return false;
            }
        }
        for entry in &hourly_tokens {
            if let Err(err) = rv_queries::upsert_hourly_token(&mut conn, entry) {
                tracing::warn!(error = %err, "replicated hourly token rejected");
                return false;
            }
        }
        for entry in &relays {
            if let Err(err) = relay_queries::upsert_relay(&conn, entry) {
                tracing::warn!(error = %err, "replicated relay rejected");
                return false;
            }
        }
        true
    }

    /// Answer a forwarded query with local entries (fail-open).
    pub async fn handle_query_forward(
        &self,
        daily_points: &[String],
        hourly_tokens: &[String],
        now_ms: u64,
    ) -> (Vec<DailyPointEntry>, Vec<HourlyTokenEntry>) {
        let conn = self.store.lock().await;
        let mut daily = Vec::new();
        for hash in daily_points {
            daily.extend(rv_queries::daily_points_for(&conn, hash, now_ms).unwrap_or_default());
        }
        let mut hourly = Vec::new();
        for hash in hourly_tokens {
            hourly.extend(rv_queries::hourly_tokens_for(&conn, hash, now_ms).unwrap_or_default());
        }
        (daily, hourly)
    }

    /// Delete expired records. Returns `(daily, hourly, relays)` counts.
    ///
    /// # Errors
    ///
    /// Store failures propagate; the sweep is retried next interval.
    pub async fn sweep_expired(&self, now_ms: u64) -> Result<(usize, usize, usize)> {
        let relay_cutoff = now_ms.saturating_sub(self.config.relay_freshness.as_millis() as u64);
        let conn = self.store.lock().await;
        let daily = rv_queries::delete_expired_daily_points(&conn, now_ms)?;
        let hourly = rv_queries::delete_expired_hourly_tokens(&conn, now_ms)?;
        let relays = relay_queries::delete_stale_relays(&conn, relay_cutoff)?;
        Ok((daily, hourly, relays))
    }

    fn next_clock(&self) -> VectorClock {
        let counter = self.write_counter.fetch_add(1, Ordering::Relaxed) + 1;
        VectorClock::single(self.server_id.as_str(), counter)
    }

    async fn owners(&self, key: &str) -> Vec<RingNode> {
        let ring = self.ring.read().await;
        ring.responsible_nodes(key, self.config.replication_factor)
    }

    /// Split owners into (local write?, remote owner list). An empty
    /// owner set (single node, ring not formed yet) writes locally.
    fn split_owners(&self, owners: &[RingNode]) -> (bool, Vec<RingNode>) {
        if owners.is_empty() {
            return (true, Vec::new());
        }
        let local = owners.iter().any(|n| n.server_id == self.server_id);
        let remote = owners
            .iter()
            .filter(|n| n.server_id != self.server_id)
            .cloned()
            .collect();
        (local, remote)
    }

    fn outcome(&self, acks: usize, owner_count: usize) -> PublishOutcome {
        let quorum_target = self.config.write_quorum.min(owner_count.max(1));
        PublishOutcome {
            acks,
            quorum_target,
            quorum_met: acks >= quorum_target,
        }
    }

    /// Fan a replication batch to remote owners; returns the ack count.
    async fn replicate(
        &self,
        owners: Vec<RingNode>,
        daily_points: Vec<DailyPointEntry>,
        hourly_tokens: Vec<HourlyTokenEntry>,
        relays: Vec<RelayEntry>,
    ) -> usize {
        if owners.is_empty() {
            return 0;
        }

        let requests = owners.into_iter().map(|owner| {
            let daily = daily_points.clone();
            let hourly = hourly_tokens.clone();
            let relays = relays.clone();
            async move {
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = ClusterRequest::Replicate {
                    to: owner.server_id.clone(),
                    daily_points: daily,
                    hourly_tokens: hourly,
                    relays,
                    reply: reply_tx,
                };
                if self.cluster.send(request).await.is_err() {
                    return false;
                }
                matches!(
                    tokio::time::timeout(self.config.rpc_timeout, reply_rx).await,
                    Ok(Ok(true))
                )
            }
        });

        join_all(requests).await.into_iter().filter(|ok| *ok).count()
    }

    async fn forward_query(
        &self,
        to: &ServerId,
        daily_points: &[String],
        hourly_tokens: &[String],
    ) -> Option<(Vec<DailyPointEntry>, Vec<HourlyTokenEntry>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ClusterRequest::QueryForward {
            to: to.clone(),
            daily_points: daily_points.to_vec(),
            hourly_tokens: hourly_tokens.to_vec(),
            reply: reply_tx,
        };
        self.cluster.send(request).await.ok()?;
        match tokio::time::timeout(self.config.rpc_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            _ => None,
        }
    }

    /// Route a key: serve locally if we are an owner (or the ring is
    /// empty and a single node serves everything itself), else name up
    /// to `read_quorum` remote owners to consult, primary first.
    async fn route(&self, key: &str) -> KeyRoute {
        let owners = self.owners(key).await;
        if owners.is_empty() {
            return KeyRoute::Local;
        }
        if owners.iter().any(|n| n.server_id == self.server_id) {
            return KeyRoute::Local;
        }
        let quorum = self.config.read_quorum.max(1);
        KeyRoute::Remote(owners.into_iter().take(quorum).collect())
    }
}

enum KeyRoute {
    Local,
    Remote(Vec<RingNode>),
}

/// The primary owner of a key whose owners were all unreachable, if so.
fn unreached_primary<'a>(
    owners: &'a [RingNode],
    reached: &BTreeSet<ServerId>,
) -> Option<&'a RingNode> {
    if owners.iter().any(|o| reached.contains(&o.server_id)) {
        return None;
    }
    owners.first()
}

fn redirect_slot<'a>(
    redirect_map: &'a mut BTreeMap<ServerId, Redirect>,
    owner: &RingNode,
) -> &'a mut Redirect {
    redirect_map
        .entry(owner.server_id.clone())
        .or_insert_with(|| Redirect {
            server_id: owner.server_id.clone(),
            endpoint: owner.endpoint.clone(),
            daily_points: Vec::new(),
            hourly_tokens: Vec::new(),
        })
}

/// De-duplicate daily entries by `(point_hash, peer_id)`, merging clocks.
fn dedup_daily(entries: Vec<DailyPointEntry>, now_ms: u64) -> Vec<DeadDropHit> {
    let mut by_key: BTreeMap<(String, String), DailyPointEntry> = BTreeMap::new();
    for entry in entries {
        if entry.is_expired(now_ms) {
            continue;
        }
        let key = (entry.point_hash.clone(), entry.peer_id.clone());
        match by_key.remove(&key) {
            Some(existing) => {
                by_key.insert(key, existing.merge(entry));
            }
            None => {
                by_key.insert(key, entry);
            }
        }
    }
    by_key.values().map(DeadDropHit::from).collect()
}

/// De-duplicate hourly entries by `(token_hash, peer_id)`, merging clocks.
fn dedup_hourly(entries: Vec<HourlyTokenEntry>, now_ms: u64) -> Vec<LiveMatch> {
    let mut by_key: BTreeMap<(String, String), HourlyTokenEntry> = BTreeMap::new();
    for entry in entries {
        if entry.is_expired(now_ms) {
            continue;
        }
        let key = (entry.token_hash.clone(), entry.peer_id.clone());
        match by_key.remove(&key) {
            Some(existing) => {
                by_key.insert(key, existing.merge(entry));
            }
            None => {
                by_key.insert(key, entry);
            }
        }
    }
    by_key.values().map(LiveMatch::from).collect()
}
