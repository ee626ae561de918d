//! Admin HTTP surface: `/health`, `/stats`, `/metrics`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::state::AppState;

/// `GET /health` — liveness probe.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "serverId": state.server_id.as_str(),
        "ephemeralId": state.ephemeral_id,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

/// `GET /stats` — connection and engine counters.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (member_count, alive_peers, drops) = {
        let membership = state.membership.lock().await;
        (
            membership.peer_count(),
            membership.alive_peers().len(),
            membership.counters(),
        )
    };
    let (ring_nodes, ring_alive) = {
        let ring = state.ring.read().await;
        (ring.len(), ring.alive_count())
    };
    let engine = state.engine.stats();

    Json(serde_json::json!({
        "serverId": state.server_id.as_str(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "clients": {
            "connected": state.clients.count(),
            "total": state.metrics.connections_total.load(Ordering::Relaxed),
        },
        "pairing": {
            "registeredCodes": state.pairing.registered_codes(),
            "pendingRequests": state.pairing.pending_requests(),
        },
        "cluster": {
            "members": member_count,
            "alivePeers": alive_peers,
            "connections": state.peers.connection_count().await,
            "ringNodes": ring_nodes,
            "ringAlive": ring_alive,
        },
        "rendezvous": {
            "dailyPublishes": engine.daily_publishes.load(Ordering::Relaxed),
            "hourlyPublishes": engine.hourly_publishes.load(Ordering::Relaxed),
            "queries": engine.queries.load(Ordering::Relaxed),
            "forwardsSent": engine.forwards_sent.load(Ordering::Relaxed),
            "forwardFailures": engine.forward_failures.load(Ordering::Relaxed),
        },
        "drops": {
            "badSignature": drops.bad_signature,
            "staleIncarnation": drops.stale_incarnation,
        },
    }))
}

/// `GET /metrics` — flat key/value text for scrapers.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let (member_count, alive_peers, drops) = {
        let membership = state.membership.lock().await;
        (
            membership.peer_count(),
            membership.alive_peers().len(),
            membership.counters(),
        )
    };
    let engine = state.engine.stats();

    let mut out = String::new();
    let mut line = |name: &str, value: u64| {
        out.push_str(name);
        out.push(' ');
        out.push_str(&value.to_string());
        out.push('\n');
    };

    line("wasl_uptime_seconds", state.started_at.elapsed().as_secs());
    line("wasl_clients_connected", state.clients.count() as u64);
    line(
        "wasl_clients_total",
        state.metrics.connections_total.load(Ordering::Relaxed),
    );
    line(
        "wasl_rate_limit_trips",
        state.metrics.rate_limit_trips.load(Ordering::Relaxed),
    );
    line(
        "wasl_protocol_strikes",
        state.metrics.protocol_strikes.load(Ordering::Relaxed),
    );
    line(
        "wasl_unknown_types",
        state.metrics.unknown_types.load(Ordering::Relaxed),
    );
    line("wasl_pairing_codes", state.pairing.registered_codes() as u64);
    line(
        "wasl_pairing_pending",
        state.pairing.pending_requests() as u64,
    );
    line("wasl_cluster_members", member_count as u64);
    line("wasl_cluster_alive", alive_peers as u64);
    line(
        "wasl_cluster_connections",
        state.peers.connection_count().await as u64,
    );
    line("wasl_gossip_drops_bad_signature", drops.bad_signature);
    line("wasl_gossip_drops_stale_incarnation", drops.stale_incarnation);
    line(
        "wasl_rv_daily_publishes",
        engine.daily_publishes.load(Ordering::Relaxed),
    );
    line(
        "wasl_rv_hourly_publishes",
        engine.hourly_publishes.load(Ordering::Relaxed),
    );
    line("wasl_rv_queries", engine.queries.load(Ordering::Relaxed));
    line(
        "wasl_rv_forwards_sent",
        engine.forwards_sent.load(Ordering::Relaxed),
    );
    line(
        "wasl_rv_forward_failures",
        engine.forward_failures.load(Ordering::Relaxed),
    );
    line(
        "wasl_rv_replications_handled",
        engine.replications_handled.load(Ordering::Relaxed),
    );

    out
}
