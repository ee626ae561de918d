//! SQL schema definitions.

/// Complete schema for the wasl v1 database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Server identity
-- ============================================================

CREATE TABLE IF NOT EXISTS server_identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    secret_key BLOB NOT NULL,
    server_id TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

-- ============================================================
-- Membership snapshot (rehydrates gossip seeds on restart)
-- ============================================================

CREATE TABLE IF NOT EXISTS membership (
    server_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    public_key TEXT NOT NULL,
    status TEXT NOT NULL,
    incarnation INTEGER NOT NULL,
    last_seen_ms INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

-- ============================================================
-- Rendezvous records
-- ============================================================

CREATE TABLE IF NOT EXISTS daily_points (
    point_hash TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    dead_drop TEXT,
    relay_id TEXT,
    expires_at_ms INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    vector_clock TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (point_hash, peer_id)
);

CREATE INDEX IF NOT EXISTS idx_daily_points_expiry ON daily_points(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_daily_points_peer ON daily_points(peer_id);

CREATE TABLE IF NOT EXISTS hourly_tokens (
    token_hash TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    relay_id TEXT,
    expires_at_ms INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    vector_clock TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (token_hash, peer_id)
);

CREATE INDEX IF NOT EXISTS idx_hourly_tokens_expiry ON hourly_tokens(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_hourly_tokens_peer ON hourly_tokens(peer_id);

CREATE TABLE IF NOT EXISTS relays (
    peer_id TEXT PRIMARY KEY,
    max_connections INTEGER NOT NULL,
    connected_count INTEGER NOT NULL,
    public_key TEXT,
    registered_at_ms INTEGER NOT NULL,
    last_update_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relays_last_update ON relays(last_update_ms);
"#;
