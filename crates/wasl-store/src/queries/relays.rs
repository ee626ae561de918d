//! Relay registry queries.

use rusqlite::{Connection, OptionalExtension};

use wasl_types::RelayEntry;

use crate::Result;

/// Insert or replace a relay registration.
pub fn upsert_relay(conn: &Connection, entry: &RelayEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO relays
             (peer_id, max_connections, connected_count, public_key,
              registered_at_ms, last_update_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (peer_id) DO UPDATE SET
             max_connections = excluded.max_connections,
             connected_count = excluded.connected_count,
             public_key = excluded.public_key,
             last_update_ms = excluded.last_update_ms",
        rusqlite::params![
            entry.peer_id,
            entry.max_connections,
            entry.connected_count,
            entry.public_key,
            entry.registered_at_ms as i64,
            entry.last_update_ms as i64,
        ],
    )?;
    Ok(())
}

/// Update a relay's load figure. Returns false if the relay is unknown.
pub fn update_relay_load(
    conn: &Connection,
    peer_id: &str,
    connected_count: u32,
    now_ms: u64,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE relays SET connected_count = ?2, last_update_ms = ?3 WHERE peer_id = ?1",
        rusqlite::params![peer_id, connected_count, now_ms as i64],
    )?;
    Ok(updated > 0)
}

/// Get one relay.
pub fn get_relay(conn: &Connection, peer_id: &str) -> Result<Option<RelayEntry>> {
    let row = conn
        .query_row(
            "SELECT peer_id, max_connections, connected_count, public_key,
                    registered_at_ms, last_update_ms
             FROM relays WHERE peer_id = ?1",
            [peer_id],
            map_relay_row,
        )
        .optional()?;
    Ok(row)
}

/// Relays updated since `fresh_after_ms`, i.e. not gone dark.
pub fn list_fresh_relays(conn: &Connection, fresh_after_ms: u64) -> Result<Vec<RelayEntry>> {
    let mut stmt = conn.prepare(
        "SELECT peer_id, max_connections, connected_count, public_key,
                registered_at_ms, last_update_ms
         FROM relays WHERE last_update_ms >= ?1 ORDER BY peer_id",
    )?;
    let rows = stmt
        .query_map([fresh_after_ms as i64], map_relay_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Remove a relay registration. Returns false if it was not present.
pub fn delete_relay(conn: &Connection, peer_id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM relays WHERE peer_id = ?1", [peer_id])?;
    Ok(deleted > 0)
}

/// Remove relays whose last update is at or before `before_ms`.
pub fn delete_stale_relays(conn: &Connection, before_ms: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM relays WHERE last_update_ms <= ?1",
        [before_ms as i64],
    )?;
    Ok(deleted)
}

fn map_relay_row(row: &rusqlite::Row<'_>) -> std::result::Result<RelayEntry, rusqlite::Error> {
    Ok(RelayEntry {
        peer_id: row.get(0)?,
        max_connections: row.get(1)?,
        connected_count: row.get(2)?,
        public_key: row.get(3)?,
        registered_at_ms: row.get::<_, i64>(4)? as u64,
        last_update_ms: row.get::<_, i64>(5)? as u64,
    })
}
