//! Daily-point and hourly-token queries.
//!
//! Upserts merge vector clocks inside a transaction, so concurrent
//! replicas of the same `(hash, peer)` key always converge to the same
//! row regardless of arrival order. Reads filter expired rows; the
//! cleanup sweep deletes them for real.

use rusqlite::{Connection, OptionalExtension};

use wasl_types::{DailyPointEntry, HourlyTokenEntry, VectorClock};

use crate::{Result, StoreError};

/// Insert or merge a daily point.
///
/// Returns the row as stored after the merge.
pub fn upsert_daily_point(conn: &mut Connection, entry: &DailyPointEntry) -> Result<DailyPointEntry> {
    let tx = conn.transaction()?;

    let existing = tx
        .query_row(
            "SELECT dead_drop, relay_id, expires_at_ms, created_at_ms, updated_at_ms, vector_clock
             FROM daily_points WHERE point_hash = ?1 AND peer_id = ?2",
            rusqlite::params![entry.point_hash, entry.peer_id],
            |row| {
                Ok(DailyPointEntry {
                    point_hash: entry.point_hash.clone(),
                    peer_id: entry.peer_id.clone(),
                    dead_drop: row.get(0)?,
                    relay_id: row.get(1)?,
                    expires_at_ms: row.get::<_, i64>(2)? as u64,
                    created_at_ms: row.get::<_, i64>(3)? as u64,
                    updated_at_ms: row.get::<_, i64>(4)? as u64,
                    vector_clock: decode_clock_sql(row.get::<_, String>(5)?)?,
                })
            },
        )
        .optional()?;

    let merged = match existing {
        Some(current) => current.merge(entry.clone()),
        None => entry.clone(),
    };

    tx.execute(
        "INSERT INTO daily_points
             (point_hash, peer_id, dead_drop, relay_id, expires_at_ms,
              created_at_ms, updated_at_ms, vector_clock)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT (point_hash, peer_id) DO UPDATE SET
             dead_drop = excluded.dead_drop,
             relay_id = excluded.relay_id,
             expires_at_ms = excluded.expires_at_ms,
             created_at_ms = excluded.created_at_ms,
             updated_at_ms = excluded.updated_at_ms,
             vector_clock = excluded.vector_clock",
        rusqlite::params![
            merged.point_hash,
            merged.peer_id,
            merged.dead_drop,
            merged.relay_id,
            merged.expires_at_ms as i64,
            merged.created_at_ms as i64,
            merged.updated_at_ms as i64,
            encode_clock(&merged.vector_clock)?,
        ],
    )?;

    tx.commit()?;
    Ok(merged)
}

/// All unexpired daily points at `point_hash`.
pub fn daily_points_for(
    conn: &Connection,
    point_hash: &str,
    now_ms: u64,
) -> Result<Vec<DailyPointEntry>> {
    let mut stmt = conn.prepare(
        "SELECT point_hash, peer_id, dead_drop, relay_id, expires_at_ms,
                created_at_ms, updated_at_ms, vector_clock
         FROM daily_points
         WHERE point_hash = ?1 AND expires_at_ms > ?2
         ORDER BY peer_id",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![point_hash, now_ms as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(point_hash, peer_id, dead_drop, relay_id, expires, created, updated, clock)| {
            Ok(DailyPointEntry {
                point_hash,
                peer_id,
                dead_drop,
                relay_id,
                expires_at_ms: expires as u64,
                created_at_ms: created as u64,
                updated_at_ms: updated as u64,
                vector_clock: decode_clock(&clock)?,
            })
        })
        .collect()
}

/// Delete daily points expiring at or before `before_ms`. Returns the count.
pub fn delete_expired_daily_points(conn: &Connection, before_ms: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM daily_points WHERE expires_at_ms <= ?1",
        [before_ms as i64],
    )?;
    Ok(deleted)
}

/// Delete every daily point a peer published. Returns the count.
pub fn delete_peer_daily_points(conn: &Connection, peer_id: &str) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM daily_points WHERE peer_id = ?1", [peer_id])?;
    Ok(deleted)
}

/// Insert or merge an hourly token.
///
/// Returns the row as stored after the merge.
pub fn upsert_hourly_token(
    conn: &mut Connection,
    entry: &HourlyTokenEntry,
) -> Result<HourlyTokenEntry> {
    let tx = conn.transaction()?;

    let existing = tx
        .query_row(
            "SELECT relay_id, expires_at_ms, created_at_ms, vector_clock
             FROM hourly_tokens WHERE token_hash = ?1 AND peer_id = ?2",
            rusqlite::params![entry.token_hash, entry.peer_id],
            |row| {
                Ok(HourlyTokenEntry {
                    token_hash: entry.token_hash.clone(),
                    peer_id: entry.peer_id.clone(),
                    relay_id: row.get(0)?,
                    expires_at_ms: row.get::<_, i64>(1)? as u64,
                    created_at_ms: row.get::<_, i64>(2)? as u64,
                    vector_clock: decode_clock_sql(row.get::<_, String>(3)?)?,
                })
            },
        )
        .optional()?;

    let merged = match existing {
        Some(current) => current.merge(entry.clone()),
        None => entry.clone(),
    };

    tx.execute(
        "INSERT INTO hourly_tokens
             (token_hash, peer_id, relay_id, expires_at_ms, created_at_ms, vector_clock)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (token_hash, peer_id) DO UPDATE SET
             relay_id = excluded.relay_id,
             expires_at_ms = excluded.expires_at_ms,
             created_at_ms = excluded.created_at_ms,
             vector_clock = excluded.vector_clock",
        rusqlite::params![
            merged.token_hash,
            merged.peer_id,
            merged.relay_id,
            merged.expires_at_ms as i64,
            merged.created_at_ms as i64,
            encode_clock(&merged.vector_clock)?,
        ],
    )?;

    tx.commit()?;
    Ok(merged)
}

/// All unexpired hourly tokens at `token_hash`.
pub fn hourly_tokens_for(
    conn: &Connection,
    token_hash: &str,
    now_ms: u64,
) -> Result<Vec<HourlyTokenEntry>> {
    let mut stmt = conn.prepare(
        "SELECT token_hash, peer_id, relay_id, expires_at_ms, created_at_ms, vector_clock
         FROM hourly_tokens
         WHERE token_hash = ?1 AND expires_at_ms > ?2
         ORDER BY peer_id",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![token_hash, now_ms as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(token_hash, peer_id, relay_id, expires, created, clock)| {
            Ok(HourlyTokenEntry {
                token_hash,
                peer_id,
                relay_id,
                expires_at_ms: expires as u64,
                created_at_ms: created as u64,
                vector_clock: decode_clock(&clock)?,
            })
        })
        .collect()
}

/// Delete hourly tokens expiring at or before `before_ms`. Returns the count.
pub fn delete_expired_hourly_tokens(conn: &Connection, before_ms: u64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM hourly_tokens WHERE expires_at_ms <= ?1",
        [before_ms as i64],
    )?;
    Ok(deleted)
}

/// Delete every hourly token a peer published. Returns the count.
pub fn delete_peer_hourly_tokens(conn: &Connection, peer_id: &str) -> Result<usize> {
    let deleted = conn.execute("DELETE FROM hourly_tokens WHERE peer_id = ?1", [peer_id])?;
    Ok(deleted)
}

fn encode_clock(clock: &VectorClock) -> Result<String> {
    serde_json::to_string(clock).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_clock(raw: &str) -> Result<VectorClock> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Clock decode for use inside `query_row` closures, mapping to a
/// rusqlite conversion error so `?` composes.
fn decode_clock_sql(raw: String) -> std::result::Result<VectorClock, rusqlite::Error> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}
