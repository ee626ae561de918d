//! Membership snapshot queries.
//!
//! The in-memory membership table is authoritative while running; the
//! snapshot exists so a restarting server can rejoin without waiting for
//! the directory. `save_all` replaces the whole table atomically.

use rusqlite::Connection;

use wasl_types::{MembershipEntry, NodeId, PeerStatus, ServerId};

use crate::{Result, StoreError};

/// Replace the stored snapshot with `entries`.
pub fn save_all(conn: &mut Connection, entries: &[MembershipEntry]) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM membership", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO membership
                 (server_id, node_id, endpoint, public_key, status,
                  incarnation, last_seen_ms, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for entry in entries {
            stmt.execute(rusqlite::params![
                entry.server_id.as_str(),
                entry.node_id.to_hex(),
                entry.endpoint,
                entry.public_key,
                status_str(entry.status),
                entry.incarnation as i64,
                entry.last_seen_ms as i64,
                serde_json::to_string(&entry.metadata)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Load the stored snapshot.
pub fn load_all(conn: &Connection) -> Result<Vec<MembershipEntry>> {
    let mut stmt = conn.prepare(
        "SELECT server_id, node_id, endpoint, public_key, status,
                incarnation, last_seen_ms, metadata
         FROM membership ORDER BY server_id",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(server_id, node_id, endpoint, public_key, status, incarnation, last_seen, meta)| {
            Ok(MembershipEntry {
                server_id: ServerId::parse(&server_id)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                node_id: NodeId::parse(&node_id)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                endpoint,
                public_key,
                status: status_from_str(&status)?,
                incarnation: incarnation as u64,
                last_seen_ms: last_seen as u64,
                metadata: serde_json::from_str(&meta)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            })
        })
        .collect()
}

fn status_str(status: PeerStatus) -> &'static str {
    match status {
        PeerStatus::Alive => "alive",
        PeerStatus::Suspect => "suspect",
        PeerStatus::Failed => "failed",
        PeerStatus::Left => "left",
    }
}

fn status_from_str(s: &str) -> Result<PeerStatus> {
    match s {
        "alive" => Ok(PeerStatus::Alive),
        "suspect" => Ok(PeerStatus::Suspect),
        "failed" => Ok(PeerStatus::Failed),
        "left" => Ok(PeerStatus::Left),
        other => Err(StoreError::Corrupt(format!("unknown status: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_entry(byte: u8, status: PeerStatus, incarnation: u64) -> MembershipEntry {
        let mut metadata = BTreeMap::new();
        metadata.insert("region".to_string(), "eu-west".to_string());
        MembershipEntry {
            server_id: ServerId::from_public_key(&[byte; 32]),
            node_id: NodeId([byte; 20]),
            endpoint: format!("ws://10.0.0.{byte}:9000"),
            public_key: format!("pk-{byte}"),
            status,
            incarnation,
            last_seen_ms: 1_234,
            metadata,
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let mut conn = crate::open_memory().expect("open");
        let entries = vec![
            make_entry(1, PeerStatus::Alive, 3),
            make_entry(2, PeerStatus::Failed, 7),
        ];

        save_all(&mut conn, &entries).expect("save");
        let loaded = load_all(&conn).expect("load");
        assert_eq!(loaded, entries);
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let mut conn = crate::open_memory().expect("open");
        save_all(&mut conn, &[make_entry(1, PeerStatus::Alive, 1)]).expect("first");
        save_all(&mut conn, &[make_entry(2, PeerStatus::Suspect, 2)]).expect("second");

        let loaded = load_all(&conn).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, PeerStatus::Suspect);
    }

    #[test]
    fn test_empty_snapshot() {
        let mut conn = crate::open_memory().expect("open");
        save_all(&mut conn, &[]).expect("save");
        assert!(load_all(&conn).expect("load").is_empty());
    }
}
