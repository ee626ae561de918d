//! Server identity persistence.
//!
//! One row, written once at first boot. The secret key also lives in the
//! key file; the database copy makes a data-dir backup self-contained.

use rusqlite::{Connection, OptionalExtension};

use crate::{Result, StoreError};

/// The persisted identity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRow {
    pub secret_key: [u8; 32],
    pub server_id: String,
    pub created_at_ms: u64,
}

/// Store the identity, failing if one is already present.
pub fn save(conn: &Connection, row: &IdentityRow) -> Result<()> {
    conn.execute(
        "INSERT INTO server_identity (id, secret_key, server_id, created_at_ms)
         VALUES (1, ?1, ?2, ?3)",
        rusqlite::params![
            row.secret_key.as_slice(),
            row.server_id,
            row.created_at_ms as i64,
        ],
    )?;
    Ok(())
}

/// Load the identity, if one was ever stored.
pub fn load(conn: &Connection) -> Result<Option<IdentityRow>> {
    let row = conn
        .query_row(
            "SELECT secret_key, server_id, created_at_ms FROM server_identity WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((secret, server_id, created_at)) => {
            let secret_key: [u8; 32] = secret
                .try_into()
                .map_err(|_| StoreError::Corrupt("identity secret has bad length".to_string()))?;
            Ok(Some(IdentityRow {
                secret_key,
                server_id,
                created_at_ms: created_at as u64,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let conn = crate::open_memory().expect("open");
        let row = IdentityRow {
            secret_key: [7u8; 32],
            server_id: "ed25519:abc".to_string(),
            created_at_ms: 42,
        };
        save(&conn, &row).expect("save");
        assert_eq!(load(&conn).expect("load"), Some(row));
    }

    #[test]
    fn test_load_empty() {
        let conn = crate::open_memory().expect("open");
        assert_eq!(load(&conn).expect("load"), None);
    }

    #[test]
    fn test_double_save_rejected() {
        let conn = crate::open_memory().expect("open");
        let row = IdentityRow {
            secret_key: [7u8; 32],
            server_id: "ed25519:abc".to_string(),
            created_at_ms: 42,
        };
        save(&conn, &row).expect("first");
        assert!(save(&conn, &row).is_err());
    }
}
