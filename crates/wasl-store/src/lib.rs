//! # wasl-store
//!
//! Persistence layer for a wasl server. Manages the single SQLite
//! database holding everything that must survive a restart: the server
//! identity, the last membership snapshot, and the replicated rendezvous
//! records with their vector clocks.
//!
//! ## Contract
//!
//! - WAL mode, foreign keys on, `busy_timeout` set.
//! - Schema version in `PRAGMA user_version`; migrations run at open.
//! - All timestamps are Unix epoch milliseconds stored as `INTEGER`.
//! - Upserts of replicated records merge vector clocks inside a
//!   transaction, so operations are serializable per entity key.
//! - Callers treat read errors as empty results (queries fail open);
//!   write errors propagate.

pub mod migrations;
pub mod queries;
pub mod schema;

use std::path::Path;

use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Convenience result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Open or create the database at the given path.
///
/// Configures pragmas and runs any pending migrations.
///
/// # Errors
///
/// Returns [`StoreError`] on any SQLite or migration failure; this is
/// fatal at startup.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
///
/// # Errors
///
/// Returns [`StoreError`] on SQLite or migration failure.
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}
