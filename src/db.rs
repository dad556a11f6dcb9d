//! Shared SQLite Handle
//!
//! All stores share one connection behind a tokio mutex so that a store can
//! pair its own row writes with coin-ledger mutations in a single transaction.

use anyhow::Result;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedConn = Arc<Mutex<Connection>>;

/// Open (or create) the database at `db_path` and apply pragmas.
pub fn open_shared(db_path: &str) -> Result<SharedConn> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
pub fn open_in_memory() -> SharedConn {
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    Arc::new(Mutex::new(conn))
}
