mod blocks;
mod error;
mod handoff;
mod migrations;

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

pub use blocks::ClosedBlock;
pub use error::{DbError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store for handoff snapshots and closed block history.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "cache_size", -20_000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Opens `path` and brings the schema up to date.
    pub fn open_and_migrate(path: impl AsRef<Path>) -> Result<Self> {
        let mut db = Self::open(path)?;
        db.migrate()?;
        Ok(db)
    }
}
