//! Shared SQLite connection tuning
//!
//! Every connection the aggregation engine opens goes through
//! [`apply_optimized_pragmas`] so the rolling and fixed-bucket writers can run
//! side by side against the same database file.

use rusqlite::Connection;
use std::time::Duration;

/// How long a writer waits on a locked database before giving up
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Apply WAL, NORMAL sync, in-memory temp store, mmap, cache and
/// autocheckpoint settings plus a busy timeout.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode returns a row, pragma_update handles that
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -64_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(())
}
