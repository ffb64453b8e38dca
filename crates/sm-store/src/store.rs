use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::schema;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// SQLite-backed persistent store shared by all server tasks.
///
/// The connection is guarded by a mutex; callers keep critical sections
/// short (one statement or one small transaction). Multi-step writes go
/// through `unchecked_transaction` on the locked connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`, enable WAL mode, and
    /// create all required tables and indexes.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn)?;
        info!("Store opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for a sequence of statements. The guard must not
    /// be held across await points.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run a closure with the locked connection.
    pub fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

/// Current UTC time as a fixed-width RFC 3339 string.
///
/// Fixed microsecond precision keeps lexicographic and chronological order
/// identical, so TEXT comparisons in SQL are safe.
pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let s = fmt_ts(now);
        let parsed = parse_ts(&s).unwrap();
        assert!((parsed - now).num_microseconds().unwrap().abs() < 2);
    }

    #[test]
    fn test_timestamp_ordering_is_lexicographic() {
        let a = Utc::now();
        let b = a + Duration::seconds(90);
        assert!(fmt_ts(a) < fmt_ts(b));
    }

    #[test]
    fn test_open_memory() {
        let store = Store::open_memory().unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM host", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
