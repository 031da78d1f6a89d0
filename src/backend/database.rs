//! Persisted relational backend over SQLite.
//!
//! Counters use a single `INSERT .. ON CONFLICT .. RETURNING` statement.
//! Structured records are rewritten inside an `IMMEDIATE` transaction, which
//! takes the write lock up front and so serializes competing writers across
//! processes sharing the database file. Busy errors are retried a bounded
//! number of times and then surface as backend errors.

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ApplyFn, Backend, BackendKind};
use crate::clock::Clock;
use crate::error::{QuotaError, Result};

const MAX_BUSY_RETRIES: u32 = 3;
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS quota_entries (
    key TEXT PRIMARY KEY,
    counter INTEGER,
    payload TEXT,
    expires_at REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quota_entries_expires_at ON quota_entries (expires_at);
";

enum TxError {
    Sqlite(rusqlite::Error),
    Apply(QuotaError),
}

impl From<rusqlite::Error> for TxError {
    fn from(err: rusqlite::Error) -> Self {
        TxError::Sqlite(err)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

pub struct DatabaseBackend {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl DatabaseBackend {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        // WAL lets readers proceed while a decision holds the write lock.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        info!(path = %path.as_ref().display(), journal_mode = %mode, "Opened rate limit database");
        Self::from_connection(conn, timeout, clock)
    }

    /// Private, process-local database. Mostly useful in tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, super::DEFAULT_TIMEOUT, clock)
    }

    /// Wraps an existing connection, creating the table if needed.
    pub fn from_connection(
        conn: Connection,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        conn.busy_timeout(timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn with_retry<T>(
        &self,
        op: &str,
        mut f: impl FnMut(&mut Connection) -> std::result::Result<T, TxError>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let mut attempt = 0;
        loop {
            match f(&mut *conn) {
                Ok(value) => return Ok(value),
                Err(TxError::Apply(err)) => return Err(err),
                Err(TxError::Sqlite(err)) if is_busy(&err) && attempt < MAX_BUSY_RETRIES => {
                    attempt += 1;
                    warn!(op = op, attempt = attempt, "Database busy, retrying");
                    thread::sleep(BUSY_BACKOFF * attempt);
                }
                Err(TxError::Sqlite(err)) => {
                    return Err(QuotaError::backend(format!("database {}: {}", op, err)))
                }
            }
        }
    }
}

impl Backend for DatabaseBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Database
    }

    fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        let expires_at = now + ttl.as_secs_f64();
        let count: i64 = self.with_retry("increment", |conn| {
            Ok(conn.query_row(
                "INSERT INTO quota_entries (key, counter, payload, expires_at)
                 VALUES (?1, 1, NULL, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                    counter = CASE WHEN quota_entries.expires_at <= ?3 THEN 1
                                   ELSE COALESCE(quota_entries.counter, 0) + 1 END,
                    payload = NULL,
                    expires_at = CASE WHEN quota_entries.expires_at <= ?3 THEN excluded.expires_at
                                      ELSE quota_entries.expires_at END
                 RETURNING counter",
                params![key, expires_at, now],
                |row| row.get(0),
            )?)
        })?;
        Ok(count.max(0) as u64)
    }

    fn read_counter(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now();
        let count: Option<Option<i64>> = self.with_retry("read_counter", |conn| {
            Ok(conn
                .query_row(
                    "SELECT counter FROM quota_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(count.flatten().map(|c| c.max(0) as u64))
    }

    fn read_structured(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let payload: Option<Option<String>> = self.with_retry("read", |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM quota_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(payload.flatten())
    }

    fn write_structured(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + ttl.as_secs_f64();
        self.with_retry("write", |conn| {
            conn.execute(
                "INSERT INTO quota_entries (key, counter, payload, expires_at)
                 VALUES (?1, NULL, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    counter = NULL, payload = excluded.payload, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = now + ttl.as_secs_f64();
        let changed = self.with_retry("compare_and_swap", |conn| {
            let changed = match expected {
                None => conn.execute(
                    "INSERT INTO quota_entries (key, counter, payload, expires_at)
                     VALUES (?1, NULL, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        counter = NULL, payload = excluded.payload, expires_at = excluded.expires_at
                     WHERE quota_entries.expires_at <= ?4",
                    params![key, new, expires_at, now],
                )?,
                Some(current) => conn.execute(
                    "UPDATE quota_entries SET payload = ?2, expires_at = ?3
                     WHERE key = ?1 AND payload = ?4 AND expires_at > ?5",
                    params![key, new, expires_at, current, now],
                )?,
            };
            Ok(changed)
        })?;
        Ok(changed == 1)
    }

    fn read_modify_write(&self, key: &str, ttl: Duration, apply: &mut ApplyFn<'_>) -> Result<()> {
        self.with_retry("read_modify_write", |conn| {
            let now = self.clock.now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<Option<String>> = tx
                .query_row(
                    "SELECT payload FROM quota_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            let next = apply(current.flatten().as_deref()).map_err(TxError::Apply)?;
            tx.execute(
                "INSERT INTO quota_entries (key, counter, payload, expires_at)
                 VALUES (?1, NULL, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    counter = NULL, payload = excluded.payload, expires_at = excluded.expires_at",
                params![key, next, now + ttl.as_secs_f64()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.with_retry("delete", |conn| {
            Ok(conn.execute("DELETE FROM quota_entries WHERE key = ?1", params![key])?)
        })?;
        Ok(removed > 0)
    }

    fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let removed = self.with_retry("purge", |conn| {
            Ok(conn.execute("DELETE FROM quota_entries WHERE expires_at <= ?1", params![now])?)
        })?;
        debug!(removed = removed, "Purged expired database entries");
        Ok(removed as u64)
    }

    fn ping(&self) -> Result<()> {
        self.with_retry("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn backend() -> (Arc<ManualClock>, DatabaseBackend) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let backend = DatabaseBackend::open_in_memory(clock.clone()).unwrap();
        (clock, backend)
    }

    #[test]
    fn test_increment_and_expiry() {
        let (clock, backend) = backend();
        let ttl = Duration::from_secs(60);
        assert_eq!(backend.increment_and_get("k", ttl).unwrap(), 1);
        assert_eq!(backend.increment_and_get("k", ttl).unwrap(), 2);
        clock.advance_secs(60.0);
        assert_eq!(backend.read_counter("k").unwrap(), None);
        assert_eq!(backend.increment_and_get("k", ttl).unwrap(), 1);
    }

    #[test]
    fn test_compare_and_swap_semantics() {
        let (clock, backend) = backend();
        let ttl = Duration::from_secs(10);
        assert!(backend.compare_and_swap("r", None, "v1", ttl).unwrap());
        assert!(!backend.compare_and_swap("r", None, "v2", ttl).unwrap());
        assert!(!backend.compare_and_swap("r", Some("stale"), "v2", ttl).unwrap());
        assert!(backend.compare_and_swap("r", Some("v1"), "v2", ttl).unwrap());
        clock.advance_secs(11.0);
        // An expired record counts as absent.
        assert!(backend.compare_and_swap("r", None, "v3", ttl).unwrap());
        assert_eq!(backend.read_structured("r").unwrap().as_deref(), Some("v3"));
    }

    #[test]
    fn test_read_modify_write_rolls_back_on_apply_error() {
        let (_, backend) = backend();
        let ttl = Duration::from_secs(10);
        backend.write_structured("r", "keep", ttl).unwrap();
        let err = backend
            .read_modify_write("r", ttl, &mut |_| Err(QuotaError::backend("boom")))
            .unwrap_err();
        assert!(err.is_backend());
        assert_eq!(backend.read_structured("r").unwrap().as_deref(), Some("keep"));
    }

    #[test]
    fn test_purge_counts_expired_rows() {
        let (clock, backend) = backend();
        backend.increment_and_get("a", Duration::from_secs(1)).unwrap();
        backend.increment_and_get("b", Duration::from_secs(1)).unwrap();
        backend.write_structured("c", "[]", Duration::from_secs(100)).unwrap();
        clock.advance_secs(5.0);
        assert_eq!(backend.purge_expired().unwrap(), 2);
        assert_eq!(backend.purge_expired().unwrap(), 0);
        assert!(backend.read_structured("c").unwrap().is_some());
    }

    #[test]
    fn test_existing_connection_is_accepted() {
        let conn = Connection::open_in_memory().unwrap();
        let backend = DatabaseBackend::from_connection(
            conn,
            Duration::from_millis(500),
            Arc::new(ManualClock::new(0.0)),
        )
        .unwrap();
        assert!(backend.ping().is_ok());
        assert_eq!(backend.kind(), BackendKind::Database);
    }
}
