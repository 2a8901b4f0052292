//! ttl cache for network-verification results, so repeated installs do not
//! re-probe every source. default ttl is a day; it is a constructor parameter
//! because the right horizon likely differs per resource class.

use {
    anyhow::{Context, Result},
    parking_lot::Mutex,
    rusqlite::{params, Connection, OptionalExtension},
    std::{
        path::Path,
        sync::Arc,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Clone)]
pub struct VerificationCache {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS verifications (
        source_key  TEXT NOT NULL PRIMARY KEY,
        verified_at INTEGER NOT NULL
    );
";

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs() as i64)
        .unwrap_or(0)
}

impl VerificationCache {
    pub fn open(database: &Path, ttl: Duration) -> Result<Self> {
        Connection::open(database)
            .with_context(|| format!("opening verification cache at [{}]", database.display()))
            .and_then(|conn| {
                conn.execute_batch(SCHEMA)
                    .context("creating verification cache schema")
                    .map(|_| conn)
            })
            .map(|conn| Self {
                conn: Arc::new(Mutex::new(conn)),
                ttl,
            })
    }

    #[cfg(test)]
    pub fn open_in_memory(ttl: Duration) -> Result<Self> {
        Connection::open_in_memory()
            .context("opening in-memory verification cache")
            .and_then(|conn| {
                conn.execute_batch(SCHEMA)
                    .context("creating verification cache schema")
                    .map(|_| conn)
            })
            .map(|conn| Self {
                conn: Arc::new(Mutex::new(conn)),
                ttl,
            })
    }

    /// true while a recorded verification is younger than the ttl
    pub fn is_fresh(&self, source_key: &str) -> Result<bool> {
        self.conn
            .lock()
            .query_row(
                "SELECT verified_at FROM verifications WHERE source_key = ?1",
                params![source_key],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("querying verification cache")
            .map(|verified_at| {
                verified_at
                    .map(|verified_at| now_seconds() - verified_at <= self.ttl.as_secs() as i64)
                    .unwrap_or(false)
            })
    }

    pub fn record(&self, source_key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO verifications (source_key, verified_at) VALUES (?1, ?2)
                 ON CONFLICT(source_key) DO UPDATE SET verified_at = ?2",
                params![source_key, now_seconds()],
            )
            .context("recording verification")
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_then_fresh() {
        let cache = VerificationCache::open_in_memory(DEFAULT_TTL).unwrap();
        assert!(!cache.is_fresh("HttpDownloader+https://example.com/a.7z").unwrap());
        cache.record("HttpDownloader+https://example.com/a.7z").unwrap();
        assert!(cache.is_fresh("HttpDownloader+https://example.com/a.7z").unwrap());
    }

    #[test]
    fn test_entries_older_than_ttl_are_stale() {
        let cache = VerificationCache::open_in_memory(DEFAULT_TTL).unwrap();
        cache
            .conn
            .lock()
            .execute(
                "INSERT INTO verifications (source_key, verified_at) VALUES (?1, ?2)",
                params!["key", now_seconds() - 2 * DEFAULT_TTL.as_secs() as i64],
            )
            .unwrap();
        assert!(!cache.is_fresh("key").unwrap());
    }
}
