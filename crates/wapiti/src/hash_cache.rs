//! persistent `(path, size, mtime) → fingerprint` store. a hit is only a hit
//! while the file on disk still matches the identity the fingerprint was
//! computed under; any drift invalidates the entry.

use {
    crate::{
        resources::Resource,
        utils::{spawn_rayon, Fingerprint, PathReadWrite},
    },
    anyhow::{Context, Result},
    parking_lot::Mutex,
    rusqlite::{params, Connection, OptionalExtension},
    std::{
        io::Read,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tap::prelude::*,
    tracing::{instrument, warn},
};

/// exact identity of a file on disk at the moment it was hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub size: u64,
    pub mtime_nanos: i64,
}

pub fn file_identity(path: &Path) -> Result<FileIdentity> {
    std::fs::metadata(path)
        .with_context(|| format!("reading metadata of [{}]", path.display()))
        .map(|metadata| FileIdentity {
            size: metadata.len(),
            mtime_nanos: filetime::FileTime::from_last_modification_time(&metadata).pipe(|mtime| {
                mtime.unix_seconds() * 1_000_000_000 + mtime.nanoseconds() as i64
            }),
        })
}

pub fn hash_file_streaming(path: &Path) -> Result<Fingerprint> {
    path.open_file_read().and_then(|(path, file)| {
        let mut reader = std::io::BufReader::new(file);
        let mut buffer = vec![0u8; crate::BUFFER_SIZE];
        let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
        loop {
            match reader
                .read(&mut buffer)
                .with_context(|| format!("reading [{}]", path.display()))?
            {
                0 => break,
                read => hasher.update(&buffer[..read]),
            }
        }
        Ok(Fingerprint(hasher.digest()))
    })
}

#[derive(Clone)]
pub struct HashCache {
    conn: Arc<Mutex<Connection>>,
    resource: Resource,
}

impl std::fmt::Debug for HashCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashCache").finish_non_exhaustive()
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS hashes (
        path        TEXT NOT NULL PRIMARY KEY,
        size        INTEGER NOT NULL,
        mtime_nanos INTEGER NOT NULL,
        hash        TEXT NOT NULL
    );
";

impl HashCache {
    pub fn open(database: &Path, resource: Resource) -> Result<Self> {
        Connection::open(database)
            .with_context(|| format!("opening hash cache at [{}]", database.display()))
            .and_then(|conn| {
                conn.execute_batch(SCHEMA)
                    .context("creating hash cache schema")
                    .map(|_| conn)
            })
            .map(|conn| Self {
                conn: Arc::new(Mutex::new(conn)),
                resource,
            })
    }

    #[cfg(test)]
    pub fn open_in_memory(resource: Resource) -> Result<Self> {
        Connection::open_in_memory()
            .context("opening in-memory hash cache")
            .and_then(|conn| {
                conn.execute_batch(SCHEMA)
                    .context("creating hash cache schema")
                    .map(|_| conn)
            })
            .map(|conn| Self {
                conn: Arc::new(Mutex::new(conn)),
                resource,
            })
    }

    /// cache hit requires the stored identity to match the file byte for byte.
    /// entries that decode to a zero digest are purged on sight and reported
    /// as misses.
    pub fn lookup(&self, path: &Path) -> Result<Option<Fingerprint>> {
        let identity = match file_identity(path) {
            Ok(identity) => identity,
            Err(_) => return Ok(None),
        };
        let key = path.to_string_lossy().to_string();
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT hash FROM hashes WHERE path = ?1 AND size = ?2 AND mtime_nanos = ?3",
            params![key, identity.size as i64, identity.mtime_nanos],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("querying hash cache")?
        .map(|hash| Fingerprint::from_base_64(&hash))
        .transpose()
        .context("decoding cached hash")?
        .pipe(|hit| match hit {
            Some(fingerprint) if fingerprint.is_zero() => {
                warn!("purging zero digest cached for [{key}]");
                conn.execute("DELETE FROM hashes WHERE path = ?1", params![key])
                    .context("purging zero digest")
                    .map(|_| None)
            }
            other => Ok(other),
        })
    }

    /// force-insert for files produced by means that already know the hash
    pub fn write(&self, path: &Path, fingerprint: Fingerprint) -> Result<()> {
        if fingerprint.is_zero() {
            warn!("refusing to cache a zero digest for [{}]", path.display());
            return Ok(());
        }
        let identity = file_identity(path)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO hashes (path, size, mtime_nanos, hash) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET size = ?2, mtime_nanos = ?3, hash = ?4",
                params![
                    path.to_string_lossy().to_string(),
                    identity.size as i64,
                    identity.mtime_nanos,
                    fingerprint.to_base_64()
                ],
            )
            .context("inserting into hash cache")
            .map(|_| ())
    }

    /// streaming hash under the file-hashing resource, cached on success
    #[instrument(skip(self), level = "DEBUG")]
    pub async fn compute_or_cache(&self, path: PathBuf) -> Result<Fingerprint> {
        if let Some(hit) = self.lookup(&path)? {
            return Ok(hit);
        }
        let size = file_identity(&path).map(|identity| identity.size).unwrap_or(0);
        let job = self
            .resource
            .begin(format!("hashing {}", path.display()), size)
            .await?;
        let fingerprint = spawn_rayon({
            let path = path.clone();
            move || hash_file_streaming(&path)
        })
        .await
        .with_context(|| format!("hashing [{}]", path.display()));
        self.resource.finish(job);
        let fingerprint = fingerprint?;
        if fingerprint.is_zero() {
            anyhow::bail!("computed a zero digest for [{}] - file is unreadable or the hash is corrupt", path.display());
        }
        self.write(&path, fingerprint)?;
        Ok(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::resources::{Resource, ResourceSettings, UNBOUNDED_THROUGHPUT},
        std::io::Write,
        tokio_util::sync::CancellationToken,
    };

    fn test_resource() -> Resource {
        Resource::new(
            "File Hashing",
            ResourceSettings {
                max_tasks: 2,
                max_throughput_bytes_per_second: UNBOUNDED_THROUGHPUT,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_compute_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("archive.7z");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"some archive bytes")
            .unwrap();
        let cache = HashCache::open_in_memory(test_resource()).unwrap();
        let computed = cache.compute_or_cache(file.clone()).await.unwrap();
        assert_eq!(cache.lookup(&file).unwrap(), Some(computed));
    }

    #[tokio::test]
    async fn test_mtime_drift_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("archive.7z");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(b"original")
            .unwrap();
        let cache = HashCache::open_in_memory(test_resource()).unwrap();
        cache.compute_or_cache(file.clone()).await.unwrap();
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();
        assert_eq!(cache.lookup(&file).unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_digest_is_purged_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("archive.7z");
        std::fs::File::create(&file).unwrap().write_all(b"x").unwrap();
        let cache = HashCache::open_in_memory(test_resource()).unwrap();
        let identity = file_identity(&file).unwrap();
        cache
            .conn
            .lock()
            .execute(
                "INSERT INTO hashes (path, size, mtime_nanos, hash) VALUES (?1, ?2, ?3, ?4)",
                params![
                    file.to_string_lossy().to_string(),
                    identity.size as i64,
                    identity.mtime_nanos,
                    Fingerprint(0).to_base_64()
                ],
            )
            .unwrap();
        assert_eq!(cache.lookup(&file).unwrap(), None);
        assert_eq!(cache.lookup(&file).unwrap(), None);
    }

    #[test]
    fn test_streaming_hash_matches_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob.bin");
        let payload = (0u8..=255).cycle().take(crate::BUFFER_SIZE * 3 + 17).collect::<Vec<_>>();
        std::fs::File::create(&file).unwrap().write_all(&payload).unwrap();
        let streamed = hash_file_streaming(&file).unwrap();
        assert_eq!(streamed, Fingerprint(xxhash_rust::xxh64::xxh64(&payload, 0)));
    }
}
