//! the virtual file system: a content-addressed index over everything inside
//! the downloaded archives. answers "where does fingerprint H live" so the
//! installer can turn a directive's archive-hash-path into real bytes.
//!
//! entries survive restarts in a sqlite store keyed by the outer archive's
//! fingerprint; an entry is only authoritative while that archive is still on
//! disk with matching identity.

use {
    crate::{
        compression::{self, ExtractedFile},
        file_signature,
        modlist_json::directive::ArchiveHashPath,
        paths::RelativePath,
        resources::Resources,
        utils::{spawn_rayon, Fingerprint},
    },
    anyhow::{bail, Context, Result},
    futures::{StreamExt, TryStreamExt},
    itertools::Itertools,
    parking_lot::Mutex,
    rusqlite::{params, Connection},
    std::{
        collections::{BTreeMap, BTreeSet},
        io::Read,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tap::prelude::*,
    tracing::{debug, info, instrument, warn},
};

/// nesting is bounded: outer archive, an archive inside it, and that one's
/// entries. deeper russian dolls are not a thing the supported games produce.
pub const MAX_NESTING_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsEntry {
    pub archive_hash: Fingerprint,
    /// one segment per nesting level
    pub inner_path: Vec<RelativePath>,
    pub size: u64,
    pub mtime_nanos: Option<i64>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS vfs_entries (
        content_hash TEXT NOT NULL,
        archive_hash TEXT NOT NULL,
        inner_path   TEXT NOT NULL,
        size         INTEGER NOT NULL,
        mtime_nanos  INTEGER,
        PRIMARY KEY (archive_hash, inner_path)
    );
    CREATE INDEX IF NOT EXISTS vfs_entries_by_content ON vfs_entries (content_hash);
    CREATE TABLE IF NOT EXISTS indexed_archives (
        archive_hash TEXT NOT NULL PRIMARY KEY
    );
";

fn encode_inner_path(path: &[RelativePath]) -> String {
    serde_json::to_string(&path.iter().map(|segment| segment.as_str()).collect::<Vec<_>>()).expect("strings serialize")
}

fn decode_inner_path(encoded: &str) -> Result<Vec<RelativePath>> {
    serde_json::from_str::<Vec<String>>(encoded)
        .context("decoding inner path")
        .map(|segments| segments.into_iter().map(RelativePath::new).collect())
}

#[derive(Clone)]
pub struct Vfs {
    conn: Arc<Mutex<Connection>>,
    resources: Arc<Resources>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs").finish_non_exhaustive()
    }
}

fn open_connection(conn: Connection) -> Result<Connection> {
    conn.execute_batch(SCHEMA)
        .context("creating vfs schema")
        .map(|_| conn)
}

impl Vfs {
    pub fn open(database: &Path, resources: Arc<Resources>) -> Result<Self> {
        Connection::open(database)
            .with_context(|| format!("opening vfs index at [{}]", database.display()))
            .and_then(open_connection)
            .map(|conn| Self {
                conn: Arc::new(Mutex::new(conn)),
                resources,
            })
    }

    #[cfg(test)]
    pub fn open_in_memory(resources: Arc<Resources>) -> Result<Self> {
        Connection::open_in_memory()
            .context("opening in-memory vfs index")
            .and_then(open_connection)
            .map(|conn| Self {
                conn: Arc::new(Mutex::new(conn)),
                resources,
            })
    }

    pub fn is_indexed(&self, archive_hash: Fingerprint) -> Result<bool> {
        self.conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM indexed_archives WHERE archive_hash = ?1",
                params![archive_hash.to_base_64()],
                |row| row.get::<_, i64>(0),
            )
            .context("querying indexed archives")
            .map(|count| count > 0)
    }

    fn record_entries(&self, archive_hash: Fingerprint, entries: &[(Fingerprint, Vec<RelativePath>, u64, Option<i64>)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let transaction = conn.transaction().context("starting transaction")?;
        for (content_hash, inner_path, size, mtime_nanos) in entries {
            transaction
                .execute(
                    "INSERT OR REPLACE INTO vfs_entries (content_hash, archive_hash, inner_path, size, mtime_nanos)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        content_hash.to_base_64(),
                        archive_hash.to_base_64(),
                        encode_inner_path(inner_path),
                        *size as i64,
                        mtime_nanos
                    ],
                )
                .context("inserting vfs entry")?;
        }
        transaction
            .execute(
                "INSERT OR REPLACE INTO indexed_archives (archive_hash) VALUES (?1)",
                params![archive_hash.to_base_64()],
            )
            .context("marking archive as indexed")?;
        transaction.commit().context("committing vfs entries")
    }

    /// all known locations of `content_hash`, regardless of whether the outer
    /// archives are still on disk - callers filter by their download summary
    pub fn lookup(&self, content_hash: Fingerprint) -> Result<Vec<VfsEntry>> {
        self.conn
            .lock()
            .prepare("SELECT archive_hash, inner_path, size, mtime_nanos FROM vfs_entries WHERE content_hash = ?1")
            .context("preparing lookup")?
            .query_map(params![content_hash.to_base_64()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })
            .context("querying vfs entries")?
            .map(|row| {
                row.context("reading vfs row").and_then(|(archive_hash, inner_path, size, mtime_nanos)| {
                    Ok(VfsEntry {
                        archive_hash: Fingerprint::from_base_64(&archive_hash)?,
                        inner_path: decode_inner_path(&inner_path)?,
                        size: size as u64,
                        mtime_nanos,
                    })
                })
            })
            .collect()
    }

    pub fn contains(&self, archive_hash: Fingerprint, inner_path: &[RelativePath]) -> Result<bool> {
        self.conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM vfs_entries WHERE archive_hash = ?1 AND inner_path = ?2",
                params![archive_hash.to_base_64(), encode_inner_path(inner_path)],
                |row| row.get::<_, i64>(0),
            )
            .context("querying vfs entry")
            .map(|count| count > 0)
    }

    /// recursively indexes one archive (bounded depth), blocking; meant to be
    /// run on the compute pool
    #[instrument(skip(self), level = "DEBUG")]
    pub fn index_archive_blocking(&self, archive_path: &Path, archive_hash: Fingerprint) -> Result<()> {
        if self.is_indexed(archive_hash)? {
            debug!("already indexed");
            return Ok(());
        }
        let mut gathered = Vec::new();
        index_tree(archive_path, Vec::new(), 1, &mut gathered)
            .with_context(|| format!("indexing [{}]", archive_path.display()))?;
        info!(entries = gathered.len(), "indexed archive");
        self.record_entries(archive_hash, &gathered)
    }

    /// phase 8: make sure every `(source-archive-hash, inner-path)` referenced
    /// by a directive is represented, indexing missing archives under the vfs
    /// resource. archives the downloads directory does not hold are reported
    /// before any extraction is attempted.
    #[instrument(skip_all, level = "INFO")]
    pub async fn prime(&self, archives_by_hash: &BTreeMap<String, PathBuf>, required: &[ArchiveHashPath]) -> Result<()> {
        let missing_archives = required
            .iter()
            .map(|hash_path| hash_path.source_hash.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|source_hash| !archives_by_hash.contains_key(source_hash))
            .collect_vec();
        if !missing_archives.is_empty() {
            bail!("[{}] archives referenced by directives are not in the downloads directory: {missing_archives:#?}", missing_archives.len());
        }

        // only archives with nested references need the deep index up front;
        // plain top-level extractions are resolved directly by the handlers
        let need_indexing = required
            .iter()
            .filter(|hash_path| hash_path.path.len() > 1)
            .map(|hash_path| hash_path.source_hash.clone())
            .collect::<BTreeSet<_>>();

        need_indexing
            .into_iter()
            .pipe(futures::stream::iter)
            .map(|source_hash| {
                let this = self.clone();
                let path = archives_by_hash.get(&source_hash).expect("checked above").clone();
                async move {
                    let fingerprint = Fingerprint::from_base_64(&source_hash)?;
                    let job = this
                        .resources
                        .vfs
                        .begin(format!("indexing {}", path.display()), 0)
                        .await?;
                    let outcome = spawn_rayon({
                        let this = this.clone();
                        move || this.index_archive_blocking(&path, fingerprint)
                    })
                    .await;
                    this.resources.vfs.finish(job);
                    outcome
                }
            })
            .buffer_unordered(8)
            .try_collect::<Vec<_>>()
            .await
            .context("priming the vfs")?;

        let unrepresented = required
            .iter()
            .filter(|hash_path| hash_path.path.len() > 1)
            .map(|hash_path| {
                Fingerprint::from_base_64(&hash_path.source_hash).and_then(|fingerprint| {
                    let segments = hash_path
                        .path
                        .iter()
                        .map(|segment| segment.clone().into_relative_path())
                        .collect_vec();
                    self.contains(fingerprint, &segments)
                        .map(|contained| (!contained).then(|| (*hash_path).clone()))
                })
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect_vec();
        if !unrepresented.is_empty() {
            bail!("[{}] directive sources could not be located inside their archives: {unrepresented:#?}", unrepresented.len());
        }
        Ok(())
    }
}

/// walks one level of an archive, hashing every entry; entries that are
/// themselves archives recurse until the depth bound
fn index_tree(archive_path: &Path, prefix: Vec<RelativePath>, depth: usize, gathered: &mut Vec<(Fingerprint, Vec<RelativePath>, u64, Option<i64>)>) -> Result<()> {
    compression::gathering_extract(
        archive_path,
        |_| true,
        |entry_path, handle| index_entry(entry_path, handle, &prefix, depth, gathered),
        None,
        None,
    )
    .map(|_| ())
}

fn index_entry(
    entry_path: &RelativePath,
    handle: ExtractedFile,
    prefix: &[RelativePath],
    depth: usize,
    gathered: &mut Vec<(Fingerprint, Vec<RelativePath>, u64, Option<i64>)>,
) -> Result<()> {
    let full_path = prefix.iter().cloned().chain([entry_path.clone()]).collect_vec();
    let size = handle.size()?;
    let mtime_nanos = handle.last_modified().and_then(|modified| {
        modified
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|since| since.as_nanos() as i64)
    });
    let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
    let mut buffer = vec![0u8; crate::BUFFER_SIZE];
    let mut stream = handle.get_stream()?;
    loop {
        match stream.read(&mut buffer).context("hashing entry")? {
            0 => break,
            read => hasher.update(&buffer[..read]),
        }
    }
    drop(stream);
    gathered.push((Fingerprint(hasher.digest()), full_path.clone(), size, mtime_nanos));

    if depth < MAX_NESTING_DEPTH && looks_like_nested_archive(&handle) {
        let scratch = crate::utils::scoped_temp_path()?;
        handle
            .move_to(&scratch)
            .context("staging nested archive for indexing")?;
        index_tree(&scratch, full_path, depth + 1, gathered)
            .tap_err(|error| warn!("nested archive could not be indexed, keeping it as a plain entry: {error:#}"))
            .ok();
    }
    Ok(())
}

fn looks_like_nested_archive(handle: &ExtractedFile) -> bool {
    use file_signature::FileType;
    let recognized = handle
        .get_stream()
        .ok()
        .and_then(|mut stream| {
            let mut prefix = [0u8; 8];
            let mut filled = 0;
            while filled < prefix.len() {
                match stream.read(&mut prefix[filled..]).ok()? {
                    0 => break,
                    read => filled += read,
                }
            }
            let mut cursor = std::io::Cursor::new(&prefix[..filled]);
            file_signature::recognize(&mut cursor).ok().flatten()
        });
    matches!(
        recognized,
        Some(FileType::Zip | FileType::SevenZip | FileType::RarOld | FileType::RarNew | FileType::Bsa | FileType::Ba2 | FileType::Btar)
    )
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::resources::ResourcesSettings,
        pretty_assertions::assert_eq,
        std::io::Write,
        tokio_util::sync::CancellationToken,
    };

    fn test_setup() -> (Vfs, Arc<Resources>) {
        let resources = Arc::new(Resources::new(ResourcesSettings::default(), &CancellationToken::new()));
        (Vfs::open_in_memory(resources.clone()).unwrap(), resources)
    }

    fn write_btar(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let mut out = Vec::new();
        out.extend_from_slice(b"BTAR");
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&3u16.to_be_bytes());
        for (name, payload) in entries {
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            out.extend_from_slice(payload);
        }
        tempfile::Builder::new()
            .suffix(".btar")
            .tempfile()
            .unwrap()
            .tap_mut(|file| file.write_all(&out).unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn test_index_and_lookup_round_trip() {
        let (vfs, _) = test_setup();
        let archive = write_btar(&[("a/b.txt", b"hello"), ("c.txt", b"world")]);
        let archive_hash = Fingerprint(42);
        vfs.index_archive_blocking(archive.path(), archive_hash).unwrap();

        let expected_content = Fingerprint(xxhash_rust::xxh64::xxh64(b"hello", 0));
        let found = vfs.lookup(expected_content).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].archive_hash, archive_hash);
        assert_eq!(found[0].inner_path, vec![RelativePath::new("a/b.txt")]);
        assert_eq!(found[0].size, 5);
    }

    #[test_log::test(tokio::test)]
    async fn test_nested_archives_are_indexed_through() {
        let (vfs, _) = test_setup();
        let inner = {
            let mut out = Vec::new();
            out.extend_from_slice(b"BTAR");
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&2u16.to_be_bytes());
            out.extend_from_slice(&(9u16.to_be_bytes()));
            out.extend_from_slice(b"inner.txt");
            out.extend_from_slice(&(4u64.to_be_bytes()));
            out.extend_from_slice(b"deep");
            out
        };
        let outer = write_btar(&[("nested.btar", &inner)]);
        vfs.index_archive_blocking(outer.path(), Fingerprint(7)).unwrap();

        let deep_hash = Fingerprint(xxhash_rust::xxh64::xxh64(b"deep", 0));
        let found = vfs.lookup(deep_hash).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].inner_path,
            vec![RelativePath::new("nested.btar"), RelativePath::new("inner.txt")]
        );
    }

    #[tokio::test]
    async fn test_indexing_is_cached_by_archive_hash() {
        let (vfs, _) = test_setup();
        let archive = write_btar(&[("a.txt", b"a")]);
        vfs.index_archive_blocking(archive.path(), Fingerprint(1)).unwrap();
        assert!(vfs.is_indexed(Fingerprint(1)).unwrap());
        // second run is a no-op even if the file disappeared
        drop(archive);
        vfs.index_archive_blocking(Path::new("/nonexistent"), Fingerprint(1)).unwrap();
    }
}
