//! verification of archives already sitting in the downloads directory:
//! size first (cheap), fingerprint second (streamed through the hash cache).

use {
    crate::{
        downloaders::WithArchiveDescriptor,
        hash_cache::HashCache,
        modlist_json::ArchiveDescriptor,
        utils::Fingerprint,
    },
    anyhow::{Context, Result},
    futures::TryFutureExt,
    std::path::PathBuf,
    tap::prelude::*,
};

#[derive(Debug, Clone)]
pub struct DownloadCache {
    pub root_directory: PathBuf,
    pub hash_cache: HashCache,
}

pub async fn validate_file_size(path: PathBuf, expected_size: u64) -> Result<PathBuf> {
    tokio::fs::metadata(&path)
        .map_err(anyhow::Error::from)
        .await
        .with_context(|| format!("getting size of {}", path.display()))
        .and_then(move |metadata| {
            metadata
                .len()
                .eq(&expected_size)
                .then_some(path)
                .with_context(|| format!("size mismatch (expected [{expected_size} bytes], found [{} bytes])", metadata.len()))
        })
}

impl DownloadCache {
    pub fn new(root_directory: PathBuf, hash_cache: HashCache) -> Result<Self> {
        std::fs::create_dir_all(&root_directory)
            .context("creating download directory")
            .map(|_| Self {
                root_directory: root_directory.clone(),
                hash_cache,
            })
            .with_context(|| format!("creating download cache handler at [{}]", root_directory.display()))
    }

    pub fn download_output_path(&self, file_name: &str) -> PathBuf {
        self.root_directory.join(file_name)
    }

    /// full verification: exists, size matches, fingerprint matches
    pub async fn verify(&self, descriptor: ArchiveDescriptor) -> Result<WithArchiveDescriptor<PathBuf>> {
        let ArchiveDescriptor { hash, meta: _, name, size } = descriptor.clone();
        let expected_path = self.download_output_path(&name);
        let expected_hash = Fingerprint::from_base_64(&hash).with_context(|| format!("descriptor of [{name}] carries a malformed hash"))?;
        tokio::fs::try_exists(&expected_path)
            .map_err(anyhow::Error::from)
            .await
            .with_context(|| format!("checking if path [{}] exists", expected_path.display()))
            .and_then(|exists| exists.then_some(()).context("does not exist"))
            .pipe(futures::future::ready)
            .and_then(|_| validate_file_size(expected_path.clone(), size))
            .and_then(|found_path| {
                self.hash_cache
                    .compute_or_cache(found_path.clone())
                    .map_ok(move |found| (found_path, found))
            })
            .await
            .and_then(|(found_path, found)| {
                found
                    .eq(&expected_hash)
                    .then_some(found_path)
                    .with_context(|| format!("hash mismatch, expected [{expected_hash}], found [{found}]"))
            })
            .map(|inner| WithArchiveDescriptor { inner, descriptor })
            .with_context(|| format!("verifying [{name}]"))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::resources::{Resource, ResourceSettings},
        std::io::Write,
        tokio_util::sync::CancellationToken,
    };

    fn cache_in(dir: &std::path::Path) -> DownloadCache {
        DownloadCache::new(
            dir.to_path_buf(),
            HashCache::open_in_memory(Resource::new(
                "File Hashing",
                ResourceSettings::default(),
                CancellationToken::new(),
            ))
            .unwrap(),
        )
        .unwrap()
    }

    fn descriptor_for(bytes: &[u8], name: &str) -> ArchiveDescriptor {
        ArchiveDescriptor {
            hash: Fingerprint(xxhash_rust::xxh64::xxh64(bytes, 0)).to_base_64(),
            meta: String::new(),
            name: name.to_string(),
            size: bytes.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_verify_accepts_matching_archive() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        std::fs::File::create(dir.path().join("a.7z"))
            .unwrap()
            .write_all(b"archive contents")
            .unwrap();
        let verified = cache.verify(descriptor_for(b"archive contents", "a.7z")).await.unwrap();
        assert_eq!(verified.inner, dir.path().join("a.7z"));
    }

    #[tokio::test]
    async fn test_verify_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        std::fs::File::create(dir.path().join("a.7z")).unwrap().write_all(b"short").unwrap();
        assert!(cache.verify(descriptor_for(b"archive contents", "a.7z")).await.is_err());
    }

    #[tokio::test]
    async fn test_verify_rejects_corrupt_bytes_of_right_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        std::fs::File::create(dir.path().join("a.7z"))
            .unwrap()
            .write_all(b"Archive contents")
            .unwrap();
        assert!(cache.verify(descriptor_for(b"archive contents", "a.7z")).await.is_err());
    }
}
