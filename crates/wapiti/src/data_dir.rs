use {
    anyhow::{Context, Result},
    std::path::{Path, PathBuf},
};

/// the single root under which every persistent store lives. file names carry
/// a schema generation so incompatible layouts never collide.
#[derive(Debug, Clone)]
pub struct DataDirectory {
    root: PathBuf,
}

impl DataDirectory {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating data directory at [{}]", root.display()))
            .map(|_| Self { root })
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    pub fn hash_cache(&self) -> PathBuf {
        self.root.join("GlobalHashCache2.sqlite")
    }
    pub fn vfs_cache(&self) -> PathBuf {
        self.root.join("GlobalVFSCache5.sqlite")
    }
    pub fn verification_cache(&self) -> PathBuf {
        self.root.join("VerificationCacheV3.sqlite")
    }
    pub fn patch_cache(&self) -> PathBuf {
        self.root.join("PatchCache")
    }
}
