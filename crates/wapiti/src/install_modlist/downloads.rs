//! archive acquisition: hash what is already on disk, fetch what is not,
//! collect manual sources, and recover presumed-corrupt files with exactly one
//! re-download before giving up.

use {
    super::download_cache::DownloadCache,
    crate::{
        downloaders::{DownloadOutcome, Downloaders, WithArchiveDescriptor},
        modlist_json::Archive,
    },
    anyhow::{Context, Result},
    futures::StreamExt,
    std::{collections::BTreeMap, path::PathBuf, sync::Arc},
    tap::prelude::*,
    tracing::{info, instrument, warn},
};

/// everything later phases need to know about the archives on disk, keyed by
/// the archive's fingerprint (its base64 form, as the modlist spells it)
pub type DownloadSummary = Arc<BTreeMap<String, WithArchiveDescriptor<PathBuf>>>;

#[extension_traits::extension(pub trait DownloadSummaryExt)]
impl DownloadSummary {
    fn resolve_archive_path(&self, source_hash: &str) -> Result<PathBuf> {
        self.get(source_hash)
            .map(|entry| entry.inner.clone())
            .with_context(|| format!("archive with hash [{source_hash}] is not in the download summary"))
    }
}

#[derive(Clone)]
pub struct Synchronizers {
    pub cache: Arc<DownloadCache>,
    pub downloaders: Downloaders,
    concurrency: usize,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub hashed: BTreeMap<String, WithArchiveDescriptor<PathBuf>>,
    pub manual: Vec<Archive>,
}

impl Synchronizers {
    pub fn new(cache: Arc<DownloadCache>, downloaders: Downloaders, concurrency: usize) -> Self {
        Self {
            cache,
            downloaders,
            concurrency: concurrency.max(1),
        }
    }

    /// phase 3: verify whatever is already in the downloads directory
    #[instrument(skip_all, level = "INFO")]
    pub async fn hash_existing(&self, archives: &[Archive]) -> BTreeMap<String, WithArchiveDescriptor<PathBuf>> {
        archives
            .iter()
            .cloned()
            .pipe(futures::stream::iter)
            .map(|archive| {
                let this = self.clone();
                async move {
                    this.cache
                        .verify(archive.descriptor.clone())
                        .await
                        .tap_err(|reason| info!(name = %archive.descriptor.name, "not reusable: {reason:#}"))
                        .ok()
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(std::future::ready)
            .map(|verified| (verified.descriptor.hash.clone(), verified))
            .collect()
            .await
    }

    /// phase 4: fetch everything the hash pass did not account for; manual
    /// sources are collected, not fetched, and do not block the rest
    #[instrument(skip_all, level = "INFO")]
    pub async fn download_missing(&self, archives: &[Archive], already_hashed: &BTreeMap<String, WithArchiveDescriptor<PathBuf>>) -> SyncOutcome {
        let mut outcome = SyncOutcome {
            hashed: already_hashed.clone(),
            manual: Vec::new(),
        };
        let results = archives
            .iter()
            .filter(|archive| !already_hashed.contains_key(&archive.descriptor.hash))
            .cloned()
            .pipe(futures::stream::iter)
            .map(|archive| {
                let this = self.clone();
                async move {
                    let target = this.cache.download_output_path(&archive.descriptor.name);
                    let downloaded = this.downloaders.download(&archive, &target).await;
                    (archive, downloaded)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;
        for (archive, downloaded) in results {
            match downloaded {
                Ok(DownloadOutcome::ManualInterventionRequired) => outcome.manual.push(archive),
                Ok(DownloadOutcome::Fetched) => {}
                Err(reason) => {
                    // the rehash phase decides whether this is fatal
                    warn!(name = %archive.descriptor.name, "download failed: {reason:#}");
                }
            }
        }
        outcome
    }

    /// phase 6: rehash everything; files that still fail verification are
    /// presumed corrupt - deleted and fetched once more. a second miss leaves
    /// the archive in the returned failure set.
    #[instrument(skip_all, level = "INFO")]
    pub async fn rehash_and_recover(&self, archives: &[Archive], outcome: &mut SyncOutcome) -> Result<Vec<Archive>> {
        let manual_hashes = outcome.manual.iter().map(|archive| archive.descriptor.hash.clone()).collect::<Vec<_>>();
        let unaccounted = archives
            .iter()
            .filter(|archive| !outcome.hashed.contains_key(&archive.descriptor.hash))
            .filter(|archive| !manual_hashes.contains(&archive.descriptor.hash))
            .cloned()
            .collect::<Vec<_>>();
        let mut failed = Vec::new();
        for archive in unaccounted {
            match self.cache.verify(archive.descriptor.clone()).await {
                Ok(verified) => {
                    outcome.hashed.insert(verified.descriptor.hash.clone(), verified);
                }
                Err(first_failure) => {
                    let target = self.cache.download_output_path(&archive.descriptor.name);
                    warn!(
                        name = %archive.descriptor.name,
                        "presumed corrupt ({first_failure:#}), deleting and re-downloading once"
                    );
                    match tokio::fs::remove_file(&target).await {
                        Ok(()) => {}
                        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                        Err(error) => {
                            return Err(error).with_context(|| format!("deleting corrupt [{}]", target.display()));
                        }
                    }
                    let recovered = self.downloaders.download(&archive, &target).await.map(|_| ());
                    match recovered {
                        Ok(()) => match self.cache.verify(archive.descriptor.clone()).await {
                            Ok(verified) => {
                                outcome.hashed.insert(verified.descriptor.hash.clone(), verified);
                            }
                            Err(second_failure) => {
                                warn!(name = %archive.descriptor.name, "still corrupt after re-download: {second_failure:#}");
                                failed.push(archive);
                            }
                        },
                        Err(reason) => {
                            warn!(name = %archive.descriptor.name, "re-download failed: {reason:#}");
                            failed.push(archive);
                        }
                    }
                }
            }
        }
        Ok(failed)
    }
}
