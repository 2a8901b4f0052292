//! per-directive-class handlers plus the shared plumbing they hang off of:
//! patch-blob cache, staging constants, the hash-check allow-list and the
//! fan-out driver that runs a batch of directives under the installer resource.

use {
    super::downloads::DownloadSummary,
    crate::{
        error::TotalResult,
        modlist_file::{BundleHandle, BundleHandleExt},
        modlist_json::Directive,
        resources::Resources,
        utils::{spawn_rayon, PathReadWrite},
    },
    anyhow::{Context, Result},
    futures::{StreamExt, TryStreamExt},
    itertools::Itertools,
    std::{
        io::Write,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tap::prelude::*,
    tracing::{info, instrument, trace},
};

pub mod create_bsa;
pub mod from_archive;
pub mod inline_file;
pub mod merged_patch;
pub mod patched_from_archive;
pub mod preheat;
pub mod remapped_inline_file;

/// directives targeting container staging land under this directory of the
/// installation until the containers are packed
pub const BSA_CREATION_DIR: &str = "TEMP_BSA_FILES";

/// outputs the mod manager itself mutates after install; their bytes are
/// expected to drift from the directive's recorded hash
pub const KNOWN_MODIFIED_BASENAMES: &[&str] = &["modlist.txt", "SkyrimPrefs.ini"];

/// container headers are hashed into dds entries at compile time, so extracted
/// copies never match
const EXTENSION_HASH_WHITELIST: &[&str] = &["dds"];

pub fn is_hash_check_exempt(path: &Path) -> bool {
    let by_extension = matches!(
        path.extension().map(|extension| extension.to_string_lossy().to_lowercase()).as_deref(),
        Some(extension) if EXTENSION_HASH_WHITELIST.contains(&extension)
    );
    let by_basename = path
        .file_name()
        .map(|name| {
            KNOWN_MODIFIED_BASENAMES
                .iter()
                .any(|known| known.eq_ignore_ascii_case(&name.to_string_lossy()))
        })
        .unwrap_or(false);
    by_extension || by_basename
}

/// directive outputs never appear half-written: bytes land in a scratch file
/// next to the target (same file system, so the final rename is atomic) and a
/// failed or cancelled producer only ever leaves the scratch behind, which its
/// guard removes
pub(crate) fn write_atomically(target: &Path, produce: impl FnOnce(&mut std::fs::File) -> Result<()>) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("[{}] has no parent directory", target.display()))?;
    std::fs::create_dir_all(parent).with_context(|| format!("creating [{}]", parent.display()))?;
    let mut scratch = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(parent)
        .context("creating scratch file next to target")?;
    produce(scratch.as_file_mut()).with_context(|| format!("producing contents of [{}]", target.display()))?;
    scratch
        .persist(target)
        .with_context(|| format!("moving finished file into place at [{}]", target.display()))
        .map(|_| ())
}

/// on-disk intermediate storage for binary-patch blobs: each blob is pulled
/// out of the bundle once and reopened from disk on every later use
pub struct PatchCache {
    root: PathBuf,
    bundle: BundleHandle,
}

impl std::fmt::Debug for PatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchCache").field("root", &self.root).finish()
    }
}

impl PatchCache {
    pub fn new(root: PathBuf, bundle: BundleHandle) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating patch cache at [{}]", root.display()))
            .map(|_| Self { root, bundle })
    }
    fn blob_path(&self, id: &uuid::Uuid) -> PathBuf {
        self.root.join(id.hyphenated().to_string())
    }
    pub fn open_patch(&self, id: &uuid::Uuid) -> Result<std::fs::File> {
        let on_disk = self.blob_path(id);
        if !on_disk.exists() {
            let blob = self.bundle.read_blob_blocking(id)?;
            on_disk
                .open_file_write()
                .and_then(|(_, mut file)| file.write_all(&blob).context("caching patch blob"))?;
        }
        on_disk.open_file_read().map(|(_, file)| file)
    }
}

#[derive(Debug, Clone)]
pub struct DirectivesHandlerConfig {
    pub bundle: BundleHandle,
    pub output_directory: PathBuf,
    pub game_directory: PathBuf,
    pub downloads_directory: PathBuf,
}

pub struct DirectivesHandler {
    pub config: DirectivesHandlerConfig,
    pub resources: Arc<Resources>,
    pub download_summary: DownloadSummary,
    pub from_archive: from_archive::FromArchiveHandler,
    pub patched_from_archive: patched_from_archive::PatchedFromArchiveHandler,
    pub inline_file: inline_file::InlineFileHandler,
    pub remapped_inline_file: remapped_inline_file::RemappedInlineFileHandler,
    pub merged_patch: merged_patch::MergedPatchHandler,
    pub create_bsa: create_bsa::CreateBsaHandler,
}

impl DirectivesHandler {
    pub fn new(config: DirectivesHandlerConfig, resources: Arc<Resources>, download_summary: DownloadSummary, patch_cache: Arc<PatchCache>) -> Self {
        let DirectivesHandlerConfig {
            bundle,
            output_directory,
            game_directory,
            downloads_directory,
        } = config.clone();
        Self {
            config,
            resources,
            download_summary,
            from_archive: from_archive::FromArchiveHandler {
                output_directory: output_directory.clone(),
            },
            patched_from_archive: patched_from_archive::PatchedFromArchiveHandler {
                output_directory: output_directory.clone(),
                patch_cache: patch_cache.clone(),
            },
            inline_file: inline_file::InlineFileHandler {
                bundle: bundle.clone(),
                output_directory: output_directory.clone(),
            },
            remapped_inline_file: remapped_inline_file::RemappedInlineFileHandler {
                remapping_context: Arc::new(remapped_inline_file::RemappingContext {
                    game_folder: game_directory,
                    output_directory: output_directory.clone(),
                    downloads_directory,
                }),
                bundle,
                output_directory: output_directory.clone(),
            },
            merged_patch: merged_patch::MergedPatchHandler {
                output_directory: output_directory.clone(),
                patch_cache,
            },
            create_bsa: create_bsa::CreateBsaHandler { output_directory },
        }
    }

    fn concurrency(&self) -> usize {
        num_cpus::get().max(1)
    }

    /// phase 10: every archive-sourced directive of the batch, preheated once
    /// per source archive, then fanned out under the installer resource
    #[instrument(skip_all, level = "INFO")]
    pub async fn install_archives(self: &Arc<Self>, directives: Vec<Directive>) -> TotalResult<u64> {
        let hash_paths = directives
            .iter()
            .filter_map(|directive| match directive {
                Directive::FromArchive(directive) => Some(directive.archive_hash_path.clone()),
                Directive::PatchedFromArchive(directive) => Some(directive.archive_hash_path.clone()),
                _ => None,
            })
            .collect_vec();
        let download_summary = self.download_summary.clone();
        let preheated = spawn_rayon(move || preheat::PreheatedSources::preheat(&download_summary, hash_paths))
            .await
            .map(Arc::new)
            .map_err(|error| vec![error])?;
        info!(count = directives.len(), "installing archive-sourced directives");

        directives
            .pipe(futures::stream::iter)
            .map(|directive| {
                let this = self.clone();
                let preheated = preheated.clone();
                async move {
                    let job = this
                        .resources
                        .installer
                        .begin(format!("installing {:?}", directive.to()), directive.size())
                        .await?;
                    let outcome = spawn_rayon({
                        let this = this.clone();
                        move || match directive {
                            Directive::FromArchive(directive) => this.from_archive.handle(directive, preheated),
                            Directive::PatchedFromArchive(directive) => this.patched_from_archive.handle(directive, preheated),
                            other => anyhow::bail!("[{}] does not belong in the archive phase", other.directive_kind()),
                        }
                    })
                    .await;
                    this.resources.installer.finish(job);
                    outcome
                }
            })
            .buffer_unordered(self.concurrency())
            .inspect_ok(|size| trace!(size, "directive handled"))
            .collect::<Vec<_>>()
            .await
            .pipe(collect_total)
    }

    /// phase 11
    #[instrument(skip_all, level = "INFO")]
    pub async fn install_inline_files(self: &Arc<Self>, directives: Vec<Directive>) -> TotalResult<u64> {
        directives
            .pipe(futures::stream::iter)
            .map(|directive| {
                let this = self.clone();
                async move {
                    match directive {
                        Directive::InlineFile(directive) => this.inline_file.handle(directive).await,
                        other => anyhow::bail!("[{}] does not belong in the inline phase", other.directive_kind()),
                    }
                }
            })
            .buffer_unordered(self.concurrency())
            .collect::<Vec<_>>()
            .await
            .pipe(collect_total)
    }

    /// phase 13 - containers pack one at a time; each pack is itself parallel
    /// on the compute pool and memory-hungry enough as it is
    #[instrument(skip_all, level = "INFO")]
    pub async fn build_containers(self: &Arc<Self>, directives: Vec<Directive>) -> TotalResult<u64> {
        let mut outcomes = Vec::new();
        for directive in directives {
            let this = self.clone();
            let outcome = spawn_rayon(move || match directive {
                Directive::CreateBSA(directive) => this.create_bsa.handle(directive),
                other => anyhow::bail!("[{}] does not belong in the container phase", other.directive_kind()),
            })
            .await;
            outcomes.push(outcome);
        }
        outcomes.pipe(collect_total)
    }

    /// phase 14
    #[instrument(skip_all, level = "INFO")]
    pub async fn generate_merge_patches(self: &Arc<Self>, directives: Vec<Directive>) -> TotalResult<u64> {
        let mut outcomes = Vec::new();
        for directive in directives {
            let this = self.clone();
            let outcome = spawn_rayon(move || match directive {
                Directive::MergedPatch(directive) => this.merged_patch.handle(directive),
                other => anyhow::bail!("[{}] does not belong in the merge phase", other.directive_kind()),
            })
            .await;
            outcomes.push(outcome);
        }
        outcomes.pipe(collect_total)
    }

    /// runs during finalisation: remapped files carry machine-local paths, so
    /// they materialise after everything content-addressed is in place
    #[instrument(skip_all, level = "INFO")]
    pub async fn write_remapped_files(self: &Arc<Self>, directives: Vec<Directive>) -> TotalResult<u64> {
        directives
            .pipe(futures::stream::iter)
            .map(|directive| {
                let this = self.clone();
                async move {
                    match directive {
                        Directive::RemappedInlineFile(directive) => this.remapped_inline_file.handle(directive).await,
                        other => anyhow::bail!("[{}] does not belong in the remap phase", other.directive_kind()),
                    }
                }
            })
            .buffer_unordered(self.concurrency())
            .collect::<Vec<_>>()
            .await
            .pipe(collect_total)
    }
}

fn collect_total(outcomes: Vec<Result<u64>>) -> TotalResult<u64> {
    let (handled, failed): (Vec<_>, Vec<_>) = outcomes.into_iter().partition_result();
    match failed.is_empty() {
        true => Ok(handled),
        false => Err(failed),
    }
}

const _: () = {
    fn assert_send<T: Send>() {}
    fn assertions() {
        assert_send::<DirectivesHandler>();
    }
};

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_hash_check_exemptions() {
        assert!(is_hash_check_exempt(Path::new("mods/Some Mod/textures/a.DDS")));
        assert!(is_hash_check_exempt(Path::new("profiles/Default/modlist.txt")));
        assert!(is_hash_check_exempt(Path::new("profiles/Default/skyrimprefs.ini")));
        assert!(!is_hash_check_exempt(Path::new("mods/Some Mod/meshes/a.nif")));
    }

    #[test]
    fn test_collect_total_partitions() {
        let outcomes = vec![Ok(1), Err(anyhow::anyhow!("boom")), Ok(2)];
        assert!(collect_total(outcomes).is_err());
        assert_eq!(collect_total(vec![Ok(1), Ok(2)]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_atomic_write_leaves_nothing_behind_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mods").join("output.esp");
        let failed = write_atomically(&target, |file| {
            file.write_all(b"half of the").context("writing")?;
            anyhow::bail!("producer died mid-write")
        });
        assert!(failed.is_err());
        assert!(!target.exists());
        assert_eq!(
            std::fs::read_dir(dir.path().join("mods")).unwrap().count(),
            0,
            "no scratch residue"
        );
    }

    #[test]
    fn test_atomic_write_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mods").join("output.esp");
        write_atomically(&target, |file| file.write_all(b"whole file").context("writing")).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"whole file");
    }
}
