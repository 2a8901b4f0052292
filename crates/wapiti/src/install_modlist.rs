//! the installer state machine: fifteen phases in strict order, cancellable at
//! every boundary. once a phase completes it is never re-entered; recovery
//! never crosses more than one boundary (a corrupt archive re-downloads inside
//! the rehash phase, nothing else ever goes back).

use {
    crate::{
        config_file::WapitiConfig,
        data_dir::DataDirectory,
        downloaders::{meta_ini, Downloaders},
        error::{InstallAbort, TotalResult},
        hash_cache::HashCache,
        modlist_file::ModlistFile,
        modlist_json::{Directive, Modlist},
        resources::Resources,
        utils::Fingerprint,
        vfs::Vfs,
        DebugHelpers,
    },
    anyhow::{Context, Result},
    directives::{DirectivesHandler, DirectivesHandlerConfig, PatchCache},
    downloads::{DownloadSummary, Synchronizers},
    itertools::Itertools,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tap::prelude::*,
    tokio_util::sync::CancellationToken,
    tracing::{info, instrument, warn},
};

pub mod directives;
pub mod download_cache;
pub mod downloads;
pub mod fixup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum Phase {
    Configure,
    OptimizeModlist,
    HashArchives,
    DownloadArchives,
    ManualDownloadGate,
    RehashAndRecover,
    ExtractModlistBundle,
    PrimeVfs,
    BuildFolderStructure,
    InstallArchives,
    InstallInlineFiles,
    WriteMetaFiles,
    BuildContainerArchives,
    GenerateMergePatches,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 15] = [
        Phase::Configure,
        Phase::OptimizeModlist,
        Phase::HashArchives,
        Phase::DownloadArchives,
        Phase::ManualDownloadGate,
        Phase::RehashAndRecover,
        Phase::ExtractModlistBundle,
        Phase::PrimeVfs,
        Phase::BuildFolderStructure,
        Phase::InstallArchives,
        Phase::InstallInlineFiles,
        Phase::WriteMetaFiles,
        Phase::BuildContainerArchives,
        Phase::GenerateMergePatches,
        Phase::Finalize,
    ];
}

/// cancellation is honoured exactly here, between phases - in-flight work
/// inside a phase stops at its own suspension points but the phase result is
/// what decides the machine's fate
fn checkpoint(cancellation: &CancellationToken, phase: Phase) -> Result<()> {
    if cancellation.is_cancelled() {
        return Err(anyhow::Error::new(InstallAbort::Cancelled)).with_context(|| format!("cancelled before phase [{phase}]"));
    }
    info!("phase [{phase}]");
    Ok(())
}

/// phase 2: identical `(to, hash)` duplicates collapse to one; same `to` with
/// different content is a broken modlist and dies here, before any bytes move
pub fn optimize_directives(directives: Vec<Directive>) -> Result<Vec<Directive>> {
    let mut seen = BTreeMap::<String, String>::new();
    let mut optimized = Vec::with_capacity(directives.len());
    for directive in directives {
        let to = directive.to().clone().into_relative_path().normalized();
        let hash = directive.hash().to_string();
        match seen.get(&to) {
            Some(existing) if *existing == hash => {
                warn!(%to, "dropping redundant duplicate directive");
                continue;
            }
            Some(existing) => {
                anyhow::bail!("two directives target [{to}] with different content ([{existing}] vs [{hash}])");
            }
            None => {
                seen.insert(to, hash);
                optimized.push(directive);
            }
        }
    }
    Ok(optimized)
}

fn ensure_writable(directory: &Path) -> Result<()> {
    std::fs::create_dir_all(directory).with_context(|| format!("creating [{}]", directory.display()))?;
    tempfile::Builder::new()
        .prefix(".write-probe-")
        .tempfile_in(directory)
        .with_context(|| format!("[{}] is not writable", directory.display()))
        .map(|_| ())
}

pub struct Installer {
    pub config: WapitiConfig,
    pub resources: Arc<Resources>,
    pub cancellation: CancellationToken,
}

impl Installer {
    pub fn new(config: WapitiConfig, cancellation: CancellationToken) -> Self {
        let resources = Arc::new(Resources::new(config.resources, &cancellation));
        Self {
            config,
            resources,
            cancellation,
        }
    }

    #[instrument(skip_all, level = "INFO")]
    pub async fn install(self, debug: DebugHelpers) -> TotalResult<()> {
        self.install_inner(debug).await.map(|_| vec![()]).map_err(|error| vec![error])
    }

    async fn install_inner(self, debug: DebugHelpers) -> Result<()> {
        let Self {
            config,
            resources,
            cancellation,
        } = self;
        let installation_path = config.installation.installation_path.clone();
        let downloads_directory = config.downloaders.downloads_directory.clone();

        let (bundle, ModlistFile { modlist, entries, .. }) =
            ModlistFile::load(config.installation.modlist_file_path.clone()).context("loading modlist bundle")?;
        let Modlist {
            archives,
            directives,
            game_type,
            name,
            version,
            ..
        } = modlist;
        info!(%name, %version, archives = archives.len(), directives = directives.len(), "loaded modlist");

        let data_directory = DataDirectory::new(
            config
                .data_directory
                .clone()
                .unwrap_or_else(|| installation_path.join(".wapiti")),
        )?;
        let hash_cache = HashCache::open(&data_directory.hash_cache(), resources.file_hashing.clone())?;

        // ---- 1. configure
        checkpoint(&cancellation, Phase::Configure)?;
        ensure_writable(&installation_path).context("installation directory must be writable")?;
        ensure_writable(&downloads_directory).context("downloads directory must be writable")?;
        let game_directory = config
            .downloaders
            .games
            .get(&game_type)
            .map(|game| game.root_directory.clone())
            .map(Ok)
            .unwrap_or_else(|| {
                Err(anyhow::Error::new(InstallAbort::GameMissing))
                    .with_context(|| format!("game [{game_type}] is not configured (known: {:?})", config.downloaders.games.keys().collect_vec()))
            })?;
        if !game_directory.exists() {
            return Err(anyhow::Error::new(InstallAbort::GameInvalid {
                reason: format!("configured game directory [{}] does not exist", game_directory.display()),
            }))
            .context("validating game directory");
        }

        // ---- 2. optimise modlist
        checkpoint(&cancellation, Phase::OptimizeModlist)?;
        let directives = optimize_directives(directives)?.pipe(|directives| match &debug.start_from_directive {
            None => directives,
            Some(start_from) => directives
                .into_iter()
                .skip_while(|directive| directive.directive_hash() != *start_from)
                .collect(),
        });

        let synchronizers = Synchronizers::new(
            Arc::new(download_cache::DownloadCache::new(downloads_directory.clone(), hash_cache.clone())?),
            Downloaders::new(config.downloaders.clone(), resources.clone(), cancellation.clone())?.with_verification_cache(
                crate::downloaders::verification_cache::VerificationCache::open(
                    &data_directory.verification_cache(),
                    crate::downloaders::verification_cache::DEFAULT_TTL,
                )?,
            ),
            num_cpus::get(),
        );

        let download_summary: DownloadSummary = if debug.skip_verify_and_downloads {
            archives
                .iter()
                .map(|archive| {
                    (
                        archive.descriptor.hash.clone(),
                        crate::downloaders::WithArchiveDescriptor {
                            inner: synchronizers.cache.download_output_path(&archive.descriptor.name),
                            descriptor: archive.descriptor.clone(),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>()
                .pipe(Arc::new)
        } else {
            // ---- 3. hash archives
            checkpoint(&cancellation, Phase::HashArchives)?;
            let hashed = synchronizers.hash_existing(&archives).await;
            info!(reused = hashed.len(), total = archives.len(), "archives already on disk");

            // ---- 4. download archives
            checkpoint(&cancellation, Phase::DownloadArchives)?;
            let mut outcome = synchronizers.download_missing(&archives, &hashed).await;

            // ---- 5. manual-download gate
            checkpoint(&cancellation, Phase::ManualDownloadGate)?;
            if !outcome.manual.is_empty() {
                let manual_downloads = outcome.manual.clone();
                manual_downloads.iter().for_each(|archive| {
                    warn!(
                        name = %archive.descriptor.name,
                        source = %archive.state.primary_key_string(),
                        "requires manual download"
                    );
                });
                return Err(anyhow::Error::new(InstallAbort::DownloadFailed { manual_downloads }))
                    .context("manual downloads are required before the install can continue");
            }

            // ---- 6. rehash + corruption recovery
            checkpoint(&cancellation, Phase::RehashAndRecover)?;
            let failed = synchronizers.rehash_and_recover(&archives, &mut outcome).await?;
            if !failed.is_empty() {
                return Err(Downloaders::missing_archive_error(failed)).context("some archives could not be obtained");
            }
            Arc::new(outcome.hashed)
        };

        // ---- 7. extract modlist bundle
        checkpoint(&cancellation, Phase::ExtractModlistBundle)?;
        info!(blobs = entries.len().saturating_sub(1), "bundle opened, blobs load lazily");
        let patch_cache = Arc::new(PatchCache::new(data_directory.patch_cache(), bundle.clone())?);

        // ---- 8. prime vfs
        checkpoint(&cancellation, Phase::PrimeVfs)?;
        let vfs = Vfs::open(&data_directory.vfs_cache(), resources.clone())?;
        let archives_by_hash = download_summary
            .iter()
            .map(|(hash, entry)| (hash.clone(), entry.inner.clone()))
            .collect::<BTreeMap<String, PathBuf>>();
        let required_hash_paths = directives
            .iter()
            .filter_map(|directive| match directive {
                Directive::FromArchive(directive) => Some(directive.archive_hash_path.clone()),
                Directive::PatchedFromArchive(directive) => Some(directive.archive_hash_path.clone()),
                _ => None,
            })
            .collect_vec();
        vfs.prime(&archives_by_hash, &required_hash_paths).await?;

        // ---- 9. build folder structure
        checkpoint(&cancellation, Phase::BuildFolderStructure)?;
        directives
            .iter()
            .filter_map(|directive| directive.to().clone().into_path().parent().map(Path::to_path_buf))
            .unique()
            .try_for_each(|parent| {
                std::fs::create_dir_all(installation_path.join(&parent)).with_context(|| format!("creating [{}]", parent.display()))
            })?;

        let handler = DirectivesHandler::new(
            DirectivesHandlerConfig {
                bundle: bundle.clone(),
                output_directory: installation_path.clone(),
                game_directory,
                downloads_directory: downloads_directory.clone(),
            },
            resources.clone(),
            download_summary.clone(),
            patch_cache,
        )
        .pipe(Arc::new);

        let by_kind = |kind: crate::modlist_json::DirectiveKind| {
            directives
                .iter()
                .filter(|directive| directive.directive_kind() == kind)
                .cloned()
                .collect_vec()
        };
        use crate::modlist_json::DirectiveKind;

        // ---- 10. install archives
        checkpoint(&cancellation, Phase::InstallArchives)?;
        let archive_directives = directives
            .iter()
            .filter(|directive| {
                matches!(
                    directive.directive_kind(),
                    DirectiveKind::FromArchive | DirectiveKind::PatchedFromArchive
                )
            })
            .cloned()
            .collect_vec();
        handler
            .install_archives(archive_directives)
            .await
            .map_err(flatten_errors)
            .context("installing archive-sourced files")?;

        // ---- 11. install inline files
        checkpoint(&cancellation, Phase::InstallInlineFiles)?;
        handler
            .install_inline_files(by_kind(DirectiveKind::InlineFile))
            .await
            .map_err(flatten_errors)
            .context("installing inline files")?;

        // ---- 12. write meta files
        checkpoint(&cancellation, Phase::WriteMetaFiles)?;
        write_meta_files(&downloads_directory, &archives, &hash_cache).await?;

        // ---- 13. build container archives
        checkpoint(&cancellation, Phase::BuildContainerArchives)?;
        handler
            .build_containers(by_kind(DirectiveKind::CreateBSA))
            .await
            .map_err(flatten_errors)
            .context("building container archives")?;

        // ---- 14. generate merge patches
        checkpoint(&cancellation, Phase::GenerateMergePatches)?;
        handler
            .generate_merge_patches(by_kind(DirectiveKind::MergedPatch))
            .await
            .map_err(flatten_errors)
            .context("generating merge patches")?;

        // ---- 15. finalise
        checkpoint(&cancellation, Phase::Finalize)?;
        handler
            .write_remapped_files(by_kind(DirectiveKind::RemappedInlineFile))
            .await
            .map_err(flatten_errors)
            .context("writing remapped inline files")?;
        fixup::write_portable_marker(&installation_path)?;
        fixup::remap_mod_manager_ini(&installation_path, &downloads_directory)?;
        fixup::apply_resolution(&installation_path, config.fixup.game_resolution)?;

        info!("installation finished");
        Ok(())
    }
}

fn flatten_errors(errors: Vec<anyhow::Error>) -> anyhow::Error {
    anyhow::anyhow!(
        "[{}] directives failed:\n{}",
        errors.len(),
        errors.iter().enumerate().map(|(idx, error)| format!("{}. {error:?}", idx + 1)).join("\n")
    )
}

/// phase 12: every file in downloads that matches a modlist archive by
/// size-then-hash gets `installed=true` plus its source's ini lines; files the
/// modlist does not know get `removed=true`, unless a user-maintained meta is
/// already there
#[instrument(skip_all, level = "INFO")]
async fn write_meta_files(downloads_directory: &Path, archives: &[crate::modlist_json::Archive], hash_cache: &HashCache) -> Result<()> {
    let by_size = archives
        .iter()
        .map(|archive| (archive.descriptor.size, archive))
        .into_group_map();
    let downloads = std::fs::read_dir(downloads_directory)
        .with_context(|| format!("listing [{}]", downloads_directory.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            // sidecars and partials are not downloads
            !matches!(
                path.extension().map(|extension| extension.to_string_lossy().to_lowercase()).as_deref(),
                Some("meta" | "part")
            )
        })
        .collect_vec();
    for path in downloads {
        let size = std::fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0);
        let matched = match by_size.get(&size) {
            None => None,
            Some(candidates) => {
                let fingerprint = hash_cache.compute_or_cache(path.clone()).await?;
                candidates
                    .iter()
                    .find(|archive| {
                        Fingerprint::from_base_64(&archive.descriptor.hash)
                            .map(|expected| expected == fingerprint)
                            .unwrap_or(false)
                    })
                    .copied()
            }
        };
        let meta_path = meta_ini::meta_path(&path);
        match matched {
            Some(archive) => {
                std::fs::write(&meta_path, meta_ini::installed_meta(archive))
                    .with_context(|| format!("writing [{}]", meta_path.display()))?;
            }
            None => {
                let existing = std::fs::read_to_string(&meta_path).ok();
                if meta_ini::may_mark_removed(existing.as_deref()) {
                    std::fs::write(&meta_path, meta_ini::removed_meta())
                        .with_context(|| format!("writing [{}]", meta_path.display()))?;
                } else {
                    info!(meta = %meta_path.display(), "keeping user-maintained meta");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn inline_directive(to: &str, hash: &str) -> Directive {
        serde_json::from_value(serde_json::json!({
            "$type": "InlineFile",
            "Hash": hash,
            "Size": 1,
            "SourceDataID": "e4f1a9a3-3a2e-4b2a-9f3f-6c3a1f1a9a30",
            "To": to,
        }))
        .unwrap()
    }

    #[test]
    fn test_optimize_collapses_identical_duplicates() {
        let optimized = optimize_directives(vec![
            inline_directive("profiles\\a.txt", "AAECAwQFBgc="),
            inline_directive("profiles\\a.txt", "AAECAwQFBgc="),
            inline_directive("profiles\\b.txt", "AAECAwQFBgc="),
        ])
        .unwrap();
        assert_eq!(optimized.len(), 2);
    }

    #[test]
    fn test_optimize_rejects_conflicting_targets() {
        assert!(optimize_directives(vec![
            inline_directive("profiles\\a.txt", "AAECAwQFBgc="),
            inline_directive("profiles\\a.txt", "BwYFBAMCAQA="),
        ])
        .is_err());
    }

    #[test]
    fn test_phases_are_strictly_ordered() {
        let mut sorted = Phase::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Phase::ALL.to_vec());
        assert_eq!(Phase::ALL.len(), 15);
    }
}
