//! extraction through the external native tools (zip / 7z / rar and
//! installer-payload executables). one process run extracts into a scratch
//! directory; the tree is normalised and handed back as scratch entries.

use {
    super::{collect_extracted_tree, ExtractedFile, Percent, ProcessArchive},
    crate::paths::RelativePath,
    anyhow::{bail, Context, Result},
    itertools::Itertools,
    native_tools::{exit_code_of, pattern_file, ArchiveTool, PayloadTool},
    std::{
        collections::BTreeSet,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tempfile::TempDir,
    tracing::{info, instrument, warn},
};

const EXTRACTION_RETRIES: usize = 2;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// directory roots that get case variants in pattern files. configurable
/// because the well-known list is almost certainly incomplete for games this
/// engine has not met yet; the default covers the documented six.
#[derive(Debug, Clone)]
pub struct NativeExtractionConfig {
    pub case_variant_roots: Vec<String>,
}

impl Default for NativeExtractionConfig {
    fn default() -> Self {
        Self {
            case_variant_roots: pattern_file::DEFAULT_CASE_VARIANT_ROOTS
                .iter()
                .map(|root| root.to_string())
                .collect(),
        }
    }
}

enum Backend {
    /// zip / 7z / rar through the archive tool; the fallback backend differs in
    /// filename-encoding assumptions and is only consulted when the primary
    /// realises fewer entries than requested
    Archive { primary: ArchiveTool, fallback: Option<ArchiveTool> },
    /// installer executables - payload tool extracts everything, no subsetting
    InstallerPayload(PayloadTool),
}

pub struct NativeArchive {
    source: PathBuf,
    backend: Backend,
    config: NativeExtractionConfig,
}

impl std::fmt::Debug for NativeArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeArchive")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub const FALLBACK_ARCHIVE_TOOL_BINARIES: &[&str] = &["7za", "7z-legacy", "7z"];

impl NativeArchive {
    pub fn new_archive(source: &Path) -> Result<Self> {
        ArchiveTool::find_host().map(|primary| Self {
            source: source.to_path_buf(),
            backend: Backend::Archive {
                primary,
                fallback: native_tools::find_host_bin(FALLBACK_ARCHIVE_TOOL_BINARIES)
                    .ok()
                    .map(|tool| ArchiveTool::new(Arc::new(tool))),
            },
            config: NativeExtractionConfig::default(),
        })
    }
    pub fn new_installer_payload(source: &Path) -> Result<Self> {
        PayloadTool::find_host().map(|tool| Self {
            source: source.to_path_buf(),
            backend: Backend::InstallerPayload(tool),
            config: NativeExtractionConfig::default(),
        })
    }
    pub fn with_config(mut self, config: NativeExtractionConfig) -> Self {
        self.config = config;
        self
    }

    /// one tool run with the §-mandated policy: up to two retries with a
    /// second of back-off, destination wiped between attempts; exit 255 gets
    /// the archive-size / free-space diagnostics attached
    fn run_tool(&self, tool: &ArchiveTool, pattern: Option<&Path>, progress: Option<&(dyn Fn(Percent) + Send + Sync)>) -> Result<Arc<TempDir>> {
        let mut last_error = None;
        for attempt in 0..=EXTRACTION_RETRIES {
            if attempt > 0 {
                std::thread::sleep(RETRY_BACKOFF);
                info!(attempt, source=%self.source.display(), "retrying extraction");
            }
            let dest = match crate::utils::scoped_temp_dir().map(Arc::new) {
                Ok(dest) => dest,
                Err(error) => {
                    last_error = Some(error);
                    continue;
                }
            };
            match tool.extract(&self.source, dest.path(), pattern, |percent| {
                if let Some(progress) = progress {
                    progress(percent)
                }
            }) {
                Ok(()) => return Ok(dest),
                Err(error) => {
                    let error = match exit_code_of(&error) {
                        Some(255) => error.context(self.corruption_diagnostics(dest.path())),
                        _ => error,
                    };
                    warn!("extraction attempt [{attempt}] failed: {error:?}");
                    // the scratch dir drops here, cleaning the destination for the next attempt
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.expect("at least one attempt ran").context(format!(
            "extraction failed after [{}] attempts: [{}]",
            EXTRACTION_RETRIES + 1,
            self.source.display()
        )))
    }

    fn corruption_diagnostics(&self, dest: &Path) -> String {
        format!(
            "archive size: [{:?} bytes], destination free space: [{:?} bytes]",
            std::fs::metadata(&self.source).map(|metadata| metadata.len()),
            fs2::available_space(dest),
        )
    }

    fn extract_into_scratch(&self, pattern: Option<&Path>, progress: Option<&(dyn Fn(Percent) + Send + Sync)>) -> Result<Arc<TempDir>> {
        match &self.backend {
            Backend::Archive { primary, .. } => self.run_tool(primary, pattern, progress),
            Backend::InstallerPayload(tool) => {
                let dest = crate::utils::scoped_temp_dir().map(Arc::new)?;
                tool.extract(&self.source, dest.path())?;
                Ok(dest)
            }
        }
    }

    /// extracts exactly `only_files`. shortfall triggers one attempt through
    /// the fallback backend before the sanity-check error surfaces.
    #[instrument(skip(self, progress), level = "DEBUG")]
    pub fn extract_only(&mut self, only_files: &BTreeSet<RelativePath>, progress: Option<&(dyn Fn(Percent) + Send + Sync)>) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        let case_variant_roots = self
            .config
            .case_variant_roots
            .iter()
            .map(String::as_str)
            .collect_vec();
        let pattern = pattern_file::write_pattern_file(
            *crate::consts::TEMP_FILE_DIR,
            only_files.iter().map(|path| path.as_str()),
            &case_variant_roots,
        )?;
        let realise = |dest: Arc<TempDir>| -> Result<Vec<(RelativePath, ExtractedFile)>> {
            normalize_backslash_basenames(dest.path())?;
            let extracted = collect_extracted_tree(&dest)?;
            remap_to_requested(extracted, only_files)
        };
        let first_attempt = self
            .extract_into_scratch(Some(&pattern), progress)
            .and_then(&realise)?;
        if first_attempt.len() >= only_files.len() {
            return Ok(first_attempt);
        }
        let fallback = match &self.backend {
            Backend::Archive { fallback: Some(fallback), .. } => fallback.clone(),
            _ => return Ok(first_attempt),
        };
        warn!(
            expected = only_files.len(),
            realised = first_attempt.len(),
            "entry shortfall, attempting the alternate backend (different filename-encoding assumptions)"
        );
        match self.run_tool(&fallback, Some(&pattern), progress).and_then(realise) {
            Ok(fallback_result) if fallback_result.len() >= only_files.len() => Ok(fallback_result),
            Ok(short) => {
                warn!(realised = short.len(), "fallback backend also came up short, keeping the first result");
                Ok(first_attempt)
            }
            Err(error) => {
                warn!("fallback backend failed: {error:#}");
                Ok(first_attempt)
            }
        }
    }

    pub fn extract_matching(
        &mut self,
        should_extract: &impl Fn(&RelativePath) -> bool,
        progress: Option<&(dyn Fn(Percent) + Send + Sync)>,
    ) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        let dest = self.extract_into_scratch(None, progress)?;
        normalize_backslash_basenames(dest.path())?;
        collect_extracted_tree(&dest).map(|entries| {
            entries
                .into_iter()
                .filter(|(path, _)| should_extract(path))
                .collect()
        })
    }
}

impl ProcessArchive for NativeArchive {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>> {
        match &self.backend {
            Backend::Archive { primary, .. } => primary
                .list(&self.source)
                .map(|entries| entries.into_iter().map(|entry| RelativePath::from(entry.path.as_path())).collect()),
            Backend::InstallerPayload(_) => {
                // payload tools cannot list without extracting
                self.extract_matching(&|_| true, None)
                    .map(|entries| entries.into_iter().map(|(path, _)| path).collect())
            }
        }
    }
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        self.extract_only(&paths.iter().cloned().collect(), None)
    }
}

/// remaps extracted entries (whatever spelling the tool produced) back to the
/// paths the caller asked under
fn remap_to_requested(extracted: Vec<(RelativePath, ExtractedFile)>, requested: &BTreeSet<RelativePath>) -> Result<Vec<(RelativePath, ExtractedFile)>> {
    let by_key = requested
        .iter()
        .map(|path| (path.normalized(), path))
        .collect::<std::collections::BTreeMap<_, _>>();
    Ok(extracted
        .into_iter()
        .filter_map(|(found, handle)| by_key.get(&found.normalized()).map(|requested| ((*requested).clone(), handle)))
        .collect())
}

/// some tools emit entries whose *basename* contains a literal `\` on hosts
/// where `\` is not a separator. split such names into real directories before
/// anyone enumerates the tree.
pub fn normalize_backslash_basenames(root: &Path) -> Result<()> {
    let offenders = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().contains('\\'))
        .map(|entry| entry.path().to_path_buf())
        .collect_vec();
    for offender in offenders {
        let basename = offender
            .file_name()
            .context("walked file has no name")?
            .to_string_lossy()
            .to_string();
        let parent = offender.parent().context("walked file has no parent")?;
        let fixed = basename
            .split('\\')
            .filter(|segment| !segment.is_empty())
            .fold(parent.to_path_buf(), |acc, segment| acc.join(segment));
        if fixed == offender {
            continue;
        }
        if let Some(new_parent) = fixed.parent() {
            std::fs::create_dir_all(new_parent).with_context(|| format!("creating [{}]", new_parent.display()))?;
        }
        std::fs::rename(&offender, &fixed).with_context(|| format!("moving [{}] to [{}]", offender.display(), fixed.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_backslash_basenames_become_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(r"textures\armor\steel.dds"), b"dds").unwrap();
        std::fs::write(root.path().join("plain.txt"), b"txt").unwrap();
        normalize_backslash_basenames(root.path()).unwrap();
        assert!(root.path().join("textures").join("armor").join("steel.dds").exists());
        assert!(!root.path().join(r"textures\armor\steel.dds").exists());
        assert!(root.path().join("plain.txt").exists());
    }

    #[test]
    fn test_normalization_skips_empty_segments() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(r"a\\b"), b"x").unwrap();
        normalize_backslash_basenames(root.path()).unwrap();
        assert!(root.path().join("a").join("b").exists());
    }

    #[test]
    fn test_remap_prefers_requested_spelling() {
        let requested = [RelativePath::new("Textures/a.dds")].into_iter().collect::<BTreeSet<_>>();
        let extracted = vec![(
            RelativePath::new("textures/a.dds"),
            ExtractedFile::Memory(crate::compression::MemoryEntry {
                name: RelativePath::new("textures/a.dds"),
                bytes: vec![],
                modified: None,
            }),
        )];
        let remapped = remap_to_requested(extracted, &requested).unwrap();
        assert_eq!(remapped[0].0, RelativePath::new("Textures/a.dds"));
    }
}
