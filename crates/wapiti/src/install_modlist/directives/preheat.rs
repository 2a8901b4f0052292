//! batch extraction ahead of directive execution: every archive that feeds at
//! least one directive is opened exactly once, and all the entries the batch
//! needs come out of that single pass. nested hash paths are resolved level by
//! level through scratch files.

use {
    crate::{
        compression::{gathering_extract, ArchiveHandle, ProcessArchive},
        install_modlist::downloads::{DownloadSummary, DownloadSummaryExt},
        modlist_json::directive::ArchiveHashPath,
        paths::RelativePath,
    },
    anyhow::{Context, Result},
    itertools::Itertools,
    std::{
        collections::{BTreeMap, BTreeSet},
        path::{Path, PathBuf},
    },
    tempfile::TempPath,
    tracing::{info, instrument},
};

enum StagedSource {
    /// the hash path named the archive itself - no extraction happened
    Archive(PathBuf),
    Extracted(TempPath),
}

impl StagedSource {
    fn as_path(&self) -> &Path {
        match self {
            Self::Archive(path) => path,
            Self::Extracted(path) => path,
        }
    }
}

pub struct PreheatedSources {
    staged: BTreeMap<ArchiveHashPath, StagedSource>,
}

impl std::fmt::Debug for PreheatedSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreheatedSources").field("staged", &self.staged.len()).finish()
    }
}

fn segments_of(hash_path: &ArchiveHashPath) -> Vec<RelativePath> {
    hash_path
        .path
        .iter()
        .map(|segment| segment.clone().into_relative_path())
        .collect()
}

/// extracts one entry chain out of an already-staged level-one scratch file.
/// the scratch file has a meaningless name, so the extension hint comes from
/// the segment that produced it.
fn descend<'a>(mut current: TempPath, mut current_name: &'a RelativePath, remaining: &'a [RelativePath]) -> Result<TempPath> {
    for segment in remaining {
        let mut nested = ArchiveHandle::guess(&current, current_name.extension())
            .with_context(|| format!("opening nested archive [{current_name:?}]"))?;
        let handle = nested
            .get_handle(segment)
            .with_context(|| format!("extracting [{segment:?}] from nested archive"))?;
        let scratch = crate::utils::scoped_temp_path()?;
        handle.move_to(&scratch).context("staging nested entry")?;
        current = scratch;
        current_name = segment;
    }
    Ok(current)
}

impl PreheatedSources {
    /// blocking; meant for the compute pool. `hash_paths` is the union over
    /// the directive batch.
    #[instrument(skip_all, level = "INFO")]
    pub fn preheat(download_summary: &DownloadSummary, hash_paths: Vec<ArchiveHashPath>) -> Result<Self> {
        let mut staged = BTreeMap::new();
        let by_archive = hash_paths
            .into_iter()
            .unique()
            .into_group_map_by(|hash_path| hash_path.source_hash.clone());
        info!(archives = by_archive.len(), "preheating source archives");

        for (source_hash, group) in by_archive {
            let archive_path = download_summary.resolve_archive_path(&source_hash)?;
            // hash paths with no inner segments mean "the archive file itself"
            let (plain, nested): (Vec<_>, Vec<_>) = group.into_iter().partition(|hash_path| hash_path.path.is_empty());
            for hash_path in plain {
                staged.insert(hash_path, StagedSource::Archive(archive_path.clone()));
            }
            if nested.is_empty() {
                continue;
            }
            let first_level = nested
                .iter()
                .map(|hash_path| segments_of(hash_path)[0].clone())
                .collect::<BTreeSet<_>>();
            let mut extracted = gathering_extract(
                &archive_path,
                |_| true,
                |_, handle| {
                    let scratch = crate::utils::scoped_temp_path()?;
                    handle.move_to(&scratch).context("staging entry")?;
                    Ok(scratch)
                },
                Some(first_level),
                None,
            )
            .with_context(|| format!("preheating [{}]", archive_path.display()))?;

            // group nested chains by their first segment so a shared inner
            // archive is only staged once per chain
            for hash_path in nested {
                let segments = segments_of(&hash_path);
                let first = extracted
                    .remove(&segments[0])
                    .map(Ok)
                    .unwrap_or_else(|| {
                        // a second chain through the same first segment re-extracts it
                        gathering_extract(
                            &archive_path,
                            |_| true,
                            |_, handle| {
                                let scratch = crate::utils::scoped_temp_path()?;
                                handle.move_to(&scratch)?;
                                Ok(scratch)
                            },
                            Some([segments[0].clone()].into_iter().collect()),
                            None,
                        )
                        .and_then(|mut again| again.remove(&segments[0]).context("first segment vanished on re-extraction"))
                    })?;
                let resolved = descend(first, &segments[0], &segments[1..]).with_context(|| format!("resolving [{hash_path:?}]"))?;
                staged.insert(hash_path, StagedSource::Extracted(resolved));
            }
        }
        Ok(Self { staged })
    }

    pub fn get(&self, hash_path: &ArchiveHashPath) -> Result<&Path> {
        self.staged
            .get(hash_path)
            .map(StagedSource::as_path)
            .with_context(|| format!("[{hash_path:?}] was not preheated"))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{downloaders::WithArchiveDescriptor, modlist_json::ArchiveDescriptor, utils::MaybeWindowsPath},
        pretty_assertions::assert_eq,
        std::{io::Write, sync::Arc},
    };

    fn btar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
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
        out
    }

    fn summary_with(dir: &std::path::Path, name: &str, hash: &str, bytes: &[u8]) -> DownloadSummary {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
        Arc::new(
            [(
                hash.to_string(),
                WithArchiveDescriptor {
                    inner: path,
                    descriptor: ArchiveDescriptor {
                        hash: hash.to_string(),
                        meta: String::new(),
                        name: name.to_string(),
                        size: bytes.len() as u64,
                    },
                },
            )]
            .into_iter()
            .collect(),
        )
    }

    fn hash_path(source: &str, segments: &[&str]) -> ArchiveHashPath {
        ArchiveHashPath {
            source_hash: source.to_string(),
            path: segments.iter().map(|segment| MaybeWindowsPath(segment.to_string())).collect(),
        }
    }

    #[test]
    fn test_preheats_top_level_entries() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary_with(dir.path(), "source.btar", "aGFzaDAwMQ=", &btar_bytes(&[("a/b.txt", b"hello")]));
        let wanted = hash_path("aGFzaDAwMQ=", &["a\\b.txt"]);
        let preheated = PreheatedSources::preheat(&summary, vec![wanted.clone()]).unwrap();
        let staged = preheated.get(&wanted).unwrap();
        assert_eq!(std::fs::read(staged).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_hash_path_resolves_to_the_archive_itself() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = btar_bytes(&[("x", b"y")]);
        let summary = summary_with(dir.path(), "source.btar", "aGFzaDAwMg=", &bytes);
        let wanted = hash_path("aGFzaDAwMg=", &[]);
        let preheated = PreheatedSources::preheat(&summary, vec![wanted.clone()]).unwrap();
        assert_eq!(std::fs::read(preheated.get(&wanted).unwrap()).unwrap(), bytes);
    }

    #[test]
    fn test_nested_chain_is_resolved_level_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let inner = btar_bytes(&[("deep.txt", b"bottom")]);
        let outer = btar_bytes(&[("inner.btar", &inner)]);
        let summary = summary_with(dir.path(), "outer.btar", "aGFzaDAwMw=", &outer);
        let wanted = hash_path("aGFzaDAwMw=", &["inner.btar", "deep.txt"]);
        let preheated = PreheatedSources::preheat(&summary, vec![wanted.clone()]).unwrap();
        assert_eq!(std::fs::read(preheated.get(&wanted).unwrap()).unwrap(), b"bottom");
    }
}
