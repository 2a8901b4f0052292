//! the extraction dispatcher: recognises an archive by signature, picks the
//! per-format extractor and yields named, extractable entries to a caller
//! supplied mapper.

use {
    crate::{
        file_signature::{recognize_path, FileType},
        paths::RelativePath,
        utils::PathReadWrite,
    },
    anyhow::{bail, Context, Result},
    std::{
        collections::{BTreeMap, BTreeSet},
        io::Read,
        path::Path,
        sync::Arc,
        time::SystemTime,
    },
    tap::prelude::*,
    tempfile::{TempDir, TempPath},
    tracing::{info_span, warn},
};

pub mod bsa;
pub mod btar;
pub mod native_archive;
pub mod omod;
pub mod zip;

/// an entry pulled out of some archive. single-use for [`ExtractedFile::move_to`];
/// dropping an un-moved handle releases whatever scratch bytes back it.
#[derive(Debug)]
pub enum ExtractedFile {
    /// backed by a scratch file (external tools, zip, omod)
    Scratch(ScratchEntry),
    /// zero-copy window into the source mapping (btar)
    Slice(SliceEntry),
    /// materialised in memory (container archive entries)
    Memory(MemoryEntry),
}

#[derive(Debug)]
pub struct ScratchEntry {
    pub name: RelativePath,
    pub path: TempPath,
    /// keeps the extraction directory alive as long as any entry of it is
    _directory: Option<Arc<TempDir>>,
    pub modified: Option<SystemTime>,
}

impl ScratchEntry {
    pub fn new(name: RelativePath, path: TempPath, directory: Option<Arc<TempDir>>, modified: Option<SystemTime>) -> Self {
        Self {
            name,
            path,
            _directory: directory,
            modified,
        }
    }
}

#[derive(Debug)]
pub struct SliceEntry {
    pub name: RelativePath,
    pub source: Arc<memmap2::Mmap>,
    pub start: usize,
    pub len: usize,
    pub modified: Option<SystemTime>,
}

#[derive(Debug)]
pub struct MemoryEntry {
    pub name: RelativePath,
    pub bytes: Vec<u8>,
    pub modified: Option<SystemTime>,
}

impl ExtractedFile {
    pub fn name(&self) -> &RelativePath {
        match self {
            Self::Scratch(entry) => &entry.name,
            Self::Slice(entry) => &entry.name,
            Self::Memory(entry) => &entry.name,
        }
    }
    pub fn last_modified(&self) -> Option<SystemTime> {
        match self {
            Self::Scratch(entry) => entry.modified,
            Self::Slice(entry) => entry.modified,
            Self::Memory(entry) => entry.modified,
        }
    }
    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Scratch(entry) => std::fs::metadata(&entry.path)
                .context("reading scratch entry metadata")
                .map(|metadata| metadata.len()),
            Self::Slice(entry) => Ok(entry.len as u64),
            Self::Memory(entry) => Ok(entry.bytes.len() as u64),
        }
    }
    pub fn get_stream(&self) -> Result<Box<dyn Read + Send + '_>> {
        let stream: Box<dyn Read + Send + '_> = match self {
            Self::Scratch(entry) => {
                let (_, file) = entry.path.open_file_read()?;
                Box::new(std::io::BufReader::new(file))
            }
            Self::Slice(entry) => Box::new(std::io::Cursor::new(&entry.source[entry.start..entry.start + entry.len])),
            Self::Memory(entry) => Box::new(std::io::Cursor::new(entry.bytes.as_slice())),
        };
        Ok(stream)
    }
    /// transfers ownership of the bytes to `target` and consumes the handle
    pub fn move_to(self, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating parent of [{}]", target.display()))?;
        }
        match self {
            Self::Scratch(entry) => entry
                .path
                .persist(target)
                .map(|_| ())
                .or_else(|persist| {
                    // rename across devices falls back to a copy
                    std::fs::copy(&persist.path, target)
                        .map(|_| ())
                        .with_context(|| format!("copying scratch entry to [{}]", target.display()))
                })
                .context("persisting scratch entry"),
            Self::Slice(entry) => target
                .open_file_write()
                .and_then(|(_, mut file)| {
                    std::io::copy(&mut std::io::Cursor::new(&entry.source[entry.start..entry.start + entry.len]), &mut file)
                        .context("writing slice entry")
                        .map(|_| ())
                }),
            Self::Memory(entry) => target
                .open_file_write()
                .and_then(|(_, mut file)| {
                    std::io::copy(&mut std::io::Cursor::new(entry.bytes.as_slice()), &mut file)
                        .context("writing memory entry")
                        .map(|_| ())
                }),
        }
    }
}

/// uniform view over the per-format extractors
pub trait ProcessArchive {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>>;
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>>;
    fn get_handle(&mut self, path: &RelativePath) -> Result<ExtractedFile> {
        self.get_many_handles(std::slice::from_ref(path))
            .and_then(|handles| handles.into_iter().next().context("no output"))
            .map(|(_, handle)| handle)
    }
}

#[derive(Debug, enum_kinds::EnumKind)]
#[enum_kind(ArchiveHandleKind, derive(derive_more::Display))]
pub enum ArchiveHandle {
    Btar(btar::BtarArchive),
    Bsa(bsa::BsaArchive),
    Omod(omod::OmodArchive),
    /// zip, 7z, rar and installer-payload executables all route through the
    /// external native tools
    Native(native_archive::NativeArchive),
}

impl ArchiveHandle {
    /// the format → extractor table. `.omod` wins over the zip signature it
    /// hides behind; `TES3` only counts as a container when the extension says so.
    pub fn guess(path: &Path, extension: Option<&str>) -> Result<Self> {
        let extension = extension.map(|e| e.to_lowercase());
        if extension.as_deref() == Some("omod") {
            return omod::OmodArchive::new(path).map(Self::Omod);
        }
        match recognize_path(path)? {
            Some(FileType::Btar) => btar::BtarArchive::new(path).map(Self::Btar),
            Some(FileType::Bsa) | Some(FileType::Ba2) => bsa::BsaArchive::new(path).map(Self::Bsa),
            Some(FileType::Tes3) if extension.as_deref() == Some("bsa") => bsa::BsaArchive::new(path).map(Self::Bsa),
            Some(FileType::Zip) | Some(FileType::SevenZip) | Some(FileType::RarOld) | Some(FileType::RarNew) => {
                native_archive::NativeArchive::new_archive(path).map(Self::Native)
            }
            Some(FileType::Exe) => native_archive::NativeArchive::new_installer_payload(path).map(Self::Native),
            Some(FileType::Tes3) | None => bail!("invalid file format: [{}]", path.display()),
        }
    }
}

impl ProcessArchive for ArchiveHandle {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>> {
        match self {
            Self::Btar(archive) => archive.list_paths(),
            Self::Bsa(archive) => archive.list_paths(),
            Self::Omod(archive) => archive.list_paths(),
            Self::Native(archive) => archive.list_paths(),
        }
    }
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        match self {
            Self::Btar(archive) => archive.get_many_handles(paths),
            Self::Bsa(archive) => archive.get_many_handles(paths),
            Self::Omod(archive) => archive.get_many_handles(paths),
            Self::Native(archive) => archive.get_many_handles(paths),
        }
    }
}

pub type Percent = u8;

/// the single public entry point of the dispatcher: runs every surviving entry
/// of `source` through `map` and gathers the results keyed by entry path.
///
/// when `only_files` is given the extractor must deliver exactly that set -
/// a shortfall (after the native backend's one encoding-fallback attempt) is
/// fatal for the archive.
pub fn gathering_extract<T>(
    source: &Path,
    should_extract: impl Fn(&RelativePath) -> bool,
    mut map: impl FnMut(&RelativePath, ExtractedFile) -> Result<T>,
    only_files: Option<BTreeSet<RelativePath>>,
    progress: Option<&(dyn Fn(Percent) + Send + Sync)>,
) -> Result<BTreeMap<RelativePath, T>> {
    let _span = info_span!("gathering_extract", source=%source.display()).entered();
    let extension = source.extension().map(|e| e.to_string_lossy().to_string());
    let mut archive = ArchiveHandle::guess(source, extension.as_deref())?;

    let handles = match (&mut archive, only_files.as_ref()) {
        // the native tool extracts the requested subset in one process run
        (ArchiveHandle::Native(native), Some(only_files)) => native.extract_only(only_files, progress)?,
        (ArchiveHandle::Native(native), None) => native
            .extract_matching(&should_extract, progress)?,
        (archive, only_files) => {
            let requested = archive.list_paths()?.pipe(|paths| {
                paths
                    .into_iter()
                    .filter(|path| should_extract(path))
                    .filter(|path| {
                        only_files
                            .map(|only| only.iter().any(|wanted| wanted.normalized() == path.normalized()))
                            .unwrap_or(true)
                    })
                    .collect::<Vec<_>>()
            });
            archive.get_many_handles(&requested)?
        }
    };

    let mut gathered = BTreeMap::new();
    for (path, handle) in handles {
        if !should_extract(&path) {
            continue;
        }
        let mapped = map(&path, handle).with_context(|| format!("mapping extracted entry [{path:?}]"))?;
        if gathered.insert(path.clone(), mapped).is_some() {
            warn!("archive delivered [{path:?}] twice, keeping the later copy");
        }
    }

    if let Some(only_files) = only_files {
        if gathered.len() != only_files.len() {
            let missing = only_files
                .iter()
                .filter(|wanted| {
                    gathered
                        .keys()
                        .all(|found| found.normalized() != wanted.normalized())
                })
                .collect::<Vec<_>>();
            bail!(
                "extraction sanity check failed for [{}]: expected [{}] entries, realised [{}], missing: {missing:#?}",
                source.display(),
                only_files.len(),
                gathered.len(),
            );
        }
    }
    Ok(gathered)
}

/// entries the dispatcher hands back from a destination directory walk
pub(crate) fn collect_extracted_tree(directory: &Arc<TempDir>) -> Result<Vec<(RelativePath, ExtractedFile)>> {
    walkdir::WalkDir::new(directory.path())
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let modified = entry.metadata().ok().and_then(|metadata| metadata.modified().ok());
            entry
                .path()
                .strip_prefix(directory.path())
                .context("entry outside of extraction directory")
                .map(RelativePath::from)
                .map(|relative| {
                    (
                        relative.clone(),
                        ExtractedFile::Scratch(ScratchEntry::new(
                            relative,
                            TempPath::from_path(entry.path().to_path_buf()),
                            Some(directory.clone()),
                            modified,
                        )),
                    )
                })
        })
        .collect()
}

