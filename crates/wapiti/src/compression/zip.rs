//! zip access for the modlist bundle itself. ordinary zip archives from the
//! downloads directory route through the external native tool instead - this
//! reader exists because the bundle is opened long before any tool discovery
//! runs, and its blobs are pulled one at a time by id.

use {
    super::{ExtractedFile, ProcessArchive, ScratchEntry},
    crate::{
        paths::RelativePath,
        utils::{MaybeWindowsPath, PathReadWrite},
    },
    anyhow::{Context, Result},
    std::{
        collections::BTreeMap,
        fs::File,
        io::{BufWriter, Seek},
        path::Path,
    },
    tap::prelude::*,
    tracing::info_span,
};

#[derive(Debug)]
pub struct ZipArchive(File);

impl ZipArchive {
    pub fn new(path: &Path) -> Result<Self> {
        path.open_file_read()
            .and_then(|(_path, mut file)| {
                ::zip::ZipArchive::new(&mut file)
                    .context("opening file as zip")
                    .map(drop)
                    .and_then(|_| file.rewind().context("rewinding").map(|_| file))
            })
            .map(Self)
    }
    fn with_archive<T, F: FnOnce(&mut ::zip::ZipArchive<&mut File>) -> Result<T>>(&mut self, with: F) -> Result<T> {
        self.0.pipe_ref_mut(|file| {
            ::zip::ZipArchive::new(&mut *file)
                .context("reading as archive")
                .and_then(|mut archive| with(&mut archive))
                .and_then(|out| file.rewind().context("rewinding file").map(|_| out))
        })
    }
    fn list_paths_with_originals(&mut self) -> Result<Vec<(String, RelativePath)>> {
        self.with_archive(|this| {
            (0..this.len())
                .filter_map(|idx| {
                    this.by_index(idx)
                        .with_context(|| format!("reading file idx [{idx}]"))
                        .map(|file| file.is_file().then_some(file))
                        .transpose()
                        .map(|file| {
                            file.map(|file| {
                                file.name()
                                    .to_string()
                                    .pipe(|name| (name.clone(), MaybeWindowsPath(name).into_relative_path()))
                            })
                        })
                })
                .collect::<Result<_>>()
                .context("listing archive contents")
        })
    }
}

impl ProcessArchive for ZipArchive {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>> {
        self.list_paths_with_originals()
            .map(|paths| paths.into_iter().map(|(_, p)| p).collect())
    }
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        self.list_paths_with_originals()
            .map(|listed| {
                listed
                    .into_iter()
                    .map(|(name, path)| (path.normalized(), name))
                    .collect::<BTreeMap<_, _>>()
            })
            .and_then(|mut name_lookup| {
                paths
                    .iter()
                    .map(|path| {
                        name_lookup
                            .remove(&path.normalized())
                            .with_context(|| format!("path [{path:?}] not found in archive"))
                            .map(|name| (path.clone(), name))
                    })
                    .collect::<Result<Vec<_>>>()
                    .context("figuring out correct archive paths")
            })
            .and_then(|files_to_extract| {
                self.with_archive(|archive| {
                    files_to_extract
                        .into_iter()
                        .map(|(archive_path, file_name)| {
                            let span = info_span!("extracting_file", ?archive_path, ?file_name);
                            span.in_scope(|| {
                                archive
                                    .by_name(&file_name)
                                    .with_context(|| format!("opening [{file_name}] ({archive_path:?})"))
                                    .and_then(|mut file| {
                                        let expected_size = file.size();
                                        let modified = file.last_modified().and_then(|zip_time| {
                                            chrono::NaiveDate::from_ymd_opt(zip_time.year() as i32, zip_time.month() as u32, zip_time.day() as u32)
                                                .and_then(|date| {
                                                    date.and_hms_opt(zip_time.hour() as u32, zip_time.minute() as u32, zip_time.second() as u32)
                                                })
                                                .map(|naive| std::time::SystemTime::from(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(naive, chrono::Utc)))
                                        });
                                        crate::utils::scoped_temp_file().and_then(|mut output| {
                                            let copy_result = std::io::copy(&mut file, &mut BufWriter::new(&mut output));
                                            copy_result
                                                .context("extracting into temp file")
                                                .and_then(|wrote| {
                                                    output.rewind().context("rewinding output file").and_then(|_| {
                                                        wrote
                                                            .eq(&expected_size)
                                                            .then_some(output)
                                                            .with_context(|| format!("expected [{expected_size}], found [{wrote}]"))
                                                    })
                                                })
                                                .map(|output| {
                                                    (
                                                        archive_path.clone(),
                                                        ExtractedFile::Scratch(ScratchEntry::new(archive_path, output.into_temp_path(), None, modified)),
                                                    )
                                                })
                                        })
                                    })
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })
            })
            .context("when getting multiple handles out of a zip archive")
    }
}
