//! in-process reader over the two game-native container families, backed by
//! the `ba2` crate. entries are materialised per-file so the caller can stream
//! and hash them without touching disk.

use {
    super::{ExtractedFile, MemoryEntry, ProcessArchive},
    crate::{
        file_signature::{recognize_path, FileType},
        paths::RelativePath,
    },
    anyhow::{bail, Context, Result},
    ba2::prelude::*,
    std::{collections::BTreeMap, path::Path},
    tap::prelude::*,
};

pub enum BsaArchive {
    Tes4 {
        archive: ba2::tes4::Archive<'static>,
        options: ba2::tes4::ArchiveOptions,
    },
    Fo4 {
        archive: ba2::fo4::Archive<'static>,
    },
}

impl std::fmt::Debug for BsaArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tes4 { .. } => f.write_str("BsaArchive::Tes4"),
            Self::Fo4 { .. } => f.write_str("BsaArchive::Fo4"),
        }
    }
}

impl BsaArchive {
    pub fn new(path: &Path) -> Result<Self> {
        match recognize_path(path)? {
            Some(FileType::Ba2) => ba2::fo4::Archive::read(path)
                .with_context(|| format!("reading ba2 container [{}]", path.display()))
                .map(|(archive, _meta)| Self::Fo4 { archive }),
            Some(FileType::Bsa) | Some(FileType::Tes3) => ba2::tes4::Archive::read(path)
                .with_context(|| format!("reading bsa container [{}]", path.display()))
                .map(|(archive, options)| Self::Tes4 { archive, options }),
            other => bail!("[{}] is not a container archive (recognized as {other:?})", path.display()),
        }
    }

    fn materialize_all(&self) -> Result<Vec<(RelativePath, Vec<u8>)>> {
        let mut gathered = Vec::new();
        match self {
            Self::Tes4 { archive, options } => {
                let compression_options = ba2::tes4::FileCompressionOptions::builder()
                    .version(options.version())
                    .build();
                for (directory_key, directory) in archive.iter() {
                    for (file_key, file) in directory.iter() {
                        let name = RelativePath::new(format!("{}/{}", directory_key.name(), file_key.name()));
                        let bytes = match file.is_compressed() {
                            true => file
                                .decompress(&compression_options)
                                .with_context(|| format!("decompressing [{name:?}]"))?
                                .as_bytes()
                                .to_vec(),
                            false => file.as_bytes().to_vec(),
                        };
                        gathered.push((name, bytes));
                    }
                }
            }
            Self::Fo4 { archive } => {
                let compression_options = ba2::fo4::ChunkCompressionOptions::default();
                for (key, file) in archive.iter() {
                    let name = RelativePath::new(format!("{}", key.name()));
                    let mut bytes = Vec::new();
                    for chunk in file.iter() {
                        match chunk.is_compressed() {
                            true => bytes.extend_from_slice(
                                chunk
                                    .decompress(&compression_options)
                                    .with_context(|| format!("decompressing a chunk of [{name:?}]"))?
                                    .as_bytes(),
                            ),
                            false => bytes.extend_from_slice(chunk.as_bytes()),
                        }
                    }
                    gathered.push((name, bytes));
                }
            }
        }
        Ok(gathered)
    }
}

impl ProcessArchive for BsaArchive {
    fn list_paths(&mut self) -> Result<Vec<RelativePath>> {
        match self {
            Self::Tes4 { archive, .. } => archive
                .iter()
                .flat_map(|(directory_key, directory)| {
                    directory
                        .iter()
                        .map(move |(file_key, _)| RelativePath::new(format!("{}/{}", directory_key.name(), file_key.name())))
                })
                .collect::<Vec<_>>()
                .pipe(Ok),
            Self::Fo4 { archive } => archive
                .iter()
                .map(|(key, _)| RelativePath::new(format!("{}", key.name())))
                .collect::<Vec<_>>()
                .pipe(Ok),
        }
    }
    fn get_many_handles(&mut self, paths: &[RelativePath]) -> Result<Vec<(RelativePath, ExtractedFile)>> {
        let mut materialized = self
            .materialize_all()?
            .into_iter()
            .map(|(name, bytes)| (name.normalized(), bytes))
            .collect::<BTreeMap<_, _>>();
        paths
            .iter()
            .map(|path| {
                materialized
                    .remove(&path.normalized())
                    .with_context(|| format!("path [{path:?}] not found in container"))
                    .map(|bytes| {
                        (
                            path.clone(),
                            ExtractedFile::Memory(MemoryEntry {
                                name: path.clone(),
                                bytes,
                                modified: None,
                            }),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()
            .context("when getting multiple handles out of a container archive")
    }
}
