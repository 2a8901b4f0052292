//! loading of the modlist bundle: a zip with a single top-level `modlist` json
//! entry plus opaque blobs keyed by uuid. blobs are pulled lazily, one at a
//! time, through the shared handle.

use {
    crate::{
        compression::{zip::ZipArchive, ProcessArchive},
        paths::RelativePath,
    },
    anyhow::{Context, Result},
    std::{
        io::Read,
        path::PathBuf,
        sync::Arc,
    },
    tap::prelude::*,
};

const MODLIST_JSON_FILENAME: &str = "modlist";

/// shared, lazily-consulted view of the opened bundle
pub type BundleHandle = Arc<tokio::sync::Mutex<ZipArchive>>;

#[extension_traits::extension(pub trait BundleHandleExt)]
impl BundleHandle {
    fn from_archive(archive: ZipArchive) -> Self {
        Arc::new(tokio::sync::Mutex::new(archive))
    }
    /// reads one embedded blob fully; blobs are small relative to archives
    fn read_blob_blocking(&self, id: &uuid::Uuid) -> Result<Vec<u8>> {
        let mut archive = self.blocking_lock();
        archive
            .get_handle(&RelativePath::new(id.hyphenated().to_string()))
            .with_context(|| format!("blob [{id}] not present in the bundle"))
            .and_then(|handle| {
                Vec::new().pipe(|mut bytes| {
                    handle
                        .get_stream()?
                        .read_to_end(&mut bytes)
                        .context("reading blob")
                        .map(|_| bytes)
                })
            })
    }
}

#[derive(Debug)]
pub struct ModlistFile {
    pub modlist_file_path: PathBuf,
    pub entries: Vec<RelativePath>,
    pub modlist: crate::modlist_json::Modlist,
}

impl ModlistFile {
    pub fn load(path: PathBuf) -> Result<(BundleHandle, Self)> {
        ZipArchive::new(&path)
            .context("opening bundle as zip")
            .and_then(|mut archive| {
                archive.list_paths().and_then(|entries| {
                    archive
                        .get_handle(&RelativePath::new(MODLIST_JSON_FILENAME))
                        .context("bundle has no top-level modlist entry")
                        .and_then(|handle| {
                            String::new().pipe(|mut json| {
                                handle
                                    .get_stream()?
                                    .read_to_string(&mut json)
                                    .context("reading modlist entry")
                                    .and_then(|_| crate::utils::deserialize_json_with_error_location(&json))
                            })
                        })
                        .with_context(|| format!("reading [{MODLIST_JSON_FILENAME}]"))
                        .map(|modlist| Self {
                            modlist_file_path: path,
                            entries,
                            modlist,
                        })
                        .map(|this| (BundleHandle::from_archive(archive), this))
                })
            })
    }
}
