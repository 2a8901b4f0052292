use {
    super::write_atomically,
    crate::{
        modlist_file::{BundleHandle, BundleHandleExt},
        modlist_json::directive::RemappedInlineFileDirective,
    },
    anyhow::{Context, Result},
    itertools::Itertools,
    std::{convert::identity, io::Write, path::{Path, PathBuf}, sync::Arc},
    tap::prelude::*,
    tracing::instrument,
};

/// the template markers a compiled modlist leaves inside remapped files; each
/// expands to a directory of the target machine in one of three spellings
pub mod path_magic {
    pub static GAME_PATH_MAGIC_BACK: &str = "{--||GAME_PATH_MAGIC_BACK||--}";
    pub static GAME_PATH_MAGIC_DOUBLE_BACK: &str = "{--||GAME_PATH_MAGIC_DOUBLE_BACK||--}";
    pub static GAME_PATH_MAGIC_FORWARD: &str = "{--||GAME_PATH_MAGIC_FORWARD||--}";

    pub static MO2_PATH_MAGIC_BACK: &str = "{--||MO2_PATH_MAGIC_BACK||--}";
    pub static MO2_PATH_MAGIC_DOUBLE_BACK: &str = "{--||MO2_PATH_MAGIC_DOUBLE_BACK||--}";
    pub static MO2_PATH_MAGIC_FORWARD: &str = "{--||MO2_PATH_MAGIC_FORWARD||--}";

    pub static DOWNLOAD_PATH_MAGIC_BACK: &str = "{--||DOWNLOAD_PATH_MAGIC_BACK||--}";
    pub static DOWNLOAD_PATH_MAGIC_DOUBLE_BACK: &str = "{--||DOWNLOAD_PATH_MAGIC_DOUBLE_BACK||--}";
    pub static DOWNLOAD_PATH_MAGIC_FORWARD: &str = "{--||DOWNLOAD_PATH_MAGIC_FORWARD||--}";
}

#[derive(Debug)]
pub struct RemappingContext {
    pub game_folder: PathBuf,
    pub output_directory: PathBuf,
    pub downloads_directory: PathBuf,
}

impl RemappingContext {
    pub fn remap_file_contents(&self, data: &str) -> String {
        use path_magic::*;
        self.pipe(
            |Self {
                 game_folder,
                 output_directory,
                 downloads_directory,
             }| {
                // the markers differ only in separator spelling; start from the
                // host rendering and rewrite separators per marker flavour
                let expand = |directory: &Path, delimiter: &str| {
                    directory
                        .iter()
                        .map(|segment| segment.to_string_lossy())
                        .filter(|segment| segment != std::path::MAIN_SEPARATOR_STR)
                        .join(delimiter)
                        .pipe(|joined| match directory.is_absolute() && !joined.starts_with(['/', '\\']) {
                            true => format!("{delimiter}{joined}"),
                            false => joined,
                        })
                };
                data.replace(GAME_PATH_MAGIC_BACK, &expand(game_folder, "\\"))
                    .replace(GAME_PATH_MAGIC_DOUBLE_BACK, &expand(game_folder, "\\\\"))
                    .replace(GAME_PATH_MAGIC_FORWARD, &expand(game_folder, "/"))
                    .replace(MO2_PATH_MAGIC_BACK, &expand(output_directory, "\\"))
                    .replace(MO2_PATH_MAGIC_DOUBLE_BACK, &expand(output_directory, "\\\\"))
                    .replace(MO2_PATH_MAGIC_FORWARD, &expand(output_directory, "/"))
                    .replace(DOWNLOAD_PATH_MAGIC_BACK, &expand(downloads_directory, "\\"))
                    .replace(DOWNLOAD_PATH_MAGIC_DOUBLE_BACK, &expand(downloads_directory, "\\\\"))
                    .replace(DOWNLOAD_PATH_MAGIC_FORWARD, &expand(downloads_directory, "/"))
            },
        )
    }
}

#[derive(Clone, Debug)]
pub struct RemappedInlineFileHandler {
    pub remapping_context: Arc<RemappingContext>,
    pub bundle: BundleHandle,
    pub output_directory: PathBuf,
}

impl RemappedInlineFileHandler {
    /// substitution changes the bytes, so the directive's recorded hash cannot
    /// be enforced here - remapped files are inherently machine specific
    #[instrument(skip(self), level = "INFO")]
    pub async fn handle(
        &self,
        RemappedInlineFileDirective {
            hash: _,
            size: _,
            source_data_id,
            to,
        }: RemappedInlineFileDirective,
    ) -> Result<u64> {
        let output_path = self.output_directory.join(to.into_path());
        let bundle = self.bundle.clone();
        let remapping_context = self.remapping_context.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let template = bundle
                .read_blob_blocking(&source_data_id)
                .context("reading the file for remapping")
                .and_then(|blob| String::from_utf8(blob).context("remapped files are text by definition"))?;
            let remapped = remapping_context.remap_file_contents(&template);
            write_atomically(&output_path, |file| {
                file.write_all(remapped.as_bytes())
                    .and_then(|_| file.flush())
                    .context("writing remapped file")
            })
            .map(|_| remapped.len() as u64)
        })
        .await
        .context("thread crashed")
        .and_then(identity)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_remapping_expands_all_spellings() {
        let context = RemappingContext {
            game_folder: PathBuf::from("/games/skyrim"),
            output_directory: PathBuf::from("/installed/list"),
            downloads_directory: PathBuf::from("/downloads"),
        };
        let template = "game={--||GAME_PATH_MAGIC_FORWARD||--}\nmods={--||MO2_PATH_MAGIC_BACK||--}\ndl={--||DOWNLOAD_PATH_MAGIC_DOUBLE_BACK||--}";
        assert_eq!(
            context.remap_file_contents(template),
            "game=/games/skyrim\nmods=\\installed\\list\ndl=\\\\downloads"
        );
    }
}
