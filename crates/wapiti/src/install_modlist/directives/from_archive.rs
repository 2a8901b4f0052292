use {
    super::{is_hash_check_exempt, preheat::PreheatedSources, write_atomically},
    crate::{
        modlist_json::directive::FromArchiveDirective,
        progress_bars::IndicatifWrapIoExt,
        read_wrappers::ReadExt,
        utils::{to_u64_from_base_64, Fingerprint, PathReadWrite},
    },
    anyhow::{Context, Result},
    std::{
        io::{Read, Write},
        path::PathBuf,
        sync::Arc,
    },
    tap::prelude::*,
    tracing::info_span,
};

#[derive(Clone, Debug)]
pub struct FromArchiveHandler {
    pub output_directory: PathBuf,
}

impl FromArchiveHandler {
    #[tracing::instrument(skip(self, preheated), level = "INFO")]
    pub fn handle(
        &self,
        FromArchiveDirective {
            hash,
            size,
            to,
            archive_hash_path,
        }: FromArchiveDirective,
        preheated: Arc<PreheatedSources>,
    ) -> Result<u64> {
        let source_file = preheated
            .get(&archive_hash_path)
            .with_context(|| format!("resolving hash path [{archive_hash_path:?}]"))
            .context("finding source file")?;
        let output_path = self.output_directory.join(to.into_path());

        let perform_copy = |from: &mut dyn Read, to: &mut dyn Write| {
            info_span!("perform_copy").in_scope(|| {
                let mut writer = std::io::BufWriter::new(to);
                let mut reader: Box<dyn Read> = match is_hash_check_exempt(&output_path) {
                    true => tracing::Span::current()
                        .wrap_read(size, from)
                        .and_validate_size(size)
                        .pipe(Box::new),
                    false => tracing::Span::current()
                        .wrap_read(size, from)
                        .and_validate_size(size)
                        .and_validate_hash(to_u64_from_base_64(&hash).map(Fingerprint)?)
                        .pipe(Box::new),
                };
                std::io::copy(&mut reader, &mut writer)
                    .context("copying file from archive")
                    .and_then(|_| writer.flush().context("flushing write"))
                    .map(|_| ())
                    .context("performing file copy")
            })
        };

        source_file
            .open_file_read()
            .and_then(|(source_path, mut source)| {
                write_atomically(&output_path, |output_file| perform_copy(&mut source, output_file)).with_context(|| {
                    format!(
                        "when extracting from [{source_path:?}] ({archive_hash_path:?}) to [{}]",
                        output_path.display()
                    )
                })
            })
            .map(|_| size)
    }
}
