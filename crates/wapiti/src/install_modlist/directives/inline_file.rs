use {
    super::{is_hash_check_exempt, write_atomically},
    crate::{
        modlist_file::{BundleHandle, BundleHandleExt},
        modlist_json::directive::InlineFileDirective,
        progress_bars::IndicatifWrapIoExt,
        read_wrappers::ReadExt,
        utils::{to_u64_from_base_64, Fingerprint},
    },
    anyhow::{Context, Result},
    std::{convert::identity, io::Write, path::PathBuf},
    tap::prelude::*,
    tracing::instrument,
};

#[derive(Clone, Debug)]
pub struct InlineFileHandler {
    pub bundle: BundleHandle,
    pub output_directory: PathBuf,
}

impl InlineFileHandler {
    #[instrument(skip(self), level = "INFO")]
    pub async fn handle(
        &self,
        InlineFileDirective {
            hash,
            size,
            source_data_id,
            to,
        }: InlineFileDirective,
    ) -> Result<u64> {
        let output_path = self.output_directory.join(to.into_path());
        let bundle = self.bundle.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let blob = bundle
                .read_blob_blocking(&source_data_id)
                .context("reading inline blob")?;
            let expected_hash = to_u64_from_base_64(&hash).map(Fingerprint)?;
            let mut reader: Box<dyn std::io::Read> = match is_hash_check_exempt(&output_path) {
                true => tracing::Span::current()
                    .wrap_read(size, std::io::Cursor::new(&blob))
                    .and_validate_size(size)
                    .pipe(Box::new),
                false => tracing::Span::current()
                    .wrap_read(size, std::io::Cursor::new(&blob))
                    .and_validate_size(size)
                    .and_validate_hash(expected_hash)
                    .pipe(Box::new),
            };
            write_atomically(&output_path, |output_file| {
                let mut writer = std::io::BufWriter::new(output_file);
                std::io::copy(&mut reader, &mut writer)
                    .context("writing inline file")
                    .and_then(|_| writer.flush().context("flushing"))
                    .map(|_| ())
            })
        })
        .await
        .context("thread crashed")
        .and_then(identity)
        .map(|_| size)
    }
}
