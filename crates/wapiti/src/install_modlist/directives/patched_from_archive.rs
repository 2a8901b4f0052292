use {
    super::{preheat::PreheatedSources, write_atomically, PatchCache},
    crate::{
        modlist_json::directive::PatchedFromArchiveDirective,
        octodiff::ApplyDelta,
        progress_bars::IndicatifWrapIoExt,
        read_wrappers::ReadExt,
        utils::{to_u64_from_base_64, Fingerprint, PathReadWrite},
    },
    anyhow::{Context, Result},
    std::{
        io::{Read, Seek, Write},
        path::PathBuf,
        sync::Arc,
    },
};

#[derive(Clone, Debug)]
pub struct PatchedFromArchiveHandler {
    pub output_directory: PathBuf,
    pub patch_cache: Arc<PatchCache>,
}

fn perform_patch<S, D, T>(source: S, delta: D, target: T, expected_size: u64, expected_hash: Fingerprint) -> Result<()>
where
    S: Read + Seek,
    D: Read,
    T: Write,
{
    // the delta applies on the fly - no intermediate file
    let patched = ApplyDelta::new_from_readers(source, delta).context("invalid delta")?;
    let mut writer = std::io::BufWriter::new(target);
    std::io::copy(
        &mut tracing::Span::current()
            .wrap_read(expected_size, patched)
            .and_validate_size(expected_size)
            .and_validate_hash(expected_hash),
        &mut writer,
    )
    .context("copying patched output")
    .and_then(|_| writer.flush().context("flushing"))
    .map(|_| ())
}

impl PatchedFromArchiveHandler {
    #[tracing::instrument(skip(self, preheated), level = "INFO")]
    pub fn handle(
        &self,
        PatchedFromArchiveDirective {
            hash,
            size,
            to,
            archive_hash_path,
            from_hash: _,
            patch_id,
        }: PatchedFromArchiveDirective,
        preheated: Arc<PreheatedSources>,
    ) -> Result<u64> {
        let source_file = preheated
            .get(&archive_hash_path)
            .with_context(|| format!("resolving hash path [{archive_hash_path:?}]"))?;
        let output_path = self.output_directory.join(to.into_path());

        let delta = self
            .patch_cache
            .open_patch(&patch_id)
            .with_context(|| format!("patch [{patch_id}] is not available"))?;

        let expected_hash = to_u64_from_base_64(&hash).map(Fingerprint)?;
        source_file
            .open_file_read()
            .and_then(|(source_path, source)| {
                write_atomically(&output_path, |output_file| perform_patch(source, delta, output_file, size, expected_hash))
                    .with_context(|| format!("when patching [{source_path:?}] into [{}]", output_path.display()))
                    .with_context(|| format!("when handling [{archive_hash_path:?}]"))
            })
            .map(|_| size)
    }
}
