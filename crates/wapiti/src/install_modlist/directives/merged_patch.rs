use {
    super::{write_atomically, PatchCache},
    crate::{
        modlist_json::directive::{MergedPatchDirective, MergedPatchSource},
        octodiff::ApplyDelta,
        progress_bars::IndicatifWrapIoExt,
        read_wrappers::ReadExt,
        utils::{to_u64_from_base_64, Fingerprint, PathReadWrite},
    },
    anyhow::{Context, Result},
    std::{
        io::{Seek, Write},
        path::PathBuf,
        sync::Arc,
    },
    tracing::instrument,
};

#[derive(Clone, Debug)]
pub struct MergedPatchHandler {
    pub output_directory: PathBuf,
    pub patch_cache: Arc<PatchCache>,
}

impl MergedPatchHandler {
    /// sources were installed by earlier directives; they concatenate in
    /// declared order into one seekable scratch file the delta then reads from
    #[instrument(skip(self), level = "INFO")]
    pub fn handle(
        &self,
        MergedPatchDirective {
            hash,
            size,
            to,
            patch_id,
            sources,
        }: MergedPatchDirective,
    ) -> Result<u64> {
        let output_path = self.output_directory.join(to.into_path());

        let mut concatenated = crate::utils::scoped_temp_file()?;
        for MergedPatchSource { hash: _, relative_path } in sources {
            let source_path = self.output_directory.join(relative_path.clone().into_path());
            source_path
                .open_file_read()
                .and_then(|(path, mut source)| {
                    std::io::copy(&mut source, &mut concatenated)
                        .with_context(|| format!("concatenating [{}]", path.display()))
                })
                .with_context(|| format!("merged patch source [{relative_path:?}] must already be installed"))?;
        }
        concatenated.rewind().context("rewinding concatenation")?;

        let delta = self
            .patch_cache
            .open_patch(&patch_id)
            .with_context(|| format!("patch [{patch_id}] is not available"))?;

        let patched = ApplyDelta::new_from_readers(concatenated, delta).context("invalid delta")?;
        let expected_hash = to_u64_from_base_64(&hash).map(Fingerprint)?;
        write_atomically(&output_path, |output_file| {
            let mut writer = std::io::BufWriter::new(output_file);
            std::io::copy(
                &mut tracing::Span::current()
                    .wrap_read(size, patched)
                    .and_validate_size(size)
                    .and_validate_hash(expected_hash),
                &mut writer,
            )
            .context("writing merged patch output")
            .and_then(|_| writer.flush().context("flushing"))
            .map(|_| ())
        })
        .with_context(|| format!("generating merged patch at [{}]", output_path.display()))
        .map(|_| size)
    }
}
