//! assembly of game-native container archives out of the staging directory the
//! earlier phases populated, followed by a per-entry readback check: every
//! packed entry must hash-match the staged file that fed it, lossy dx10
//! entries excepted.

use {
    super::{write_atomically, BSA_CREATION_DIR},
    crate::{
        compression::{bsa::BsaArchive, ProcessArchive},
        modlist_json::directive::create_bsa_directive::{Ba2State, BsaState, ContainerState, CreateBSADirective, FileState},
        paths::RelativePath,
        utils::Fingerprint,
    },
    anyhow::{bail, Context, Result},
    ba2::prelude::*,
    itertools::Itertools,
    std::{io::Read, path::PathBuf},
    tap::prelude::*,
    tracing::{info, instrument},
};

#[derive(Clone, Debug)]
pub struct CreateBsaHandler {
    pub output_directory: PathBuf,
}

fn tes4_version(BsaState { version, .. }: &BsaState) -> Result<ba2::tes4::Version> {
    match version {
        103 => Ok(ba2::tes4::Version::TES4),
        104 => Ok(ba2::tes4::Version::FO3),
        105 => Ok(ba2::tes4::Version::SSE),
        other => bail!("unsupported bsa version [{other}]"),
    }
}

fn fo4_version(Ba2State { version, .. }: &Ba2State) -> Result<ba2::fo4::Version> {
    match version {
        1 => Ok(ba2::fo4::Version::v1),
        2 => Ok(ba2::fo4::Version::v2),
        3 => Ok(ba2::fo4::Version::v3),
        7 => Ok(ba2::fo4::Version::v7),
        8 => Ok(ba2::fo4::Version::v8),
        other => bail!("unsupported ba2 version [{other}]"),
    }
}

impl CreateBsaHandler {
    fn staged_path(&self, temp_id: &str, file_state: &FileState) -> PathBuf {
        self.output_directory
            .join(BSA_CREATION_DIR)
            .join(temp_id)
            .join(file_state.path().clone().into_path())
    }

    /// entries enter in `file_states` order (their declared indices), the
    /// packed output lands at `to` in a single seekable write
    #[instrument(skip(self, directive), fields(to = %directive.to), level = "INFO")]
    pub fn handle(&self, directive: CreateBSADirective) -> Result<u64> {
        let CreateBSADirective {
            hash: _,
            size,
            to,
            temp_id,
            state,
            file_states,
        } = directive;
        let file_states = file_states
            .into_iter()
            .sorted_by_key(|file_state| file_state.index())
            .collect_vec();
        let output_path = self.output_directory.join(to.clone().into_path());
        info!(entries = file_states.len(), "packing container");

        match &state {
            ContainerState::Bsa(bsa_state) => self.pack_tes4(bsa_state, &temp_id, &file_states, &output_path),
            ContainerState::Ba2(ba2_state) => self.pack_fo4(ba2_state, &temp_id, &file_states, &output_path),
        }
        .with_context(|| format!("building container [{}]", output_path.display()))?;

        self.verify_readback(&temp_id, &file_states, &output_path)
            .with_context(|| format!("verifying container [{}]", output_path.display()))?;
        Ok(size)
    }

    fn pack_tes4(&self, bsa_state: &BsaState, temp_id: &str, file_states: &[FileState], output_path: &PathBuf) -> Result<()> {
        let version = tes4_version(bsa_state)?;
        let flags = ba2::tes4::ArchiveFlags::from_bits_truncate(bsa_state.archive_flags);
        let types = ba2::tes4::ArchiveTypes::from_bits_truncate(bsa_state.file_flags as u16);
        let mut archive = ba2::tes4::Archive::new();
        for file_state in file_states {
            let staged = self.staged_path(temp_id, file_state);
            let entry_path = file_state.path().clone().into_path();
            let (directory_name, file_name) = entry_path
                .parent()
                .map(|parent| parent.to_string_lossy().replace('/', "\\"))
                .filter(|parent| !parent.is_empty())
                .unwrap_or_else(|| ".".to_string())
                .pipe(|directory| {
                    (
                        directory,
                        entry_path
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string())
                            .unwrap_or_default(),
                    )
                });
            let file = ba2::tes4::File::read(
                staged.as_path(),
                &ba2::tes4::FileReadOptions::builder().version(version).build(),
            )
            .with_context(|| format!("reading staged [{}]", staged.display()))?;
            let directory_key: ba2::tes4::ArchiveKey = directory_name.as_bytes().into();
            match archive.get_mut(&directory_key) {
                Some(directory) => {
                    directory.insert(file_name.as_bytes(), file);
                }
                None => {
                    ba2::tes4::Directory::new()
                        .tap_mut(|directory| {
                            directory.insert(file_name.as_bytes(), file);
                        })
                        .pipe(|directory| archive.insert(directory_key, directory));
                }
            }
        }
        write_atomically(output_path, |output| {
            archive
                .write(
                    output,
                    &ba2::tes4::ArchiveOptions::builder()
                        .version(version)
                        .flags(flags)
                        .types(types)
                        .build(),
                )
                .context("writing container")
        })
    }

    fn pack_fo4(&self, ba2_state: &Ba2State, temp_id: &str, file_states: &[FileState], output_path: &PathBuf) -> Result<()> {
        let version = fo4_version(ba2_state)?;
        let mut archive = ba2::fo4::Archive::new();
        for file_state in file_states {
            let staged = self.staged_path(temp_id, file_state);
            let format = match file_state {
                FileState::Ba2Dx10Entry(_) => ba2::fo4::Format::DX10,
                _ => ba2::fo4::Format::GNRL,
            };
            let file = ba2::fo4::File::read(
                staged.as_path(),
                &ba2::fo4::FileReadOptions::builder().format(format).build(),
            )
            .with_context(|| format!("reading staged [{}]", staged.display()))?;
            let name = file_state.path().clone().into_path().to_string_lossy().replace('/', "\\");
            archive.insert(name.as_bytes(), file);
        }
        write_atomically(output_path, |output| {
            archive
                .write(output, &ba2::fo4::ArchiveOptions::builder().version(version).build())
                .context("writing container")
        })
    }

    /// reader symmetry: reopen what was just written and compare entry hashes
    /// with the staged inputs
    fn verify_readback(&self, temp_id: &str, file_states: &[FileState], output_path: &PathBuf) -> Result<()> {
        let mut readback = BsaArchive::new(output_path).context("reopening freshly written container")?;
        let by_normalized = file_states
            .iter()
            .map(|file_state| (file_state.path().clone().into_relative_path().normalized(), file_state))
            .collect::<std::collections::BTreeMap<_, _>>();
        let handles = readback.get_many_handles(
            &by_normalized
                .keys()
                .map(|key| RelativePath::new(key.clone()))
                .collect_vec(),
        )?;
        for (path, handle) in handles {
            let file_state = by_normalized
                .get(&path.normalized())
                .with_context(|| format!("container delivered unexpected entry [{path:?}]"))?;
            if file_state.is_lossy() {
                continue;
            }
            let staged = self.staged_path(temp_id, file_state);
            let staged_hash = crate::hash_cache::hash_file_streaming(&staged)?;
            let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
            let mut buffer = vec![0u8; crate::BUFFER_SIZE];
            let mut stream = handle.get_stream()?;
            loop {
                match stream.read(&mut buffer).context("hashing readback entry")? {
                    0 => break,
                    read => hasher.update(&buffer[..read]),
                }
            }
            let packed_hash = Fingerprint(hasher.digest());
            if packed_hash != staged_hash {
                bail!("entry [{path:?}] does not survive packing: staged [{staged_hash}], packed [{packed_hash}]");
            }
        }
        info!("container verified");
        Ok(())
    }
}
