use {
    anyhow::{Context, Result},
    futures::FutureExt,
    itertools::Itertools,
    serde::{Deserialize, Serialize},
    std::{convert::identity, future::Future, path::PathBuf},
    tap::prelude::*,
    tempfile::{NamedTempFile, TempPath},
    tracing::debug_span,
};

/// a 64 bit content fingerprint - the unit of file identity across the whole
/// engine. two files with an equal fingerprint are interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::From, derive_more::Into)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
    pub fn to_base_64(self) -> String {
        to_base_64_from_u64(self.0)
    }
    pub fn from_base_64(input: &str) -> Result<Self> {
        to_u64_from_base_64(input).map(Self)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_base_64().fmt(f)
    }
}

fn to_base_64(input: &[u8]) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(input)
}

fn from_base_64(input: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    use base64::prelude::*;
    BASE64_STANDARD
        .decode(input)
        .context("decoding input as base64")
}

pub fn to_base_64_from_u64(input: u64) -> String {
    u64::to_ne_bytes(input).pipe(|bytes| to_base_64(&bytes))
}

pub fn to_u64_from_base_64(input: &str) -> Result<u64> {
    from_base_64(input)
        .and_then(|input| {
            input
                .as_slice()
                .try_conv::<[u8; 8]>()
                .context("invalid size")
        })
        .map(u64::from_ne_bytes)
        .with_context(|| format!("decoding [{input}] as a fingerprint"))
}

/// a path as found in modlist json - possibly windows flavoured. the only place
/// where `\` is treated as a separator; everywhere downstream it is data.
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Hash, derive_more::Display, Clone, Ord)]
pub struct MaybeWindowsPath(pub String);

impl std::fmt::Debug for MaybeWindowsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl MaybeWindowsPath {
    pub fn into_path(self) -> PathBuf {
        let s = self.0;
        let s = match s.contains("\\\\") {
            true => s.split("\\\\").join("/"),
            false => s,
        };
        let s = match s.contains("\\") {
            true => s.split("\\").join("/"),
            false => s,
        };
        PathBuf::from(s)
    }
    pub fn into_relative_path(self) -> crate::paths::RelativePath {
        crate::paths::RelativePath::new(self.into_path().to_string_lossy())
    }
}

#[macro_export]
macro_rules! cloned {
    ($($es:ident),+) => {$(
        #[allow(unused_mut)]
        let mut $es = $es.clone();
    )*}
}

#[extension_traits::extension(pub(crate) trait PathReadWrite)]
impl<T: AsRef<std::path::Path>> T {
    fn open_file_read(&self) -> anyhow::Result<(PathBuf, std::fs::File)> {
        debug_span!("open_file_read", path=%self.as_ref().display()).in_scope(|| {
            std::fs::OpenOptions::new()
                .read(true)
                .open(self)
                .with_context(|| format!("opening file for reading at [{}]", self.as_ref().display()))
                .map(|file| (self.as_ref().to_owned(), file))
        })
    }
    fn open_file_write(&self) -> anyhow::Result<(PathBuf, std::fs::File)> {
        debug_span!("open_file_write", path=%self.as_ref().display()).in_scope(|| {
            Ok(()).and_then(|_| {
                if let Some(parent) = self.as_ref().parent() {
                    std::fs::create_dir_all(parent).context("creating full path for output file")?;
                }
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(self)
                    .with_context(|| format!("opening file for writing at [{}]", self.as_ref().display()))
                    .map(|file| (self.as_ref().to_owned(), file))
            })
        })
    }
}

pub(crate) fn spawn_rayon<T, F>(task_fn: F) -> impl Future<Output = anyhow::Result<T>>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + Sync + 'static,
{
    let span = tracing::info_span!("performing_work_on_threadpool");
    let (tx, rx) = tokio::sync::oneshot::channel();
    rayon::spawn_fifo(move || {
        span.in_scope(|| {
            if tx.send(task_fn()).is_err() {
                tracing::error!("could not communicate from thread")
            }
        })
    });
    rx.map(|res| res.context("task crashed?").and_then(identity))
}

pub fn scoped_temp_file() -> anyhow::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix("scratch-")
        .tempfile_in(*crate::consts::TEMP_FILE_DIR)
        .context("creating temp file")
}

pub fn scoped_temp_path() -> anyhow::Result<TempPath> {
    self::scoped_temp_file()
        .map(|p| p.into_temp_path())
        .context("creating temp path")
}

pub fn scoped_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("staging-")
        .tempdir_in(*crate::consts::TEMP_FILE_DIR)
        .context("creating temp directory")
}

pub fn deserialize_json_with_error_location<T: serde::de::DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    serde_json::from_str(text)
        .pipe(|res| {
            if let Some((line, column)) = res.as_ref().err().map(|err| (err.line(), err.column())) {
                res.with_context(|| format!("error occurred at [{line}:{column}]"))
                    .with_context(|| {
                        text.lines()
                            .enumerate()
                            .skip(line.saturating_sub(10))
                            .take(20)
                            .map(|(idx, line)| format!("{idx}.\t{line}"))
                            .join("\n")
                    })
            } else {
                res.context("oops")
            }
        })
        .context("parsing text")
        .with_context(|| format!("could not parse as {}", std::any::type_name::<T>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_base_64_round_trip() {
        let fingerprint = Fingerprint(0x0123_4567_89ab_cdef);
        assert_eq!(Fingerprint::from_base_64(&fingerprint.to_base_64()).unwrap(), fingerprint);
    }

    #[test]
    fn test_windows_path_flattening() {
        assert_eq!(
            MaybeWindowsPath(r"textures\armor\steel.dds".into()).into_path(),
            PathBuf::from("textures/armor/steel.dds")
        );
        assert_eq!(
            MaybeWindowsPath(r"a\\b\c".into()).into_path(),
            PathBuf::from("a/b/c")
        );
    }
}
