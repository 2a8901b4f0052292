use {
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
    tap::prelude::*,
};

/// a path inside an archive or below a managed directory root. canonical
/// separator is `/`; a `\` occurring inside is part of a file name, not a
/// separator (some archives genuinely contain such entries - see the
/// post-extraction normalisation in the extraction dispatcher).
///
/// deliberately not interconvertible with [`AbsolutePath`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display)]
pub struct RelativePath(String);

impl std::fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl RelativePath {
    pub fn new(path: impl Into<String>) -> Self {
        path.into()
            .pipe(|path| path.trim_matches('/').to_string())
            .pipe(Self)
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn join(&self, child: &RelativePath) -> Self {
        match self.0.is_empty() {
            true => child.clone(),
            false => Self(format!("{}/{}", self.0, child.0)),
        }
    }
    pub fn extension(&self) -> Option<&str> {
        self.0
            .rsplit('/')
            .next()
            .and_then(|basename| basename.rsplit_once('.'))
            .map(|(_, extension)| extension)
            .filter(|extension| !extension.is_empty())
    }
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
    /// comparison key: separators unified, case folded. the engine compares
    /// archive entries this way because the game's own file system is
    /// case-insensitive.
    pub fn normalized(&self) -> String {
        self.0.replace('\\', "/").to_lowercase()
    }
    /// materialisation onto the host file system - this is the one place where
    /// the canonical `/` becomes the host separator
    pub fn to_os_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl From<&Path> for RelativePath {
    fn from(path: &Path) -> Self {
        path.iter()
            .map(|segment| segment.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
            .pipe(Self::new)
    }
}

/// a fully resolved location on the host file system. constructors reject
/// relative inputs; joining a [`RelativePath`] is the only sanctioned way to
/// derive new locations from it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AbsolutePath(PathBuf);

impl std::fmt::Debug for AbsolutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for AbsolutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.display().fmt(f)
    }
}

impl AbsolutePath {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        use anyhow::Context;
        path.is_absolute()
            .then_some(path)
            .map(Self)
            .context("path is not absolute")
    }
    /// for paths coming out of configuration - resolved against the current
    /// directory when relative
    pub fn resolve(path: PathBuf) -> anyhow::Result<Self> {
        use anyhow::Context;
        match path.is_absolute() {
            true => Ok(Self(path)),
            false => std::env::current_dir()
                .context("no current directory")
                .map(|cwd| Self(cwd.join(path))),
        }
    }
    pub fn join(&self, child: &RelativePath) -> Self {
        Self(self.0.join(child.to_os_path()))
    }
    pub fn as_path(&self) -> &Path {
        &self.0
    }
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for AbsolutePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_relative_path_keeps_backslash_as_data() {
        let path = RelativePath::new(r"some\file.txt");
        assert_eq!(path.as_str(), r"some\file.txt");
        assert_eq!(path.basename(), r"some\file.txt");
    }

    #[test]
    fn test_relative_path_join_and_extension() {
        let path = RelativePath::new("textures").join(&RelativePath::new("armor/steel.dds"));
        assert_eq!(path.as_str(), "textures/armor/steel.dds");
        assert_eq!(path.extension(), Some("dds"));
        assert_eq!(path.basename(), "steel.dds");
    }

    #[test]
    fn test_normalized_folds_case_and_separators() {
        assert_eq!(RelativePath::new(r"Textures\A.DDS").normalized(), "textures/a.dds");
    }

    #[test]
    fn test_absolute_path_rejects_relative() {
        assert!(AbsolutePath::new(PathBuf::from("not/absolute")).is_err());
    }
}
