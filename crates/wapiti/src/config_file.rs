use {
    crate::{modlist_json::GameName, resources::ResourcesSettings},
    anyhow::{Context, Result},
    indexmap::IndexMap,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
    tap::prelude::*,
    tracing::{debug, info, warn},
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct NexusConfig {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, derivative::Derivative)]
#[serde(deny_unknown_fields)]
pub struct GameConfig {
    pub root_directory: PathBuf,
}

pub type GamesConfig = IndexMap<GameName, GameConfig>;

#[derive(Debug, Clone, Serialize, Deserialize, derivative::Derivative)]
#[derivative(Default)]
#[serde(deny_unknown_fields)]
pub struct DownloadersConfig {
    #[derivative(Default(value = "PathBuf::from(\"downloads\")"))]
    pub downloads_directory: PathBuf,
    #[serde(default)]
    pub nexus: NexusConfig,
    /// game roots by game type - used both to satisfy game-file sources and to
    /// resolve the installation's game directory
    #[serde(default)]
    pub games: GamesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, derivative::Derivative)]
#[derivative(Default)]
#[serde(deny_unknown_fields)]
pub struct InstallationConfig {
    #[derivative(Default(value = "PathBuf::from(\"path/to/bundle.modlist\")"))]
    pub modlist_file_path: PathBuf,
    #[derivative(Default(value = "PathBuf::from(\"installed\")"))]
    pub installation_path: PathBuf,
}

/// screen geometry written into the game's configuration inis at the end of
/// the install
#[derive(Debug, Clone, Copy, PartialEq, Eq, derivative::Derivative)]
#[derivative(Default)]
pub struct Resolution {
    #[derivative(Default(value = "1920"))]
    pub x: u32,
    #[derivative(Default(value = "1080"))]
    pub y: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

impl std::str::FromStr for Resolution {
    type Err = anyhow::Error;
    fn from_str(value: &str) -> Result<Self> {
        value
            .split_once('x')
            .with_context(|| format!("expected WIDTHxHEIGHT, got [{value}]"))
            .and_then(|(x, y)| {
                Ok(Self {
                    x: x.trim().parse().context("bad width")?,
                    y: y.trim().parse().context("bad height")?,
                })
            })
    }
}

impl Serialize for Resolution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).and_then(|value| value.parse().map_err(serde::de::Error::custom))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, derivative::Derivative)]
#[derivative(Default)]
#[serde(deny_unknown_fields)]
pub struct FixupConfig {
    #[serde(default)]
    pub game_resolution: Resolution,
    /// approximate video memory of the machine, forwarded into performance
    /// tweaks of known configuration inis
    #[serde(default)]
    pub video_memory_size_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, derivative::Derivative)]
#[derivative(Default)]
#[serde(deny_unknown_fields)]
pub struct WapitiConfig {
    pub downloaders: DownloadersConfig,
    pub installation: InstallationConfig,
    #[serde(default)]
    pub fixup: FixupConfig,
    #[serde(default)]
    pub resources: ResourcesSettings,
    /// root for the persistent caches; defaults next to the config file
    #[serde(default)]
    pub data_directory: Option<PathBuf>,
}

pub static CONFIG_FILE_NAME: &str = "wapiti.yaml";

impl WapitiConfig {
    pub fn write_default() -> Result<String> {
        Self::default()
            .pipe_ref(serde_yaml::to_string)
            .context("serialization failed")
            .map(|config| {
                format!(
                    "\n# default {CONFIG_FILE_NAME} file, generated with {} {}\n# edit it according to your needs:\n{config}",
                    clap::crate_name!(),
                    clap::crate_version!(),
                )
            })
    }
    pub fn read(path: &Path) -> Result<(PathBuf, Self)> {
        path.exists()
            .then(|| path.to_owned())
            .with_context(|| format!("config path [{}] does not exist", path.display()))
            .tap_ok(|config| info!("found config at '{}'", config.display()))
            .and_then(|config_path| {
                std::fs::read_to_string(&config_path)
                    .context("reading file")
                    .and_then(|config| serde_yaml::from_str::<Self>(&config).context("parsing config file"))
                    .map(|config| (config_path, config))
            })
            .with_context(|| format!("getting [{CONFIG_FILE_NAME}]"))
            .tap_err(|e| warn!("{e:?}"))
            .tap_ok(|config| {
                debug!("{config:?}");
            })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_default_config_round_trips() {
        let serialized = serde_yaml::to_string(&WapitiConfig::default()).unwrap();
        let parsed = serde_yaml::from_str::<WapitiConfig>(&serialized).unwrap();
        assert_eq!(parsed.installation.installation_path, PathBuf::from("installed"));
        assert_eq!(parsed.fixup.game_resolution, Resolution { x: 1920, y: 1080 });
    }

    #[test]
    fn test_resolution_parses() {
        assert_eq!("2560x1440".parse::<Resolution>().unwrap(), Resolution { x: 2560, y: 1440 });
        assert!("not-a-resolution".parse::<Resolution>().is_err());
    }
}
