use {
    crate::utils::{to_base_64_from_u64, MaybeWindowsPath},
    serde::{Deserialize, Serialize},
    std::hash::Hasher,
    tap::prelude::*,
};

#[macro_export]
macro_rules! test_example {
    ($input:expr, $name:ident, $ty:ty) => {
        #[test]
        fn $name() -> anyhow::Result<()> {
            use anyhow::Context;
            serde_json::from_str::<$ty>($input)
                .with_context(|| format!("{}\ncould not be parsed as {}", $input, std::any::type_name::<$ty>()))
                .map(|_| ())
        }
    };
}

#[derive(
    derive_more::FromStr,
    derive_more::Display,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::AsRef,
    derive_more::From,
    derive_more::Into,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct HumanUrl(url::Url);

impl std::fmt::Debug for HumanUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Url({self})")
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Modlist {
    /// archives: every remote input referenced by at least one directive
    pub archives: Vec<Archive>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    /// directives: the full recipe - one instruction per installed file
    pub directives: Vec<Directive>,
    pub game_type: GameName,
    #[serde(default)]
    pub image: String,
    #[serde(rename = "IsNSFW")]
    #[serde(default)]
    pub is_nsfw: bool,
    pub name: String,
    #[serde(default)]
    pub readme: String,
    pub version: String,
    #[serde(default)]
    pub wabbajack_version: String,
    #[serde(default)]
    pub website: String,
}

#[derive(Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveDescriptor {
    /// base64 of the 64-bit content fingerprint - identity of the archive
    pub hash: String,
    #[serde(default)]
    pub meta: String,
    /// filename the archive is saved under in the downloads directory
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Archive {
    #[serde(flatten)]
    pub descriptor: ArchiveDescriptor,
    /// where and how to obtain the archive
    pub state: State,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Serialize, Deserialize, enum_kinds::EnumKind, Clone)]
#[serde(tag = "$type")]
#[serde(deny_unknown_fields)]
#[enum_kind(SourceKind, derive(Serialize, Deserialize, PartialOrd, Ord, derive_more::Display))]
pub enum State {
    #[serde(rename = "NexusDownloader, Wabbajack.Lib")]
    Nexus(NexusState),
    #[serde(rename = "GameFileSourceDownloader, Wabbajack.Lib")]
    GameFileSource(GameFileSourceState),
    #[serde(rename = "MegaDownloader, Wabbajack.Lib")]
    Mega(MegaState),
    #[serde(rename = "GoogleDriveDownloader, Wabbajack.Lib")]
    GoogleDrive(GoogleDriveState),
    #[serde(rename = "MediaFireDownloader+State, Wabbajack.Lib")]
    MediaFire(MediaFireState),
    #[serde(rename = "HttpDownloader, Wabbajack.Lib")]
    Http(HttpState),
    #[serde(rename = "ManualDownloader, Wabbajack.Lib")]
    Manual(ManualState),
    #[serde(rename = "WabbajackCDNDownloader+State, Wabbajack.Lib")]
    WabbajackCDN(WabbajackCDNDownloaderState),
}

impl State {
    pub fn kind(&self) -> SourceKind {
        SourceKind::from(self)
    }
    /// stable identity of the source - used for deduplication, the
    /// manual-download report and the `.meta` sidecar
    pub fn primary_key_string(&self) -> String {
        match self {
            State::Nexus(NexusState {
                game_name, mod_id, file_id, ..
            }) => format!("NexusDownloader+{game_name}|{mod_id}|{file_id}"),
            State::GameFileSource(GameFileSourceState { game, game_file, .. }) => format!("GameFileSourceDownloader+{game}+{game_file}"),
            State::Mega(MegaState { url }) => format!("MegaDownloader+{url}"),
            State::GoogleDrive(GoogleDriveState { id }) => format!("GoogleDriveDownloader+{id}"),
            State::MediaFire(MediaFireState { url }) => format!("MediaFireDownloader+{url}"),
            State::Http(HttpState { url, .. }) => format!("HttpDownloader+{url}"),
            State::Manual(ManualState { url, .. }) => format!("ManualDownloader+{url}"),
            State::WabbajackCDN(WabbajackCDNDownloaderState { url }) => format!("WabbajackCDNDownloader+{url}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct HttpState {
    #[serde(default)]
    pub headers: Vec<String>,
    pub url: HumanUrl,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct ManualState {
    #[serde(default)]
    pub prompt: String,
    pub url: HumanUrl,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct WabbajackCDNDownloaderState {
    pub url: HumanUrl,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct GoogleDriveState {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct MediaFireState {
    pub url: HumanUrl,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct MegaState {
    pub url: HumanUrl,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct GameFileSourceState {
    #[serde(default)]
    pub game_version: String,
    pub hash: String,
    pub game_file: MaybeWindowsPath,
    pub game: GameName,
}

#[derive(Debug, Serialize, Deserialize, Clone, derive_more::Display, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Constructor)]
pub struct GameName(String);

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
#[serde(deny_unknown_fields)]
pub struct NexusState {
    pub game_name: GameName,
    #[serde(rename = "FileID")]
    pub file_id: usize,
    #[serde(rename = "ModID")]
    pub mod_id: usize,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "ImageURL")]
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(rename = "IsNSFW")]
    #[serde(default)]
    pub is_nsfw: bool,
    pub name: String,
    pub version: String,
}

pub mod directive;

#[derive(Debug, Serialize, Deserialize, enum_kinds::EnumKind, Clone)]
#[serde(tag = "$type")]
#[serde(deny_unknown_fields)]
#[enum_kind(DirectiveKind, derive(Serialize, Deserialize, PartialOrd, Ord, derive_more::Display, Hash, clap::ValueEnum))]
pub enum Directive {
    CreateBSA(directive::create_bsa_directive::CreateBSADirective),
    FromArchive(directive::FromArchiveDirective),
    InlineFile(directive::InlineFileDirective),
    MergedPatch(directive::MergedPatchDirective),
    PatchedFromArchive(directive::PatchedFromArchiveDirective),
    RemappedInlineFile(directive::RemappedInlineFileDirective),
}

impl Directive {
    pub fn size(&self) -> u64 {
        match self {
            Directive::CreateBSA(d) => d.size,
            Directive::FromArchive(d) => d.size,
            Directive::InlineFile(d) => d.size,
            Directive::MergedPatch(d) => d.size,
            Directive::PatchedFromArchive(d) => d.size,
            Directive::RemappedInlineFile(d) => d.size,
        }
    }
    pub fn to(&self) -> &MaybeWindowsPath {
        match self {
            Directive::CreateBSA(d) => &d.to,
            Directive::FromArchive(d) => &d.to,
            Directive::InlineFile(d) => &d.to,
            Directive::MergedPatch(d) => &d.to,
            Directive::PatchedFromArchive(d) => &d.to,
            Directive::RemappedInlineFile(d) => &d.to,
        }
    }
    pub fn hash(&self) -> &str {
        match self {
            Directive::CreateBSA(d) => &d.hash,
            Directive::FromArchive(d) => &d.hash,
            Directive::InlineFile(d) => &d.hash,
            Directive::MergedPatch(d) => &d.hash,
            Directive::PatchedFromArchive(d) => &d.hash,
            Directive::RemappedInlineFile(d) => &d.hash,
        }
    }
    /// identity of the directive itself (not of the produced file) - stable
    /// across runs, printed in failure reports so users can pin a directive in
    /// a support ticket
    pub fn directive_hash(&self) -> String {
        serde_json::to_string(self).unwrap().pipe(|out| {
            let mut hasher = xxhash_rust::xxh64::Xxh64::new(0);
            hasher.update(out.as_bytes());
            hasher.finish().pipe(to_base_64_from_u64)
        })
    }
    pub fn directive_kind(&self) -> DirectiveKind {
        DirectiveKind::from(self)
    }
}

pub mod parsing_helpers {
    use {
        anyhow::{Context, Result},
        itertools::Itertools,
        serde_json::Value,
        tap::prelude::*,
        tracing::info,
    };

    pub fn validate_modlist_file(input: &str) -> Result<()> {
        input
            .tap(|input| {
                info!("file is {} bytes long", input.len());
            })
            .pipe_as_ref(serde_json::from_str::<Value>)
            .context("bad json")
            .and_then(|node| serde_json::to_string_pretty(&node).context("serializing"))
            .and_then(move |pretty_input| {
                serde_json::from_str::<crate::modlist_json::Modlist>(&pretty_input)
                    .pipe(|res| match res.as_ref() {
                        Ok(_) => res.context(""),
                        Err(e) => e.line().pipe(|line| {
                            res.with_context(|| {
                                pretty_input
                                    .lines()
                                    .enumerate()
                                    .map(|(idx, line)| format!("{}. {line}", idx + 1))
                                    .skip(line.saturating_sub(20))
                                    .take(40)
                                    .join("\n")
                            })
                        }),
                    })
                    .context("bad modlist")
            })
            .map(|_| ())
    }
}

#[cfg(test)]
mod example_tests {
    use super::*;

    test_example!(
        r#"{
            "$type": "HttpDownloader, Wabbajack.Lib",
            "Headers": [],
            "Url": "https://example.com/archive.7z"
        }"#,
        test_http_state,
        State
    );

    test_example!(
        r#"{
            "$type": "ManualDownloader, Wabbajack.Lib",
            "Prompt": "grab it yourself",
            "Url": "https://example.com/paywalled.zip"
        }"#,
        test_manual_state,
        State
    );

    test_example!(
        r#"{
            "$type": "GameFileSourceDownloader, Wabbajack.Lib",
            "GameVersion": "1.6.640.0",
            "Hash": "z1AeaHAfqzo=",
            "GameFile": "Data\\Skyrim - Textures0.bsa",
            "Game": "SkyrimSpecialEdition"
        }"#,
        test_game_file_source_state,
        State
    );

    test_example!(
        r#"{
            "Hash": "kPSWBSuHRkM=",
            "Meta": "[General]\ninstalled=true",
            "Name": "some-mod-1.0.7z",
            "Size": 1048576,
            "$type": "HttpDownloader, Wabbajack.Lib",
            "Headers": [],
            "Url": "https://example.com/some-mod-1.0.7z"
        }"#,
        test_full_archive,
        Archive
    );

    #[test]
    fn test_primary_key_is_stable() {
        let state = serde_json::from_str::<State>(
            r#"{
                "$type": "HttpDownloader, Wabbajack.Lib",
                "Url": "https://example.com/a.7z"
            }"#,
        )
        .unwrap();
        assert_eq!(state.primary_key_string(), "HttpDownloader+https://example.com/a.7z");
    }
}
