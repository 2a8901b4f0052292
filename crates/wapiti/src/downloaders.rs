//! the download dispatcher: parses source descriptors, performs resumable
//! fetches with retry, and renders `.meta` sidecars. each source kind has its
//! own module; the dispatch table lives on [`Downloaders::download`].

use {
    crate::{
        config_file::DownloadersConfig,
        error::InstallAbort,
        modlist_json::{Archive, ArchiveDescriptor, HumanUrl, State},
        resources::Resources,
    },
    anyhow::{bail, Context, Result},
    std::{path::Path, sync::Arc, time::Duration},
    tap::prelude::*,
    tokio_util::sync::CancellationToken,
    tracing::{info, instrument},
};

pub mod cdn;
pub mod chunked_stream;
pub mod gamefile_source;
pub mod helpers;
pub mod http;
pub mod meta_ini;
pub mod nexus;
pub mod verification_cache;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WithArchiveDescriptor<T> {
    pub inner: T,
    pub descriptor: ArchiveDescriptor,
}

impl<T> WithArchiveDescriptor<T> {
    pub fn map_inner<U>(self, map: impl FnOnce(T) -> U) -> WithArchiveDescriptor<U> {
        WithArchiveDescriptor {
            inner: map(self.inner),
            descriptor: self.descriptor,
        }
    }
}

/// what the download phase decided about one archive
#[derive(Debug)]
pub enum DownloadOutcome {
    /// bytes are on disk at the expected location
    Fetched,
    /// the source cannot be fetched automatically - surfaced after the phase,
    /// does not block other downloads
    ManualInterventionRequired,
}

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
pub struct Downloaders {
    pub client: reqwest::Client,
    pub config: DownloadersConfig,
    pub resources: Arc<Resources>,
    pub cancellation: CancellationToken,
    /// sources that delivered a good file recently are remembered here so
    /// repeated installs skip their network probes
    pub verification: Option<verification_cache::VerificationCache>,
}

impl std::fmt::Debug for Downloaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloaders").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Downloaders {
    pub fn new(config: DownloadersConfig, resources: Arc<Resources>, cancellation: CancellationToken) -> Result<Self> {
        reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")
            .map(|client| Self {
                client,
                config,
                resources,
                cancellation,
                verification: None,
            })
    }

    pub fn with_verification_cache(mut self, verification: verification_cache::VerificationCache) -> Self {
        self.verification = Some(verification);
        self
    }

    /// a seekable read view over a remote archive without downloading it fully
    /// - used for peeking into modlist bundles
    pub fn chunked_seekable_stream(&self, archive: &Archive) -> Result<self::chunked_stream::ChunkedRemoteStream> {
        match &archive.state {
            State::Http(state) => self::chunked_stream::ChunkedRemoteStream::open(state.url.as_ref().as_str()),
            State::WabbajackCDN(state) => self::chunked_stream::ChunkedRemoteStream::open(state.url.as_ref().as_str()),
            other => bail!(
                "source [{}] does not support seekable remote access",
                other.primary_key_string()
            ),
        }
        .with_context(|| format!("opening chunked stream over [{}]", archive.descriptor.name))
    }

    /// recognises a source-state variant from a bare uri - the inverse of the
    /// `primary_key_string` naming, used when sources arrive outside a modlist
    pub fn parse(&self, uri: &str) -> Result<State> {
        let url = uri.parse::<HumanUrl>().with_context(|| format!("[{uri}] is not a url"))?;
        let host = url
            .as_ref()
            .host_str()
            .map(|host| host.to_lowercase())
            .unwrap_or_default();
        Ok(match host.as_str() {
            host if host.ends_with("wabbajack.org") || host.ends_with("wabbajackpush.b-cdn.net") => {
                State::WabbajackCDN(crate::modlist_json::WabbajackCDNDownloaderState { url })
            }
            host if host.ends_with("mega.nz") => State::Mega(crate::modlist_json::MegaState { url }),
            host if host.ends_with("mediafire.com") => State::MediaFire(crate::modlist_json::MediaFireState { url }),
            host if host.ends_with("drive.google.com") => State::GoogleDrive(crate::modlist_json::GoogleDriveState {
                id: url
                    .as_ref()
                    .query_pairs()
                    .find(|(key, _)| key == "id")
                    .map(|(_, value)| value.to_string())
                    .context("google drive url carries no id")?,
            }),
            _ => State::Http(crate::modlist_json::HttpState { headers: vec![], url }),
        })
    }

    /// downloads `archive` to `target`. resumable, retried, verified by the
    /// caller through the hash cache afterwards.
    #[instrument(skip(self), fields(name = %archive.descriptor.name), level = "INFO")]
    pub async fn download(&self, archive: &Archive, target: &Path) -> Result<DownloadOutcome> {
        let descriptor = &archive.descriptor;
        let source_key = archive.state.primary_key_string();
        if let Some(verification) = &self.verification {
            if verification.is_fresh(&source_key).unwrap_or(false) {
                tracing::debug!(%source_key, "source verified recently");
            }
        }
        let outcome = match &archive.state {
            State::Manual(state) => {
                info!(prompt = %state.prompt, url = %state.url, "archive requires manual delivery");
                Ok(DownloadOutcome::ManualInterventionRequired)
            }
            State::Http(state) => self::http::download_resumable(self, &state.url, target, Some(descriptor.size))
                .await
                .map(|_| DownloadOutcome::Fetched),
            State::WabbajackCDN(state) => self::cdn::download_chunked(self, state, target, descriptor)
                .await
                .map(|_| DownloadOutcome::Fetched),
            State::GameFileSource(state) => self::gamefile_source::copy_from_game_folder(self, state, target)
                .await
                .map(|_| DownloadOutcome::Fetched),
            State::GoogleDrive(state) => {
                let url = format!("https://drive.google.com/uc?export=download&id={}", state.id)
                    .parse::<HumanUrl>()
                    .context("building google drive url")?;
                self::http::download_resumable(self, &url, target, Some(descriptor.size))
                    .await
                    .map(|_| DownloadOutcome::Fetched)
            }
            State::Nexus(state) => self::nexus::download(self, state, target, descriptor)
                .await
                .map(|_| DownloadOutcome::Fetched),
            state @ (State::Mega(_) | State::MediaFire(_)) => {
                bail!(
                    "source [{}] has no automatic downloader - deliver the file into the downloads directory by hand",
                    state.primary_key_string()
                )
            }
        }
        .with_context(|| format!("downloading [{}] from [{source_key}]", descriptor.name));
        if let (Ok(DownloadOutcome::Fetched), Some(verification)) = (&outcome, &self.verification) {
            verification
                .record(&source_key)
                .tap_err(|error| tracing::warn!("could not record verification: {error:#}"))
                .ok();
        }
        outcome
    }

    /// missing archives terminate the install after the retry phase - this is
    /// the error that carries the per-source identity upward
    pub fn missing_archive_error(archives: Vec<Archive>) -> anyhow::Error {
        let keys = archives
            .iter()
            .map(|archive| archive.state.primary_key_string())
            .collect::<Vec<_>>();
        anyhow::Error::new(InstallAbort::DownloadFailed { manual_downloads: archives }).context(format!("missing archives: {keys:#?}"))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::resources::ResourcesSettings, pretty_assertions::assert_eq};

    fn downloaders() -> Downloaders {
        let cancellation = CancellationToken::new();
        Downloaders::new(
            DownloadersConfig::default(),
            Arc::new(Resources::new(ResourcesSettings::default(), &cancellation)),
            cancellation,
        )
        .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_parse_recognises_source_kinds() {
        let downloaders = downloaders();
        assert_eq!(
            downloaders
                .parse("https://authored-files.wabbajack.org/some-list")
                .unwrap()
                .kind()
                .to_string(),
            "WabbajackCDN"
        );
        assert_eq!(
            downloaders.parse("https://mega.nz/file/abcdef").unwrap().kind().to_string(),
            "Mega"
        );
        assert_eq!(
            downloaders
                .parse("https://drive.google.com/uc?export=download&id=FILE123")
                .unwrap()
                .kind()
                .to_string(),
            "GoogleDrive"
        );
        assert_eq!(
            downloaders.parse("https://example.com/file.7z").unwrap().kind().to_string(),
            "Http"
        );
    }
}
