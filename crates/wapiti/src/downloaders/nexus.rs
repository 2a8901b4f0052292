//! the named third-party repository source. the catalogue/auth machinery is an
//! external collaborator - all this module needs from it is an api key in the
//! downloaders config; without one the source is reported as missing.

use {
    super::Downloaders,
    crate::modlist_json::{ArchiveDescriptor, NexusState},
    anyhow::{Context, Result},
    serde::Deserialize,
    std::path::Path,
    tracing::instrument,
};

#[derive(Debug, Deserialize)]
struct DownloadLink {
    #[serde(rename = "URI")]
    uri: String,
}

async fn resolve_download_link(downloaders: &Downloaders, state: &NexusState, api_key: &str) -> Result<Vec<DownloadLink>> {
    let endpoint = format!(
        "https://api.nexusmods.com/v1/games/{game}/mods/{mod_id}/files/{file_id}/download_link.json",
        game = state.game_name.to_string().to_lowercase(),
        mod_id = state.mod_id,
        file_id = state.file_id,
    );
    let response = downloaders
        .client
        .get(&endpoint)
        .header("apikey", api_key)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("requesting [{endpoint}]"))?;
    response.json::<Vec<DownloadLink>>().await.context("parsing download links")
}

#[instrument(skip(downloaders, descriptor), fields(name = %state.name), level = "INFO")]
pub async fn download(downloaders: &Downloaders, state: &NexusState, target: &Path, descriptor: &ArchiveDescriptor) -> Result<()> {
    let api_key = downloaders
        .config
        .nexus
        .api_key
        .clone()
        .context("no nexus api key configured - the file must be delivered by hand")?;
    let job = downloaders
        .resources
        .web_requests
        .begin(format!("resolving download link for {}", state.name), 0)
        .await?;
    let links = resolve_download_link(downloaders, state, &api_key).await;
    downloaders.resources.web_requests.finish(job);
    let link = links?
        .first()
        .context("repository returned no download links")?
        .uri
        .parse()
        .context("repository returned an invalid link")?;
    super::http::download_resumable(downloaders, &link, target, Some(descriptor.size))
        .await
        .map(|_| ())
}
