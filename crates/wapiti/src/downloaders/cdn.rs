//! catalogued-cdn source: the url points at a gzipped definition json listing
//! fixed-offset parts; parts download concurrently and are stitched together
//! in declared order.

use {
    super::Downloaders,
    crate::{
        cloned,
        modlist_json::{ArchiveDescriptor, WabbajackCDNDownloaderState},
    },
    anyhow::{bail, Context, Result},
    futures::{StreamExt, TryStreamExt},
    serde::{Deserialize, Serialize},
    std::{io::Read, path::Path},
    tap::prelude::*,
    tracing::{info, instrument},
};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CdnPart {
    pub index: u64,
    pub offset: u64,
    pub size: u64,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct CdnDefinition {
    #[serde(default)]
    pub original_file_name: String,
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    pub parts: Vec<CdnPart>,
}

async fn fetch_definition(downloaders: &Downloaders, state: &WabbajackCDNDownloaderState) -> Result<CdnDefinition> {
    let url = format!("{}/definition.json.gz", state.url);
    let compressed = downloaders
        .client
        .get(&url)
        .send()
        .await
        .context("requesting definition")?
        .error_for_status()
        .context("definition request failed")?
        .bytes()
        .await
        .context("reading definition body")?;
    let mut decoded = String::new();
    flate2::read::GzDecoder::new(compressed.as_ref())
        .read_to_string(&mut decoded)
        .context("definition is not valid gzip")?;
    crate::utils::deserialize_json_with_error_location::<CdnDefinition>(&decoded).with_context(|| format!("parsing definition from [{url}]"))
}

#[instrument(skip(downloaders, descriptor), level = "INFO")]
pub async fn download_chunked(downloaders: &Downloaders, state: &WabbajackCDNDownloaderState, target: &Path, descriptor: &ArchiveDescriptor) -> Result<()> {
    let definition = fetch_definition(downloaders, state).await?;
    if definition.size != descriptor.size {
        bail!(
            "definition size [{}] does not match the modlist's [{}] for [{}]",
            definition.size,
            descriptor.size,
            descriptor.name
        );
    }
    let part_count = definition.parts.len();
    info!(part_count, "downloading in parts");

    let part_path = super::http::part_path(target);
    std::fs::File::create(&part_path)
        .with_context(|| format!("creating [{}]", part_path.display()))
        .and_then(|file| file.set_len(definition.size).context("preallocating"))?;

    definition
        .parts
        .pipe(futures::stream::iter)
        .map(|part| {
            cloned![downloaders];
            let base_url = state.url.clone();
            let part_path = part_path.clone();
            async move {
                let url = format!("{base_url}/parts/{}", part.index);
                let job = downloaders
                    .resources
                    .downloads
                    .begin(format!("part {}/{part_count}", part.index), part.size)
                    .await?;
                let body = downloaders
                    .client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .with_context(|| format!("requesting part [{url}]"))?
                    .bytes()
                    .await
                    .with_context(|| format!("reading part [{url}]"))?;
                downloaders.resources.downloads.report(&job, body.len() as u64).await?;
                downloaders.resources.downloads.finish(job);
                if body.len() as u64 != part.size {
                    bail!("part [{}] is [{}] bytes, definition says [{}]", part.index, body.len(), part.size);
                }
                crate::utils::spawn_rayon(move || {
                    use std::{io::{Seek, SeekFrom, Write}, fs::OpenOptions};
                    OpenOptions::new()
                        .write(true)
                        .open(&part_path)
                        .with_context(|| format!("opening [{}]", part_path.display()))
                        .and_then(|mut file| {
                            file.seek(SeekFrom::Start(part.offset))
                                .context("seeking to part offset")
                                .and_then(|_| file.write_all(&body).context("writing part"))
                        })
                })
                .await
            }
        })
        .buffer_unordered(4)
        .try_collect::<Vec<_>>()
        .await
        .context("some parts failed")?;

    tokio::fs::rename(&part_path, target)
        .await
        .with_context(|| format!("moving finished download into place at [{}]", target.display()))
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_definition_parses() {
        let definition = serde_json::from_str::<CdnDefinition>(
            r#"{
                "OriginalFileName": "biggest-mod-ever.7z",
                "Size": 3221225472,
                "Hash": "kPSWBSuHRkM=",
                "Parts": [
                    { "Index": 0, "Offset": 0, "Size": 2147483648, "Hash": "AAECAwQFBgc=" },
                    { "Index": 1, "Offset": 2147483648, "Size": 1073741824, "Hash": "BwYFBAMCAQA=" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(definition.parts.len(), 2);
        assert_eq!(definition.parts[1].offset, 2147483648);
    }
}
