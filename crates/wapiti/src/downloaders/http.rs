//! resumable http fetch: bytes land in a `<name>.part` sidecar which is
//! atomically renamed once complete, so a crash can never leave a plausible
//! looking final file behind. partial sidecars resume through range requests.

use {
    super::Downloaders,
    crate::modlist_json::HumanUrl,
    anyhow::{bail, Context, Result},
    futures::StreamExt,
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
    tap::prelude::*,
    tokio::io::AsyncWriteExt,
    tracing::{debug, instrument, warn},
};

pub const MAX_ATTEMPTS: usize = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub fn part_path(target: &Path) -> PathBuf {
    target.with_extension(
        target
            .extension()
            .map(|extension| format!("{}.part", extension.to_string_lossy()))
            .unwrap_or_else(|| "part".to_string()),
    )
}

fn is_permanent(status: reqwest::StatusCode) -> bool {
    status.is_client_error()
}

/// one fetch attempt against a fresh request (a consumed request is never
/// reused - each retry rebuilds it, which is what makes resume offsets correct)
async fn attempt(downloaders: &Downloaders, url: &HumanUrl, target: &Path, expected_size: Option<u64>) -> Result<()> {
    let part = part_path(target);
    let start = tokio::fs::metadata(&part)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0);
    let request = downloaders
        .client
        .get(url.as_ref().clone())
        .pipe(|request| match start {
            0 => request,
            start => request.header(reqwest::header::RANGE, format!("bytes={start}-")),
        });
    let response = request.send().await.context("sending request")?;
    let status = response.status();
    if is_permanent(status) {
        bail!("permanent failure [{status}] for [{url}]");
    }
    if !(status.is_success() || status == reqwest::StatusCode::PARTIAL_CONTENT) {
        bail!("transient failure [{status}] for [{url}]");
    }
    let resuming = status == reqwest::StatusCode::PARTIAL_CONTENT && start > 0;
    let total = expected_size.or_else(|| {
        response
            .content_length()
            .map(|length| if resuming { start + length } else { length })
    });

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(resuming)
        .write(true)
        .truncate(!resuming)
        .open(&part)
        .await
        .with_context(|| format!("opening [{}]", part.display()))?;

    let job = downloaders
        .resources
        .downloads
        .begin(format!("downloading {url}"), total.unwrap_or(0))
        .await?;
    let mut stream = response.bytes_stream();
    let outcome = loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = downloaders.cancellation.cancelled() => break Err(anyhow::anyhow!("download cancelled")),
        };
        match chunk {
            None => break Ok(()),
            Some(Err(error)) => break Err(error).context("response ended prematurely"),
            Some(Ok(chunk)) => {
                if let Err(error) = file
                    .write_all(&chunk)
                    .await
                    .with_context(|| format!("writing to [{}]", part.display()))
                {
                    break Err(error);
                }
                if let Err(error) = downloaders.resources.downloads.report(&job, chunk.len() as u64).await {
                    break Err(error);
                }
            }
        }
    };
    downloaders.resources.downloads.finish(job);
    outcome?;
    file.flush().await.context("flushing part file")?;
    file.sync_all().await.context("syncing part file")?;

    if let Some(expected) = expected_size {
        let written = tokio::fs::metadata(&part).await.context("sizing part file")?.len();
        if written != expected {
            bail!("transient failure: response ended at [{written}] of [{expected}] bytes");
        }
    }
    tokio::fs::rename(&part, target)
        .await
        .with_context(|| format!("moving finished download into place at [{}]", target.display()))
}

#[instrument(skip(downloaders), level = "DEBUG")]
pub async fn download_resumable(downloaders: &Downloaders, url: &HumanUrl, target: &Path, expected_size: Option<u64>) -> Result<PathBuf> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating [{}]", parent.display()))?;
    }
    let mut last_error = None;
    for retry in 0..MAX_ATTEMPTS {
        if retry > 0 {
            let backoff = BACKOFF_BASE * 2u32.pow(retry as u32 - 1);
            debug!(?backoff, retry, "backing off before retrying");
            tokio::time::sleep(backoff).await;
        }
        match attempt(downloaders, url, target, expected_size).await {
            Ok(()) => return Ok(target.to_path_buf()),
            Err(error) => {
                let permanent = format!("{error:#}").contains("permanent failure");
                warn!("download attempt [{retry}] failed: {error:#}");
                last_error = Some(error);
                if permanent {
                    break;
                }
            }
        }
    }
    Err(last_error
        .expect("at least one attempt ran")
        .context(format!("downloading [{url}] failed after [{MAX_ATTEMPTS}] attempts")))
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_part_path_keeps_original_extension_visible() {
        assert_eq!(part_path(Path::new("/downloads/mod.7z")), PathBuf::from("/downloads/mod.7z.part"));
        assert_eq!(part_path(Path::new("/downloads/no-extension")), PathBuf::from("/downloads/no-extension.part"));
    }
}
