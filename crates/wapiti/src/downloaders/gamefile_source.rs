//! game-file source: the archive is a file shipped with the game itself,
//! copied out of the configured game folder instead of fetched over the wire.

use {
    super::{helpers::FutureAnyhowExt, Downloaders},
    crate::modlist_json::GameFileSourceState,
    anyhow::{Context, Result},
    std::path::Path,
    tracing::instrument,
};

#[instrument(skip(downloaders), level = "INFO")]
pub async fn copy_from_game_folder(downloaders: &Downloaders, state: &GameFileSourceState, target: &Path) -> Result<()> {
    let game_root = downloaders
        .config
        .games
        .get(&state.game)
        .with_context(|| format!("game [{}] is not configured - add it to the games section", state.game))?
        .root_directory
        .clone();
    let source = game_root.join(state.game_file.clone().into_path());
    let size = tokio::fs::metadata(&source)
        .map_with_context(|| format!("game file [{}] does not exist", source.display()))
        .await?
        .len();
    let job = downloaders
        .resources
        .downloads
        .begin(format!("copying {}", source.display()), size)
        .await?;
    let outcome = tokio::fs::copy(&source, target)
        .map_with_context(|| format!("copying [{}] to [{}]", source.display(), target.display()))
        .await;
    downloaders.resources.downloads.report_no_wait(&job, size);
    downloaders.resources.downloads.finish(job);
    outcome.map(|_| ())
}
