use {
    anyhow::{Context, Result},
    once_cell::sync::Lazy,
    std::path::{Path, PathBuf},
    tap::prelude::*,
    tracing::{debug, warn},
};

const TEMP_DIR_PREFIX: &str = "wapiti-";

fn temp_root() -> PathBuf {
    std::env::temp_dir()
}

/// every scratch file of this process lives under one pid-stamped directory so
/// that crash residue is attributable and reclaimable (see [`cleanup_stale_temp_dirs`])
pub static TEMP_FILE_DIR: Lazy<&'static Path> = Lazy::new(|| {
    temp_root()
        .join(format!("{TEMP_DIR_PREFIX}{}", std::process::id()))
        .tap(|dir| {
            std::fs::create_dir_all(dir).unwrap_or_else(|e| panic!("could not create temp directory at [{}]: {e}", dir.display()));
        })
        .into_boxed_path()
        .pipe(Box::leak)
});

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    // no cheap liveness probe - leave the directory for a manual cleanup
    true
}

/// removes pid-stamped temp directories left behind by processes that no longer
/// exist - runs once at startup, before any extraction starts
pub fn cleanup_stale_temp_dirs() -> Result<()> {
    let root = temp_root();
    std::fs::read_dir(&root)
        .with_context(|| format!("enumerating [{}]", root.display()))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.strip_prefix(TEMP_DIR_PREFIX))
                        .and_then(|pid| pid.parse::<u32>().ok())
                        .map(|pid| (pid, entry.path()))
                })
                .filter(|(pid, _)| *pid != std::process::id() && !pid_is_alive(*pid))
                .for_each(|(pid, stale)| match std::fs::remove_dir_all(&stale) {
                    Ok(_) => debug!("removed stale temp directory of dead process [{pid}]: [{}]", stale.display()),
                    Err(e) => warn!("could not remove stale temp directory [{}]: {e}", stale.display()),
                })
        })
}
