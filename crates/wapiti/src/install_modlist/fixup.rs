//! finalisation: the portable-mode marker, the mod manager's downloads
//! redirect, and screen-size tweaks in the known configuration inis.

use {
    crate::config_file::Resolution,
    anyhow::{Context, Result},
    itertools::Itertools,
    std::path::{Path, PathBuf},
    tap::prelude::*,
    tracing::{debug, info, instrument},
};

/// presence of this file forces the mod manager into portable (self-contained)
/// mode
pub const PORTABLE_MARKER: &str = "portable.txt";
pub const MOD_MANAGER_INI: &str = "ModOrganizer.ini";

/// profile inis that understand the display size keys
pub const RESOLUTION_INIS: &[&str] = &["skyrimprefs.ini", "fallout4prefs.ini", "falloutprefs.ini", "oblivion.ini"];

pub fn write_portable_marker(installation_path: &Path) -> Result<()> {
    std::fs::write(installation_path.join(PORTABLE_MARKER), b"")
        .context("writing portable marker")
        .tap_ok(|_| info!("portable marker written"))
}

/// rewrites the `download_directory` key to the actual downloads location; the
/// compiled list carries the author's machine there
pub fn remap_mod_manager_ini(installation_path: &Path, downloads_directory: &Path) -> Result<()> {
    let ini_path = installation_path.join(MOD_MANAGER_INI);
    if !ini_path.exists() {
        debug!("no [{MOD_MANAGER_INI}] to remap");
        return Ok(());
    }
    let downloads = downloads_directory.display().to_string().replace('\\', "/");
    std::fs::read_to_string(&ini_path)
        .with_context(|| format!("reading [{}]", ini_path.display()))
        .map(|contents| set_ini_key(&contents, "download_directory", &downloads))
        .and_then(|contents| {
            std::fs::write(&ini_path, contents).with_context(|| format!("writing [{}]", ini_path.display()))
        })
        .tap_ok(|_| info!("download directory remapped to [{downloads}]"))
}

/// line-based on purpose - these files carry comments and unknown keys that a
/// full ini round-trip would mangle
pub fn set_ini_key(contents: &str, key: &str, value: &str) -> String {
    let mut replaced = false;
    let mut lines = contents
        .lines()
        .map(|line| {
            let is_key = line
                .split_once('=')
                .map(|(lhs, _)| lhs.trim().eq_ignore_ascii_case(key))
                .unwrap_or(false);
            match is_key {
                true => {
                    replaced = true;
                    format!("{key}={value}")
                }
                false => line.to_string(),
            }
        })
        .collect_vec();
    if !replaced {
        lines.push(format!("{key}={value}"));
    }
    lines.join("\n") + "\n"
}

/// applies `iSize W` / `iSize H` to every known prefs ini below the profiles
/// directory
#[instrument(skip(installation_path), level = "INFO")]
pub fn apply_resolution(installation_path: &Path, resolution: Resolution) -> Result<()> {
    let prefs_files = walkdir::WalkDir::new(installation_path.join("profiles"))
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| RESOLUTION_INIS.contains(&name.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|entry| entry.path().to_path_buf())
        .collect::<Vec<PathBuf>>();
    for prefs in prefs_files {
        std::fs::read_to_string(&prefs)
            .with_context(|| format!("reading [{}]", prefs.display()))
            .map(|contents| {
                set_ini_key(&contents, "iSize W", &resolution.x.to_string())
                    .pipe(|contents| set_ini_key(&contents, "iSize H", &resolution.y.to_string()))
            })
            .and_then(|contents| std::fs::write(&prefs, contents).with_context(|| format!("writing [{}]", prefs.display())))
            .tap_ok(|_| info!(prefs = %prefs.display(), %resolution, "resolution applied"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    #[test]
    fn test_set_ini_key_replaces_in_place() {
        let contents = "[Settings]\ndownload_directory=C:/somewhere\nother=1\n";
        assert_eq!(
            set_ini_key(contents, "download_directory", "/downloads"),
            "[Settings]\ndownload_directory=/downloads\nother=1\n"
        );
    }

    #[test]
    fn test_set_ini_key_appends_when_missing() {
        assert_eq!(set_ini_key("[Display]", "iSize W", "1920"), "[Display]\niSize W=1920\n");
    }

    #[test]
    fn test_resolution_lands_in_profile_prefs() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("profiles").join("Default");
        std::fs::create_dir_all(&profile).unwrap();
        std::fs::write(profile.join("SkyrimPrefs.ini"), "[Display]\niSize W=1280\niSize H=720\n").unwrap();
        apply_resolution(dir.path(), Resolution { x: 2560, y: 1440 }).unwrap();
        let contents = std::fs::read_to_string(profile.join("SkyrimPrefs.ini")).unwrap();
        assert!(contents.contains("iSize W=2560"));
        assert!(contents.contains("iSize H=1440"));
    }

    #[test]
    fn test_portable_marker() {
        let dir = tempfile::tempdir().unwrap();
        write_portable_marker(dir.path()).unwrap();
        assert!(dir.path().join(PORTABLE_MARKER).exists());
    }
}
