//! renders the `<archive>.meta` sidecar the mod manager reads next to each
//! download. the `[General]` section carries at least `installed=true` or
//! `removed=true`; source-specific lines let the manager re-resolve the file.

use {
    crate::modlist_json::{Archive, State},
    std::path::Path,
};

pub const META_EXTENSION: &str = "meta";

pub fn meta_path(archive_path: &Path) -> std::path::PathBuf {
    archive_path.with_extension(
        archive_path
            .extension()
            .map(|extension| format!("{}.{META_EXTENSION}", extension.to_string_lossy()))
            .unwrap_or_else(|| META_EXTENSION.to_string()),
    )
}

/// source-specific ini lines for a known archive
pub fn source_ini_lines(state: &State) -> Vec<String> {
    match state {
        State::Nexus(nexus) => vec![
            format!("gameName={}", nexus.game_name),
            format!("modID={}", nexus.mod_id),
            format!("fileID={}", nexus.file_id),
        ],
        State::Http(http) => vec![format!("directURL={}", http.url)],
        State::WabbajackCDN(cdn) => vec![format!("directURL={}", cdn.url)],
        State::GoogleDrive(drive) => vec![format!("directURL=https://drive.google.com/uc?export=download&id={}", drive.id)],
        State::MediaFire(mediafire) => vec![format!("directURL={}", mediafire.url)],
        State::Mega(mega) => vec![format!("directURL={}", mega.url)],
        State::Manual(manual) => vec![format!("manualURL={}", manual.url)],
        State::GameFileSource(game_file) => vec![
            format!("gameName={}", game_file.game),
            format!("gameFile={}", game_file.game_file),
        ],
    }
}

/// the sidecar for a download that matches a modlist archive
pub fn installed_meta(archive: &Archive) -> String {
    let mut lines = vec!["[General]".to_string(), "installed=true".to_string()];
    lines.extend(source_ini_lines(&archive.state));
    lines.join("\n") + "\n"
}

/// the sidecar for a download the modlist knows nothing about
pub fn removed_meta() -> String {
    "[General]\nremoved=true\n".to_string()
}

/// a user-maintained meta must not be clobbered with `removed=true`; one we
/// wrote ourselves (or one already marking removal) may be refreshed
pub fn may_mark_removed(existing_contents: Option<&str>) -> bool {
    match existing_contents {
        None => true,
        Some(contents) => contents.contains("removed="),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq, std::path::PathBuf};

    #[test]
    fn test_meta_path() {
        assert_eq!(meta_path(Path::new("/downloads/mod.7z")), PathBuf::from("/downloads/mod.7z.meta"));
    }

    #[test]
    fn test_installed_meta_for_http_source() {
        let archive = serde_json::from_str::<Archive>(
            r#"{
                "Hash": "kPSWBSuHRkM=",
                "Meta": "",
                "Name": "a.7z",
                "Size": 1,
                "$type": "HttpDownloader, Wabbajack.Lib",
                "Url": "https://example.com/a.7z"
            }"#,
        )
        .unwrap();
        assert_eq!(
            installed_meta(&archive),
            "[General]\ninstalled=true\ndirectURL=https://example.com/a.7z\n"
        );
    }

    #[test]
    fn test_user_meta_is_not_clobbered() {
        assert!(may_mark_removed(None));
        assert!(may_mark_removed(Some("[General]\nremoved=true\n")));
        assert!(!may_mark_removed(Some("[General]\nmanualURL=https://example.com\n")));
    }
}
