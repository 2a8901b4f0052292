use crate::modlist_json::Archive;

/// outcome of a fan-out section: either every task's value, or every failure
/// that occurred (reported together instead of dying on the first one)
pub type TotalResult<T> = std::result::Result<Vec<T>, Vec<anyhow::Error>>;

/// terminal outcomes of the installer state machine. anything recoverable is
/// retried inside the failing phase; these are what's left once recovery is
/// exhausted.
#[derive(Debug, thiserror::Error)]
pub enum InstallAbort {
    #[error("[{}] archives require manual download", manual_downloads.len())]
    DownloadFailed { manual_downloads: Vec<Archive> },
    #[error("game directory could not be resolved - configure the game root for this game type")]
    GameMissing,
    #[error("game directory is not a valid game installation: {reason}")]
    GameInvalid { reason: String },
    #[error("installation was cancelled")]
    Cancelled,
}

impl InstallAbort {
    /// the contract with scripts driving the CLI: 0 success, 1 manual downloads
    /// required, 2 anything else
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DownloadFailed { manual_downloads } if !manual_downloads.is_empty() => 1,
            _ => 2,
        }
    }
}

#[extension_traits::extension(pub trait AbortOrErrorExt)]
impl anyhow::Error {
    fn as_abort(&self) -> Option<&InstallAbort> {
        self.chain().find_map(|cause| cause.downcast_ref::<InstallAbort>())
    }
}
