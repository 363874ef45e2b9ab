//! Self-update for the launcher.
//!
//! Fetches the release index, picks the newest eligible release for the
//! user's channel, downloads it resumably next to the running binary, and
//! swaps it in with a relaunch into cleanup mode.

pub mod checker;
pub mod download;
pub mod installer;
pub mod release;
pub mod version;

pub use checker::{GitHubReleaseFeed, ReleaseFeed};
pub use download::{DownloadId, DownloadProgress, DownloadSession, DownloadState, Downloader};
pub use installer::{CLEANUP_FLAG, InstallOutcome, UpdateInstaller};
pub use release::{ReleaseChannel, ReleaseInfo, ReleaseSettings, UpdateCandidate, select_update};
pub use version::Version;
