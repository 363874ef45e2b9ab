//! Error types for the launcher core.

use std::path::PathBuf;

/// Top-level error type for update and process management.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    /// A version string did not match `MAJOR.MINOR.PATCH[-PRERELEASE]`.
    #[error("invalid version format: {0:?}")]
    InvalidVersionFormat(String),

    /// Release index or artifact transfer failed at the network level.
    #[error("network error: {0}")]
    Network(String),

    /// A downloaded artifact did not match its expected size or checksum.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Binary swap or relaunch failed.
    #[error("install error: {0}")]
    Install(String),

    /// The PID no longer belongs to the process that was launched.
    #[error("process identity mismatch for pid {pid}: {reason}")]
    ProcessIdentityMismatch {
        /// PID that was about to be signalled.
        pid: u32,
        /// What differed between the record and the live process.
        reason: String,
    },

    /// The target process has already exited.
    #[error("process {0} not found")]
    ProcessNotFound(u32),

    /// Writing the artifact to disk failed.
    #[error("download error: {0}")]
    Download(String),

    /// Spawning a game process failed.
    #[error("launch failed for instance {instance_id}: {reason}")]
    LaunchFailed {
        /// Instance that was being launched.
        instance_id: String,
        /// Underlying cause.
        reason: String,
    },

    /// The OS refused to kill a verified process.
    #[error("failed to kill pid {pid}: {reason}")]
    KillFailed {
        /// PID that survived.
        pid: u32,
        /// Underlying cause.
        reason: String,
    },

    /// An equivalent operation is already running for the same target.
    #[error("already in progress: {0}")]
    AlreadyInProgress(String),

    /// No download session with this id.
    #[error("unknown download session: {0}")]
    UnknownSession(String),

    /// No tracked process with this id.
    #[error("unknown process: {0}")]
    UnknownProcess(String),

    /// The requested operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// A path that had to exist was missing.
    #[error("path not found: {}", .0.display())]
    MissingPath(PathBuf),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LauncherError {
    /// Whether the presentation layer should offer a retry for this error.
    ///
    /// Network failures are transient; verification and identity failures
    /// are not going to change by trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Download(_) | Self::KillFailed { .. })
    }
}

impl From<reqwest::Error> for LauncherError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LauncherError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn messages_are_single_line() {
        let errors = [
            LauncherError::InvalidVersionFormat("1.x".into()),
            LauncherError::ProcessIdentityMismatch {
                pid: 42,
                reason: "executable differs".into(),
            },
            LauncherError::MissingPath(PathBuf::from("/tmp/none")),
        ];
        for err in errors {
            assert!(!err.to_string().contains('\n'), "{err}");
        }
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(LauncherError::Network("reset".into()).is_retryable());
        assert!(!LauncherError::VerificationFailed("size".into()).is_retryable());
        assert!(!LauncherError::ProcessNotFound(1).is_retryable());
    }
}
