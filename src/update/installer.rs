//! Binary replacement for the running launcher.
//!
//! The running executable is renamed to a sibling `.old` file, the verified
//! artifact is moved into its place, and the new binary is started with
//! [`CLEANUP_FLAG`] so it can delete the `.old` file once this process has
//! exited. Every filesystem step happens in the executable's own directory so
//! the renames stay on one filesystem.

use crate::error::{LauncherError, Result};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Private flag that puts the binary into post-update cleanup mode.
pub const CLEANUP_FLAG: &str = "--cleanup-after-update";

/// Deletion attempts made by cleanup mode while the old process exits.
const CLEANUP_ATTEMPTS: u32 = 10;

/// Delay between cleanup attempts.
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Starts a binary and returns its PID.
pub type Relauncher = Box<dyn Fn(&Path, &[OsString]) -> std::io::Result<u32> + Send + Sync>;

/// Result of a successful install.
///
/// The new binary is already running in cleanup mode; the caller must exit
/// the current process promptly so the `.old` file can be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Path now holding the new binary.
    pub installed: PathBuf,
    /// Where the previous binary was moved.
    pub backup: PathBuf,
    /// PID of the relaunched binary.
    pub relaunched_pid: u32,
}

/// Swaps the running executable for a downloaded artifact.
pub struct UpdateInstaller {
    current_exe: PathBuf,
    relauncher: Relauncher,
    rename_aside: fn(&Path, &Path) -> std::io::Result<()>,
    in_progress: AtomicBool,
}

impl UpdateInstaller {
    /// Installer targeting the currently running executable.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable path cannot be determined.
    pub fn for_current_exe() -> Result<Self> {
        Ok(Self::new(current_exe_path()?))
    }

    /// Installer targeting `current_exe`.
    pub fn new(current_exe: PathBuf) -> Self {
        Self {
            current_exe,
            relauncher: Box::new(spawn_detached),
            rename_aside: |from, to| std::fs::rename(from, to),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Replace how the new binary is started.
    #[must_use]
    pub fn with_relauncher(mut self, relauncher: Relauncher) -> Self {
        self.relauncher = relauncher;
        self
    }

    /// The executable this installer replaces.
    pub fn current_exe(&self) -> &Path {
        &self.current_exe
    }

    /// Sibling path the running binary is moved to.
    pub fn backup_path(&self) -> PathBuf {
        backup_path(&self.current_exe)
    }

    /// Where a downloaded artifact should be staged: next to the executable.
    pub fn staging_path(&self) -> PathBuf {
        append_suffix(&self.current_exe, "new")
    }

    /// Install `artifact` over the running executable and relaunch.
    ///
    /// On failure before the relaunch the original binary is back in place.
    /// If only the relaunch fails, the new binary stays installed and the
    /// previous one is left at [`backup_path`](Self::backup_path).
    ///
    /// # Errors
    ///
    /// - [`LauncherError::AlreadyInProgress`] if another install is running
    /// - [`LauncherError::MissingPath`] if the artifact does not exist
    /// - [`LauncherError::Install`] for any failed swap or relaunch step
    pub fn install(&self, artifact: &Path) -> Result<InstallOutcome> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LauncherError::AlreadyInProgress("update install".to_owned()));
        }
        let result = self.install_inner(artifact);
        self.in_progress.store(false, Ordering::Release);
        result
    }

    fn install_inner(&self, artifact: &Path) -> Result<InstallOutcome> {
        if !artifact.is_file() {
            return Err(LauncherError::MissingPath(artifact.to_owned()));
        }
        let current = &self.current_exe;
        let backup = self.backup_path();

        set_executable(artifact)?;
        clear_quarantine(artifact);

        if backup.exists() {
            std::fs::remove_file(&backup).map_err(|e| {
                LauncherError::Install(format!(
                    "cannot remove stale backup {}: {e}",
                    backup.display()
                ))
            })?;
            tracing::debug!("removed stale backup {}", backup.display());
        }

        (self.rename_aside)(current, &backup).map_err(|e| {
            LauncherError::Install(format!(
                "cannot move current binary {} → {}: {e}",
                current.display(),
                backup.display()
            ))
        })?;

        if let Err(e) = move_into_place(artifact, current) {
            if let Err(restore) = std::fs::rename(&backup, current) {
                tracing::error!(
                    "cannot restore {} after failed install: {restore}",
                    current.display()
                );
            }
            return Err(e);
        }
        tracing::info!("binary updated at {}", current.display());

        let args = [
            OsString::from(CLEANUP_FLAG),
            backup.clone().into_os_string(),
            current.clone().into_os_string(),
        ];
        let relaunched_pid = (self.relauncher)(current, &args).map_err(|e| {
            LauncherError::Install(format!(
                "new binary installed but relaunch failed ({e}); previous binary kept at {}",
                backup.display()
            ))
        })?;
        tracing::info!(pid = relaunched_pid, "relaunched updated binary");

        Ok(InstallOutcome {
            installed: current.clone(),
            backup,
            relaunched_pid,
        })
    }
}

/// Returns the path to the currently running executable.
///
/// # Errors
///
/// Returns an error if the path cannot be determined.
pub fn current_exe_path() -> Result<PathBuf> {
    std::env::current_exe().map_err(|e| {
        LauncherError::Install(format!("cannot determine current executable path: {e}"))
    })
}

/// `<exe>.old` next to `exe`.
pub fn backup_path(exe: &Path) -> PathBuf {
    append_suffix(exe, "old")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Returns `true` if `artifact` exists and is exactly `expected_size` bytes.
pub fn verify(artifact: &Path, expected_size: u64) -> bool {
    match std::fs::metadata(artifact) {
        Ok(meta) if meta.is_file() && meta.len() == expected_size => true,
        Ok(meta) => {
            tracing::warn!(
                expected = expected_size,
                actual = meta.len(),
                "artifact size mismatch for {}",
                artifact.display()
            );
            false
        }
        Err(e) => {
            tracing::warn!("cannot stat artifact {}: {e}", artifact.display());
            false
        }
    }
}

/// Compare the SHA-256 of `artifact` with a hex digest.
///
/// # Errors
///
/// Returns an error if the artifact cannot be read.
pub fn verify_checksum(artifact: &Path, expected_hex: &str) -> Result<bool> {
    let actual = sha256_hex(artifact)?;
    let matches = actual.eq_ignore_ascii_case(expected_hex.trim());
    if !matches {
        tracing::warn!(expected = expected_hex, actual = %actual, "artifact checksum mismatch");
    }
    Ok(matches)
}

/// Hex SHA-256 of a file, streamed.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Delete the previous binary after an update.
///
/// Only a sibling `<new>.old` file is ever deleted. A missing file counts as
/// already cleaned up.
///
/// # Errors
///
/// Returns an error if the paths do not look like an update pair or the old
/// binary is still locked after every attempt.
pub fn run_cleanup(old_exe: &Path, new_exe: &Path) -> Result<()> {
    run_cleanup_with(old_exe, new_exe, CLEANUP_ATTEMPTS, CLEANUP_RETRY_DELAY)
}

fn run_cleanup_with(old_exe: &Path, new_exe: &Path, attempts: u32, delay: Duration) -> Result<()> {
    if old_exe != backup_path(new_exe) {
        return Err(LauncherError::Install(format!(
            "refusing to delete {}: not the backup of {}",
            old_exe.display(),
            new_exe.display()
        )));
    }
    if !new_exe.is_file() {
        return Err(LauncherError::MissingPath(new_exe.to_owned()));
    }

    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match std::fs::remove_file(old_exe) {
            Ok(()) => {
                tracing::info!("removed previous binary {}", old_exe.display());
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                tracing::debug!(attempt, "previous binary still locked: {e}");
                last_error = Some(e);
                if attempt < attempts {
                    std::thread::sleep(delay);
                }
            }
        }
    }
    Err(LauncherError::Install(format!(
        "cannot remove {}: {}",
        old_exe.display(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn move_into_place(artifact: &Path, target: &Path) -> Result<()> {
    if std::fs::rename(artifact, target).is_ok() {
        return Ok(());
    }

    // Different filesystem: copy next to the target, then rename.
    let staging = append_suffix(target, "staging");
    let copied = std::fs::copy(artifact, &staging)
        .map_err(|e| e.to_string())
        .and_then(|_| set_executable(&staging).map_err(|e| e.to_string()))
        .and_then(|()| std::fs::rename(&staging, target).map_err(|e| e.to_string()));
    match copied {
        Ok(()) => {
            let _ = std::fs::remove_file(artifact);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&staging);
            Err(LauncherError::Install(format!(
                "cannot install new binary to {}: {e}",
                target.display()
            )))
        }
    }
}

/// Set executable permission on Unix platforms.
fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            LauncherError::Install(format!(
                "cannot set executable permission on {}: {e}",
                path.display()
            ))
        })?;
    }
    let _ = path;
    Ok(())
}

/// Clear the macOS quarantine attribute (best-effort).
fn clear_quarantine(path: &Path) {
    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("xattr")
            .args(["-d", "com.apple.quarantine"])
            .arg(path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
    let _ = path;
}

fn spawn_detached(exe: &Path, args: &[OsString]) -> std::io::Result<u32> {
    let mut command = std::process::Command::new(exe);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(dir) = exe.parent() {
        command.current_dir(dir);
    }
    let child = command.spawn()?;
    Ok(child.id())
}
