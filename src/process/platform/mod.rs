//! Platform process-table access.
//!
//! The [`ProcessInspector`] trait is the only place the reaper touches the OS.
//! Linux reads `/proc` directly; macOS and Windows go through `sysinfo`, with
//! their own kill primitive. Tests substitute a fake inspector to simulate
//! PID reuse and process trees.

use crate::error::Result;
use crate::process::types::ProcessIdentity;
use std::sync::Arc;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
mod sysinfo_backend;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::ProcfsInspector;
pub use sysinfo_backend::SysinfoInspector;

/// Read and signal the OS process table.
pub trait ProcessInspector: Send + Sync {
    /// Every live (non-zombie) process.
    fn list_processes(&self) -> Vec<ProcessIdentity>;

    /// Current identity of `pid`, or `None` if no live process has it.
    fn resolve_identity(&self, pid: u32) -> Option<ProcessIdentity>;

    /// Direct children of `pid`.
    fn children(&self, pid: u32) -> Vec<u32> {
        self.list_processes()
            .into_iter()
            .filter(|p| p.parent_pid == Some(pid))
            .map(|p| p.pid)
            .collect()
    }

    /// Forcibly terminate `pid`.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::ProcessNotFound`](crate::error::LauncherError::ProcessNotFound)
    ///   if the process is already gone
    /// - [`LauncherError::KillFailed`](crate::error::LauncherError::KillFailed)
    ///   if the OS refused
    fn kill(&self, pid: u32) -> Result<()>;
}

/// Create the inspector for the running platform.
pub fn create_inspector() -> Arc<dyn ProcessInspector> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::ProcfsInspector::new())
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(macos::MacInspector::new())
    }
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsInspector::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Arc::new(SysinfoInspector::new())
    }
}

/// Send `SIGKILL` to a single process.
#[cfg(unix)]
pub(crate) fn send_sigkill(pid: u32) -> Result<()> {
    use crate::error::LauncherError;

    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        // 0 and negative values address process groups.
        _ => return Err(LauncherError::ProcessNotFound(pid)),
    };
    // SAFETY: kill(2) with a positive pid signals exactly that process and
    // touches no memory owned by us.
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Err(LauncherError::ProcessNotFound(pid))
    } else {
        Err(LauncherError::KillFailed {
            pid,
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn create_inspector_sees_current_process() {
        let inspector = create_inspector();
        let me = inspector.resolve_identity(std::process::id()).unwrap();
        assert_eq!(me.pid, std::process::id());
        let exe = std::env::current_exe().unwrap();
        assert_eq!(
            crate::process::types::normalize(me.executable.as_deref().unwrap()),
            crate::process::types::normalize(&exe)
        );
    }

    #[cfg(unix)]
    #[test]
    fn sigkill_refuses_group_addresses() {
        use crate::error::LauncherError;
        assert!(matches!(send_sigkill(0), Err(LauncherError::ProcessNotFound(0))));
        assert!(matches!(
            send_sigkill(u32::MAX),
            Err(LauncherError::ProcessNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn sigkill_kills_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        send_sigkill(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
