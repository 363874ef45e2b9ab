//! Windows process inspection: `sysinfo` for reads, `taskkill` for kills.
//!
//! The working directory of another process is not reliably readable on
//! Windows, so identities never carry one and the identity check falls back
//! to the executable path alone.

use super::{ProcessInspector, SysinfoInspector};
use crate::error::{LauncherError, Result};
use crate::process::types::ProcessIdentity;
use std::os::windows::process::CommandExt;

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Reads through [`SysinfoInspector`] and runs `taskkill /F` to kill.
pub struct WindowsInspector {
    inner: SysinfoInspector,
}

impl WindowsInspector {
    /// Inspector over the Windows process table.
    pub fn new() -> Self {
        Self {
            inner: SysinfoInspector::new(),
        }
    }
}

impl ProcessInspector for WindowsInspector {
    fn list_processes(&self) -> Vec<ProcessIdentity> {
        self.inner
            .list_processes()
            .into_iter()
            .map(without_cwd)
            .collect()
    }

    fn resolve_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        self.inner.resolve_identity(pid).map(without_cwd)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        // No /T: the reaper walks the tree itself so every child is verified.
        let output = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| LauncherError::KillFailed {
                pid,
                reason: format!("cannot run taskkill: {e}"),
            })?;
        if output.status.success() {
            return Ok(());
        }
        if self.inner.resolve_identity(pid).is_none() {
            return Err(LauncherError::ProcessNotFound(pid));
        }
        Err(LauncherError::KillFailed {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

fn without_cwd(mut identity: ProcessIdentity) -> ProcessIdentity {
    identity.working_dir = None;
    identity
}
