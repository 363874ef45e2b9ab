//! Process inspection through the `sysinfo` crate.

use super::ProcessInspector;
use crate::error::{LauncherError, Result};
use crate::process::types::ProcessIdentity;
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};

/// Cross-platform inspector backed by a cached [`System`].
///
/// Every query refreshes the processes it reads, so identities are never
/// older than the call.
pub struct SysinfoInspector {
    system: Mutex<System>,
}

impl SysinfoInspector {
    /// Create an inspector with an empty process cache.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh(&self, which: ProcessesToUpdate<'_>) -> MutexGuard<'_, System> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            which,
            true,
            ProcessRefreshKind::nothing()
                .with_exe(UpdateKind::Always)
                .with_cwd(UpdateKind::Always)
                .with_cmd(UpdateKind::Always),
        );
        system
    }

    /// Kill through `sysinfo`, preferring `SIGKILL` where signals exist.
    ///
    /// # Errors
    ///
    /// [`LauncherError::ProcessNotFound`] if the process is gone,
    /// [`LauncherError::KillFailed`] if the OS refused.
    pub fn kill_process(&self, pid: u32) -> Result<()> {
        let spid = Pid::from_u32(pid);
        let system = self.refresh(ProcessesToUpdate::Some(&[spid]));
        let process = system
            .process(spid)
            .filter(|p| is_live(p))
            .ok_or(LauncherError::ProcessNotFound(pid))?;
        let sent = process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill());
        if sent {
            Ok(())
        } else {
            Err(LauncherError::KillFailed {
                pid,
                reason: "signal not delivered".to_owned(),
            })
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn list_processes(&self) -> Vec<ProcessIdentity> {
        let system = self.refresh(ProcessesToUpdate::All);
        system
            .processes()
            .values()
            .filter(|p| is_live(p))
            .map(identity_of)
            .collect()
    }

    fn resolve_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        let spid = Pid::from_u32(pid);
        let system = self.refresh(ProcessesToUpdate::Some(&[spid]));
        system.process(spid).filter(|p| is_live(p)).map(identity_of)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.kill_process(pid)
    }
}

fn is_live(process: &sysinfo::Process) -> bool {
    !matches!(
        process.status(),
        sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead
    )
}

fn identity_of(process: &sysinfo::Process) -> ProcessIdentity {
    ProcessIdentity {
        pid: process.pid().as_u32(),
        parent_pid: process.parent().map(|p| p.as_u32()),
        name: process.name().to_string_lossy().into_owned(),
        executable: process.exe().map(|p| p.to_owned()),
        working_dir: process.cwd().map(|p| p.to_owned()),
        command_line: process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
    }
}
