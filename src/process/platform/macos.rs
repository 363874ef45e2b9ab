//! macOS process inspection: `sysinfo` for reads, `SIGKILL` for kills.

use super::{ProcessInspector, SysinfoInspector};
use crate::error::Result;
use crate::process::types::ProcessIdentity;

/// Reads through [`SysinfoInspector`] and sends `SIGKILL` to kill.
pub struct MacInspector {
    inner: SysinfoInspector,
}

impl MacInspector {
    /// Inspector over the macOS process table.
    pub fn new() -> Self {
        Self {
            inner: SysinfoInspector::new(),
        }
    }
}

impl ProcessInspector for MacInspector {
    fn list_processes(&self) -> Vec<ProcessIdentity> {
        self.inner.list_processes()
    }

    fn resolve_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        self.inner.resolve_identity(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        super::send_sigkill(pid)
    }
}
