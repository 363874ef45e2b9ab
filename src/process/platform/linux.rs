//! `/proc` backed process inspection.

use super::ProcessInspector;
use crate::error::Result;
use crate::process::types::ProcessIdentity;
use std::path::{Path, PathBuf};

/// Reads identities straight from procfs.
pub struct ProcfsInspector {
    root: PathBuf,
}

impl ProcfsInspector {
    /// Inspector over the system `/proc`.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }

    fn read_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        let dir = self.root.join(pid.to_string());
        let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
        let (name, state, ppid) = parse_stat(&stat)?;
        if matches!(state, 'Z' | 'X' | 'x') {
            return None;
        }

        // exe and cwd are unreadable for other users' processes.
        let executable = std::fs::read_link(dir.join("exe"))
            .ok()
            .map(|p| strip_deleted(&p));
        let working_dir = std::fs::read_link(dir.join("cwd")).ok();
        let command_line = std::fs::read(dir.join("cmdline"))
            .map(|raw| {
                raw.split(|b| *b == 0)
                    .filter(|arg| !arg.is_empty())
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            })
            .unwrap_or_default();

        Some(ProcessIdentity {
            pid,
            parent_pid: (ppid > 0).then_some(ppid),
            name,
            executable,
            working_dir,
            command_line,
        })
    }
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for ProcfsInspector {
    fn list_processes(&self) -> Vec<ProcessIdentity> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            tracing::warn!("cannot read {}", self.root.display());
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|pid| self.read_identity(pid))
            .collect()
    }

    fn resolve_identity(&self, pid: u32) -> Option<ProcessIdentity> {
        self.read_identity(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        super::send_sigkill(pid)
    }
}

/// Parse `(comm, state, ppid)` out of `/proc/<pid>/stat`.
///
/// `comm` may itself contain spaces and parentheses, so it spans from the
/// first `(` to the last `)`.
fn parse_stat(stat: &str) -> Option<(String, char, u32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    if close < open {
        return None;
    }
    let name = stat[open + 1..close].to_owned();
    let mut rest = stat[close + 1..].split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some((name, state, ppid))
}

fn strip_deleted(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_suffix(" (deleted)") {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_owned(),
    }
}
