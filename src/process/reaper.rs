//! Terminates game processes and their descendants.
//!
//! Every kill is preceded by an identity check so a recycled PID is never
//! signalled. Descendants are killed deepest first and the root last, which
//! stops Prism from respawning Java while the tree is torn down.

use crate::error::{LauncherError, Result};
use crate::process::platform::ProcessInspector;
use crate::process::supervisor::ProcessSupervisor;
use crate::process::types::{IdentityVerdict, LaunchedProcess, ProcessIdentity};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What a tree kill did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeKill {
    /// The root was signalled (or was already gone).
    pub root_killed: bool,
    /// PIDs signalled in kill order, root last.
    pub pids: Vec<u32>,
}

impl TreeKill {
    /// Number of processes signalled.
    pub fn count(&self) -> usize {
        self.pids.len()
    }
}

/// Kills tracked processes and sweeps strays belonging to an instance.
pub struct ProcessReaper {
    supervisor: ProcessSupervisor,
    inspector: Arc<dyn ProcessInspector>,
    allowlist: Vec<String>,
    terminating: Mutex<HashSet<String>>,
}

impl ProcessReaper {
    /// Create a reaper over a supervisor's records.
    ///
    /// `allowlist` names the process images the instance sweep may kill.
    pub fn new(
        supervisor: ProcessSupervisor,
        inspector: Arc<dyn ProcessInspector>,
        allowlist: Vec<String>,
    ) -> Self {
        Self {
            supervisor,
            inspector,
            allowlist,
            terminating: Mutex::new(HashSet::new()),
        }
    }

    /// Terminate a tracked process and its descendants.
    ///
    /// Terminating a process that already ended is a no-op. Concurrent calls
    /// for the same id are coalesced: the second returns immediately.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::UnknownProcess`] if the id was never tracked
    /// - [`LauncherError::ProcessIdentityMismatch`] if the PID now belongs to
    ///   another program; nothing is killed
    /// - [`LauncherError::KillFailed`] if the OS refused to kill the root
    pub fn terminate(&self, id: &str) -> Result<()> {
        let record = self
            .supervisor
            .get(id)
            .ok_or_else(|| LauncherError::UnknownProcess(id.to_owned()))?;
        if record.status.is_terminal() {
            debug!(process = %id, status = %record.status, "terminate on ended process ignored");
            return Ok(());
        }
        let Some(_claim) = self.claim(id) else {
            debug!(process = %id, "terminate already in progress");
            return Ok(());
        };

        let outcome = self.kill_tree(&record)?;
        if outcome.root_killed {
            self.supervisor
                .mark_killed(id, "terminated by launcher")?;
            info!(process = %id, pid = record.pid, killed = outcome.count(), "terminated process tree");
        } else {
            // Root exited on its own between lookup and kill.
            self.supervisor.poll_once();
        }
        Ok(())
    }

    fn claim(&self, id: &str) -> Option<TerminateClaim<'_>> {
        let mut terminating = self.terminating.lock().unwrap_or_else(|e| e.into_inner());
        terminating.insert(id.to_owned()).then(|| TerminateClaim {
            set: &self.terminating,
            id: id.to_owned(),
        })
    }

    /// Kill a recorded process and every descendant, root last.
    ///
    /// # Errors
    ///
    /// [`LauncherError::ProcessIdentityMismatch`] if the root PID no longer
    /// belongs to the recorded program, [`LauncherError::KillFailed`] if the
    /// root could not be killed.
    pub fn kill_tree(&self, record: &LaunchedProcess) -> Result<TreeKill> {
        let root = record.pid;
        match self.inspector.resolve_identity(root) {
            None => return Ok(TreeKill::default()),
            Some(identity) => self.check_root(record, &identity)?,
        }

        let mut descendants = self.descendants(root);
        descendants.reverse();
        let mut pids: Vec<u32> = descendants
            .iter()
            .filter(|child| self.kill_child(child, record))
            .map(|child| child.pid)
            .collect();

        // The root may have exited (or its PID been reused) while children died.
        let Some(identity) = self.inspector.resolve_identity(root) else {
            return Ok(TreeKill {
                root_killed: true,
                pids,
            });
        };
        self.check_root(record, &identity)?;
        match self.inspector.kill(root) {
            Ok(()) | Err(LauncherError::ProcessNotFound(_)) => {
                pids.push(root);
                Ok(TreeKill {
                    root_killed: true,
                    pids,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn check_root(&self, record: &LaunchedProcess, identity: &ProcessIdentity) -> Result<()> {
        match identity.verify(&record.executable_path, Some(&record.working_directory)) {
            IdentityVerdict::Match => Ok(()),
            IdentityVerdict::Mismatch(reason) => {
                warn!(process = %record.id, pid = record.pid, %reason, "refusing to kill reused pid");
                Err(LauncherError::ProcessIdentityMismatch {
                    pid: record.pid,
                    reason,
                })
            }
        }
    }

    /// Breadth-first walk of one process-table snapshot under `root`,
    /// parents before children.
    fn descendants(&self, root: u32) -> Vec<ProcessIdentity> {
        let snapshot = self.inspector.list_processes();
        let mut by_parent: HashMap<u32, Vec<&ProcessIdentity>> = HashMap::new();
        for identity in &snapshot {
            if let Some(parent) = identity.parent_pid {
                by_parent.entry(parent).or_default().push(identity);
            }
        }

        let mut seen = HashSet::from([root]);
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            for child in by_parent.get(&pid).into_iter().flatten() {
                if seen.insert(child.pid) {
                    order.push((*child).clone());
                    queue.push_back(child.pid);
                }
            }
        }
        order
    }

    /// Kill a descendant if its PID still names the enumerated program.
    /// Returns whether it was signalled.
    fn kill_child(&self, enumerated: &ProcessIdentity, record: &LaunchedProcess) -> bool {
        let pid = enumerated.pid;
        let Some(current) = self.inspector.resolve_identity(pid) else {
            return false;
        };
        if let Some(exe) = &enumerated.executable
            && let IdentityVerdict::Mismatch(reason) = current.verify(exe, None)
        {
            warn!(process = %record.id, pid, %reason, "descendant pid changed owner, skipping");
            return false;
        }
        match self.inspector.kill(pid) {
            Ok(()) => {
                debug!(process = %record.id, pid, name = %current.name, "killed descendant");
                true
            }
            Err(LauncherError::ProcessNotFound(_)) => false,
            Err(e) => {
                warn!(process = %record.id, pid, "cannot kill descendant: {e}");
                false
            }
        }
    }

    /// Kill everything belonging to an instance.
    ///
    /// Tracked records of the instance are terminated first. Then any live
    /// process whose name is on the allowlist and which visibly references
    /// the instance is killed. The launcher's own process and processes
    /// tracked for other instances are never touched. Returns how many
    /// processes were killed.
    pub fn force_kill_by_instance(&self, instance_id: &str, instance_root: Option<&Path>) -> usize {
        let mut killed = 0;
        let mut signalled = HashSet::new();
        let records = self.supervisor.list();

        for record in records
            .iter()
            .filter(|r| r.instance_id == instance_id && !r.status.is_terminal())
        {
            match self.kill_tree(record) {
                Ok(outcome) => {
                    killed += outcome.count();
                    signalled.extend(outcome.pids.iter().copied());
                    if outcome.root_killed
                        && let Err(e) = self
                            .supervisor
                            .mark_killed(&record.id, "force-killed with instance")
                    {
                        warn!(process = %record.id, "cannot record kill: {e}");
                    }
                }
                Err(e) => warn!(process = %record.id, "force kill skipped: {e}"),
            }
        }

        let own_pid = std::process::id();
        let foreign: HashSet<u32> = records
            .iter()
            .filter(|r| r.instance_id != instance_id && !r.status.is_terminal())
            .map(|r| r.pid)
            .collect();

        for identity in self.inspector.list_processes() {
            // Signalled PIDs may linger until reaped.
            if identity.pid == own_pid
                || foreign.contains(&identity.pid)
                || signalled.contains(&identity.pid)
            {
                continue;
            }
            if !identity.name_matches(&self.allowlist)
                || !identity.references_instance(instance_id, instance_root)
            {
                continue;
            }
            match self.inspector.kill(identity.pid) {
                Ok(()) => {
                    info!(instance = %instance_id, pid = identity.pid, name = %identity.name, "killed stray instance process");
                    killed += 1;
                }
                Err(LauncherError::ProcessNotFound(_)) => {}
                Err(e) => warn!(instance = %instance_id, pid = identity.pid, "cannot kill stray: {e}"),
            }
        }

        self.supervisor.poll_once();
        info!(instance = %instance_id, killed, "force kill finished");
        killed
    }
}

struct TerminateClaim<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for TerminateClaim<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}
