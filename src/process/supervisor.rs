//! Launches game processes and tracks them until they exit.
//!
//! The supervisor is the only writer of [`LaunchedProcess`] records. A
//! background poller checks liveness every [`poll_interval`] and moves
//! records through `Starting → Running → {Finished, Crashed}`; the reaper
//! asks the supervisor to record `Killed`.
//!
//! [`poll_interval`]: ProcessSupervisor::poll_interval

use crate::config::ProcessConfig;
use crate::error::{LauncherError, Result};
use crate::process::types::{LaunchSpec, LaunchedProcess, ProcessId, ProcessStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type OutputTail = Arc<Mutex<VecDeque<String>>>;
type CrashFlag = Arc<Mutex<Option<String>>>;

/// How long an exited process may keep its output pipes open before it is
/// classified without the rest of its output.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

struct TrackedProcess {
    info: LaunchedProcess,
    child: Option<Child>,
    observed_running: bool,
    output: OutputTail,
    crash: CrashFlag,
    readers: Vec<JoinHandle<()>>,
    exited: Option<(ExitInfo, Instant)>,
}

impl TrackedProcess {
    /// Whether both output readers reached EOF, or the grace period ran out.
    fn output_drained(&self, exited_at: Instant) -> bool {
        self.readers.iter().all(JoinHandle::is_finished)
            || exited_at.elapsed() >= OUTPUT_DRAIN_GRACE
    }
}

struct Inner {
    records: Mutex<HashMap<ProcessId, TrackedProcess>>,
    launching: Mutex<HashSet<String>>,
    poll_interval: Duration,
    crash_markers: Vec<String>,
    tail_lines: usize,
}

/// Owns every launched-process record.
///
/// Cloning is cheap and shares the same records.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Create a supervisor from process settings.
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: Mutex::new(HashMap::new()),
                launching: Mutex::new(HashSet::new()),
                poll_interval: config.poll_interval(),
                crash_markers: config.crash_markers.clone(),
                tail_lines: config.output_tail_lines.max(1),
            }),
        }
    }

    /// How often the poller checks liveness.
    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ProcessId, TrackedProcess>> {
        self.inner.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a process for an instance and start tracking it.
    ///
    /// The record starts in [`ProcessStatus::Starting`] with its PID, resolved
    /// executable and start time filled in. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::AlreadyInProgress`] if the instance is launching or running
    /// - [`LauncherError::LaunchFailed`] if the executable cannot be found or spawned
    pub fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess> {
        let _guard = self.claim_instance(&spec.instance_id)?;
        let launch_failed = |reason: String| LauncherError::LaunchFailed {
            instance_id: spec.instance_id.clone(),
            reason,
        };

        let executable = resolve_executable(&spec.executable, &spec.working_dir)
            .map_err(|e| launch_failed(e.to_string()))?;

        let mut command = Command::new(&executable);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| launch_failed(format!("cannot spawn {}: {e}", executable.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_failed("process exited before its pid was read".to_owned()))?;

        let info = LaunchedProcess {
            id: format!("proc-{}", uuid::Uuid::new_v4()),
            instance_id: spec.instance_id.clone(),
            pid,
            executable_path: executable,
            working_directory: crate::process::types::normalize(&spec.working_dir),
            started_at: chrono::Utc::now(),
            status: ProcessStatus::Starting,
            exit_code: None,
            status_reason: None,
        };

        let output: OutputTail = Arc::default();
        let crash: CrashFlag = Arc::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.capture(
                stdout,
                &info,
                "stdout",
                Arc::clone(&output),
                Arc::clone(&crash),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.capture(
                stderr,
                &info,
                "stderr",
                Arc::clone(&output),
                Arc::clone(&crash),
            ));
        }

        info!(
            process = %info.id,
            instance = %info.instance_id,
            pid,
            exe = %info.executable_path.display(),
            "launched game process"
        );
        let snapshot = info.clone();
        self.records().insert(
            info.id.clone(),
            TrackedProcess {
                info,
                child: Some(child),
                observed_running: false,
                output,
                crash,
                readers,
                exited: None,
            },
        );
        Ok(snapshot)
    }

    fn claim_instance(&self, instance_id: &str) -> Result<LaunchGuard> {
        let records = self.records();
        if let Some(live) = records
            .values()
            .find(|t| t.info.instance_id == instance_id && !t.info.status.is_terminal())
        {
            return Err(LauncherError::AlreadyInProgress(format!(
                "instance {instance_id} is already {} as {}",
                live.info.status, live.info.id
            )));
        }
        let mut launching = self.inner.launching.lock().unwrap_or_else(|e| e.into_inner());
        if !launching.insert(instance_id.to_owned()) {
            return Err(LauncherError::AlreadyInProgress(format!(
                "instance {instance_id} is already launching"
            )));
        }
        Ok(LaunchGuard {
            inner: Arc::clone(&self.inner),
            instance_id: instance_id.to_owned(),
        })
    }

    /// Read one output stream line by line into the shared tail, raising the
    /// crash flag on the first line carrying a crash marker.
    fn capture<R>(
        &self,
        stream: R,
        info: &LaunchedProcess,
        label: &'static str,
        tail: OutputTail,
        crash: CrashFlag,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let cap = self.inner.tail_lines;
        let markers = self.inner.crash_markers.clone();
        let process = info.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        tracing::trace!(%process, stream = label, "{line}");
                        if let Some(marker) = match_crash_marker(&line, &markers) {
                            let mut crash = crash.lock().unwrap_or_else(|e| e.into_inner());
                            if crash.is_none() {
                                debug!(%process, stream = label, %marker, "crash marker in output");
                                *crash = Some(marker.to_owned());
                            }
                        }
                        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                        if tail.len() == cap {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%process, stream = label, "output capture stopped: {e}");
                        break;
                    }
                }
            }
        })
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> Option<LaunchedProcess> {
        self.records().get(id).map(|t| t.info.clone())
    }

    /// Current status of one record.
    pub fn status(&self, id: &str) -> Option<ProcessStatus> {
        self.records().get(id).map(|t| t.info.status)
    }

    /// Snapshots of every record, oldest first.
    pub fn list(&self) -> Vec<LaunchedProcess> {
        let mut all: Vec<LaunchedProcess> =
            self.records().values().map(|t| t.info.clone()).collect();
        all.sort_by_key(|p| p.started_at);
        all
    }

    /// Snapshots of records that have not reached a terminal status.
    pub fn active(&self) -> Vec<LaunchedProcess> {
        self.list()
            .into_iter()
            .filter(|p| !p.status.is_terminal())
            .collect()
    }

    /// Captured stdout/stderr lines of a process, oldest first.
    pub fn output_tail(&self, id: &str) -> Vec<String> {
        let records = self.records();
        let Some(tracked) = records.get(id) else {
            return Vec::new();
        };
        let tail = tracked.output.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }

    /// Check every live record once. Returns how many records changed status.
    ///
    /// An exited process is classified once its output readers reach EOF, so
    /// a crash marker printed just before exit is not missed.
    pub fn poll_once(&self) -> usize {
        let mut records = self.records();
        let mut changed = 0;
        for tracked in records.values_mut() {
            if tracked.info.status.is_terminal() {
                reap(tracked);
                continue;
            }

            if tracked.exited.is_none() {
                let exit = match tracked.child.as_mut().map(Child::try_wait) {
                    Some(Ok(None)) => {
                        if tracked.info.status == ProcessStatus::Starting {
                            tracked.observed_running = true;
                            apply(&mut tracked.info, ProcessStatus::Running, None);
                            changed += 1;
                        }
                        continue;
                    }
                    Some(Ok(Some(status))) => ExitInfo::from_status(status),
                    Some(Err(e)) => {
                        warn!(process = %tracked.info.id, "cannot query exit status: {e}");
                        ExitInfo::default()
                    }
                    None => ExitInfo::default(),
                };
                tracked.child = None;
                tracked.exited = Some((exit, Instant::now()));
            }

            let Some((exit, exited_at)) = tracked.exited else {
                continue;
            };
            if !tracked.output_drained(exited_at) {
                continue;
            }
            let marker = tracked
                .crash
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let (status, reason) = classify_exit(&exit, tracked.observed_running, marker.as_deref());
            tracked.info.exit_code = exit.code;
            apply(&mut tracked.info, status, reason);
            changed += 1;
        }
        changed
    }

    /// Run [`poll_once`](Self::poll_once) every poll interval until `cancel` fires.
    pub fn spawn_poller(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = supervisor.poll_interval().as_millis() as u64, "process poller started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("process poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        supervisor.poll_once();
                    }
                }
            }
        })
    }

    /// Record that a process was terminated by the launcher.
    ///
    /// Returns `false` if the record was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::UnknownProcess`] for an unknown id.
    pub fn mark_killed(&self, id: &str, reason: &str) -> Result<bool> {
        let mut records = self.records();
        let tracked = records
            .get_mut(id)
            .ok_or_else(|| LauncherError::UnknownProcess(id.to_owned()))?;
        if tracked.info.status.is_terminal() {
            return Ok(false);
        }
        apply(&mut tracked.info, ProcessStatus::Killed, Some(reason.to_owned()));
        reap(tracked);
        Ok(true)
    }

    /// Drop every terminal record. Returns how many were removed.
    pub fn cleanup_finished(&self) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, t| {
            if t.info.status.is_terminal() {
                reap(t);
                false
            } else {
                true
            }
        });
        let removed = before - records.len();
        if removed > 0 {
            info!(removed, "cleaned up finished processes");
        }
        removed
    }
}

struct LaunchGuard {
    inner: Arc<Inner>,
    instance_id: String,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        let mut launching = self.inner.launching.lock().unwrap_or_else(|e| e.into_inner());
        launching.remove(&self.instance_id);
    }
}

/// Exit details as far as the OS reported them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Decide the terminal status for an exited process.
pub(crate) fn classify_exit(
    exit: &ExitInfo,
    observed_running: bool,
    crash_marker: Option<&str>,
) -> (ProcessStatus, Option<String>) {
    if let Some(signal) = exit.signal {
        return (
            ProcessStatus::Crashed,
            Some(format!("terminated by signal {signal}")),
        );
    }
    match exit.code {
        Some(0) | None if crash_marker.is_some() => (
            ProcessStatus::Crashed,
            crash_marker.map(|m| format!("crash reported in output: {m}")),
        ),
        Some(0) => (ProcessStatus::Finished, None),
        Some(code) => (
            ProcessStatus::Crashed,
            Some(format!("exited with code {code}")),
        ),
        None if observed_running => (ProcessStatus::Finished, None),
        None => (
            ProcessStatus::Crashed,
            Some("exit status unavailable before startup was confirmed".to_owned()),
        ),
    }
}

fn match_crash_marker<'a>(line: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .map(String::as_str)
        .find(|marker| line.contains(marker))
}

fn apply(info: &mut LaunchedProcess, target: ProcessStatus, reason: Option<String>) {
    // A clean exit seen before the first poll still passes through Running.
    if info.status == ProcessStatus::Starting && target == ProcessStatus::Finished {
        apply(info, ProcessStatus::Running, None);
    }
    if !info.status.can_transition_to(target) {
        warn!(process = %info.id, from = %info.status, to = %target, "rejected process status transition");
        return;
    }
    debug!(process = %info.id, from = %info.status, to = %target, "process status transition");
    info.status = target;
    if target.is_terminal() {
        info!(
            process = %info.id,
            instance = %info.instance_id,
            pid = info.pid,
            status = %target,
            exit_code = ?info.exit_code,
            reason = reason.as_deref().unwrap_or(""),
            "game process ended"
        );
        info.status_reason = reason;
    }
}

/// Collect the exit status of a child that is already terminal.
fn reap(tracked: &mut TrackedProcess) {
    if let Some(child) = tracked.child.as_mut()
        && let Ok(Some(_)) = child.try_wait()
    {
        tracked.child = None;
    }
}

fn resolve_executable(executable: &Path, working_dir: &Path) -> Result<PathBuf> {
    let is_bare = executable.components().count() == 1 && !executable.is_absolute();
    let resolved = if is_bare {
        which::which(executable).map_err(|e| {
            debug!(exe = %executable.display(), "PATH lookup failed: {e}");
            LauncherError::MissingPath(executable.to_owned())
        })?
    } else if executable.is_relative() {
        working_dir.join(executable)
    } else {
        executable.to_owned()
    };
    if !resolved.is_file() {
        return Err(LauncherError::MissingPath(resolved));
    }
    Ok(crate::process::types::normalize(&resolved))
}
