//! Records and identities for launched game processes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier of a launched process record.
pub type ProcessId = String;

/// Lifecycle status of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Spawned, not yet confirmed alive by a poll.
    Starting,
    /// Confirmed alive.
    Running,
    /// Exited cleanly.
    Finished,
    /// Exited abnormally.
    Crashed,
    /// Terminated by the launcher.
    Killed,
}

impl ProcessStatus {
    /// Returns `true` if the status can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Crashed | Self::Killed)
    }

    /// Returns `true` if a transition from `self` to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Starting, Self::Running)
                | (Self::Starting, Self::Crashed)
                | (Self::Starting, Self::Killed)
                | (Self::Running, Self::Finished)
                | (Self::Running, Self::Crashed)
                | (Self::Running, Self::Killed)
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Crashed => "crashed",
            Self::Killed => "killed",
        };
        f.write_str(label)
    }
}

/// How to start a game instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Instance the process belongs to.
    pub instance_id: String,
    /// Program to run; bare names are looked up on `PATH`.
    pub executable: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub working_dir: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// The supervisor's record of a launched process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedProcess {
    /// Record id.
    pub id: ProcessId,
    /// Instance the process belongs to.
    pub instance_id: String,
    /// OS process id.
    pub pid: u32,
    /// Resolved executable, as spawned.
    pub executable_path: PathBuf,
    /// Working directory, as spawned.
    pub working_directory: PathBuf,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
    /// Current status.
    pub status: ProcessStatus,
    /// Exit code, once known.
    pub exit_code: Option<i32>,
    /// Why the process ended up in a terminal status.
    pub status_reason: Option<String>,
}

/// What the OS currently reports for a PID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessIdentity {
    /// OS process id.
    pub pid: u32,
    /// Parent process id, if known.
    pub parent_pid: Option<u32>,
    /// Short process name.
    pub name: String,
    /// Resolved executable path, if readable.
    pub executable: Option<PathBuf>,
    /// Working directory, if readable on this platform.
    pub working_dir: Option<PathBuf>,
    /// Full command line.
    pub command_line: Vec<String>,
}

/// Result of comparing a live process with what was expected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityVerdict {
    /// Same process.
    Match,
    /// The PID now belongs to something else (or cannot be confirmed).
    Mismatch(String),
}

impl ProcessIdentity {
    /// Check this identity against the recorded executable and working directory.
    ///
    /// The executable matches when the OS-resolved image is the recorded
    /// path, or when the recorded path is the program or first argument of
    /// the command line. The latter covers scripts, whose image is the
    /// interpreter. The working directory is only compared when both sides
    /// are known.
    pub fn verify(&self, expected_exe: &Path, expected_cwd: Option<&Path>) -> IdentityVerdict {
        let image_matches = self
            .executable
            .as_deref()
            .is_some_and(|exe| same_path(exe, expected_exe));
        if !image_matches && !self.invoked_as(expected_exe) {
            return IdentityVerdict::Mismatch(match &self.executable {
                Some(exe) => format!(
                    "executable is {}, expected {}",
                    exe.display(),
                    expected_exe.display()
                ),
                None => "executable path unavailable".to_owned(),
            });
        }
        if let (Some(cwd), Some(expected)) = (&self.working_dir, expected_cwd)
            && !same_path(cwd, expected)
        {
            return IdentityVerdict::Mismatch(format!(
                "working directory is {}, expected {}",
                cwd.display(),
                expected.display()
            ));
        }
        IdentityVerdict::Match
    }

    /// Whether `argv[0]` or `argv[1]` is `program` as an absolute path.
    fn invoked_as(&self, program: &Path) -> bool {
        self.command_line.iter().take(2).any(|arg| {
            let arg = Path::new(arg);
            arg.is_absolute() && same_path(arg, program)
        })
    }

    /// Whether the process name or executable file name is in `names`.
    ///
    /// Case-insensitive; a trailing `.exe` is ignored on both sides.
    pub fn name_matches(&self, names: &[String]) -> bool {
        let exe_name = self
            .executable
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned());
        let own = [Some(self.name.as_str()), exe_name.as_deref()];
        names.iter().any(|wanted| {
            let wanted = strip_exe(wanted);
            own.iter()
                .flatten()
                .any(|candidate| strip_exe(candidate) == wanted)
        })
    }

    /// Whether this process visibly belongs to an instance.
    ///
    /// True when its working directory or executable lies under `instance_root`,
    /// its command line mentions the root, or it was started with
    /// `--launch <instance_id>`.
    pub fn references_instance(&self, instance_id: &str, instance_root: Option<&Path>) -> bool {
        if let Some(root) = instance_root {
            let root = normalize(root);
            let under_root = |p: &Option<PathBuf>| {
                p.as_deref()
                    .is_some_and(|p| normalize(p).starts_with(&root))
            };
            if under_root(&self.working_dir) || under_root(&self.executable) {
                return true;
            }
            let root_str = root.to_string_lossy();
            if self.command_line.iter().any(|arg| arg.contains(root_str.as_ref())) {
                return true;
            }
        }
        self.command_line
            .windows(2)
            .any(|pair| matches!(pair[0].as_str(), "--launch" | "-l") && pair[1] == instance_id)
    }
}

fn strip_exe(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_owned(),
        None => lower,
    }
}

/// Canonical form of a path, or the path itself if it cannot be resolved.
pub fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}

/// Path equality after canonicalisation; case-insensitive on Windows.
pub fn same_path(a: &Path, b: &Path) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}
