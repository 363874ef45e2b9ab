//! Turning an instance id into a launch command.

use crate::error::{LauncherError, Result};
use crate::process::types::LaunchSpec;
use std::path::{Path, PathBuf};

/// Resolves instance ids to launch commands.
pub trait InstanceResolver: Send + Sync {
    /// Build the command that starts `instance_id`.
    ///
    /// # Errors
    ///
    /// [`LauncherError::LaunchFailed`] if the instance is unknown or invalid.
    fn resolve(&self, instance_id: &str) -> Result<LaunchSpec>;

    /// Directory holding the instance's files, used to scope the kill sweep.
    fn instance_root(&self, instance_id: &str) -> Option<PathBuf>;
}

/// Launches instances through a portable Prism Launcher install.
///
/// Prism is started as `<exe> --dir . --launch <instance>` from its own
/// directory, with `JAVA_HOME` pointing at the bundled runtime when known.
#[derive(Debug, Clone)]
pub struct PrismInstanceResolver {
    prism_dir: PathBuf,
    executable: PathBuf,
    java_home: Option<PathBuf>,
}

impl PrismInstanceResolver {
    /// Resolver for a Prism install rooted at `prism_dir`, using the
    /// platform's default executable location.
    pub fn new(prism_dir: impl Into<PathBuf>) -> Self {
        let prism_dir = prism_dir.into();
        let executable = default_executable(&prism_dir);
        Self {
            prism_dir,
            executable,
            java_home: None,
        }
    }

    /// Override the Prism executable.
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Java runtime exported as `JAVA_HOME` to Prism.
    pub fn with_java_home(mut self, java_home: impl Into<PathBuf>) -> Self {
        self.java_home = Some(java_home.into());
        self
    }

    fn instances_dir(&self) -> PathBuf {
        self.prism_dir.join("instances")
    }
}

impl InstanceResolver for PrismInstanceResolver {
    fn resolve(&self, instance_id: &str) -> Result<LaunchSpec> {
        let failed = |reason: String| LauncherError::LaunchFailed {
            instance_id: instance_id.to_owned(),
            reason,
        };
        if !is_valid_instance_id(instance_id) {
            return Err(failed("invalid instance id".to_owned()));
        }
        let instance_dir = self.instances_dir().join(instance_id);
        if !instance_dir.is_dir() {
            return Err(failed(format!(
                "instance directory {} does not exist",
                instance_dir.display()
            )));
        }

        let mut env = Vec::new();
        if let Some(java_home) = &self.java_home {
            env.push((
                "JAVA_HOME".to_owned(),
                java_home.to_string_lossy().into_owned(),
            ));
        }
        Ok(LaunchSpec {
            instance_id: instance_id.to_owned(),
            executable: self.executable.clone(),
            args: vec![
                "--dir".to_owned(),
                ".".to_owned(),
                "--launch".to_owned(),
                instance_id.to_owned(),
            ],
            working_dir: self.prism_dir.clone(),
            env,
        })
    }

    fn instance_root(&self, instance_id: &str) -> Option<PathBuf> {
        is_valid_instance_id(instance_id).then(|| self.instances_dir().join(instance_id))
    }
}

fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.contains(['/', '\\'])
}

fn default_executable(prism_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        prism_dir.join("PrismLauncher.exe")
    } else if cfg!(target_os = "macos") {
        prism_dir
            .join("PrismLauncher.app")
            .join("Contents")
            .join("MacOS")
            .join("PrismLauncher")
    } else {
        prism_dir.join("PrismLauncher")
    }
}
