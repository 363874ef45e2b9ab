//! Configuration types for the launcher core.

use crate::error::{LauncherError, Result};
use crate::update::release::{ReleaseChannel, ReleaseSettings, platform_asset_name};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level launcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Self-update settings.
    pub update: UpdateConfig,
    /// Artifact download settings.
    pub download: DownloadConfig,
    /// Game process supervision settings.
    pub process: ProcessConfig,
}

/// Self-update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Channel the user is subscribed to.
    pub channel: ReleaseChannel,
    /// Offer pre-releases from every channel.
    pub allow_prerelease: bool,
    /// Download and apply updates without asking.
    pub auto_update: bool,
    /// Check for updates when the launcher starts.
    pub check_on_startup: bool,
    /// Base URL of the GitHub API.
    pub api_base_url: String,
    /// Repository owner publishing launcher releases.
    pub repo_owner: String,
    /// Repository name publishing launcher releases.
    pub repo_name: String,
    /// Release asset to download (None = platform default).
    pub asset_name: Option<String>,
    /// User-Agent sent with every update request.
    pub user_agent: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            channel: ReleaseChannel::Stable,
            allow_prerelease: false,
            auto_update: false,
            check_on_startup: true,
            api_base_url: "https://api.github.com".to_owned(),
            repo_owner: "dilllxd".to_owned(),
            repo_name: "theboys-launcher".to_owned(),
            asset_name: None,
            user_agent: format!("TheBoysLauncher/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl UpdateConfig {
    /// The asset name to look for in each release.
    pub fn resolved_asset_name(&self) -> String {
        self.asset_name
            .clone()
            .unwrap_or_else(|| platform_asset_name().to_owned())
    }

    /// Selection policy derived from this config.
    pub fn release_settings(&self) -> ReleaseSettings {
        ReleaseSettings {
            channel: self.channel,
            allow_prerelease: self.allow_prerelease,
        }
    }
}

/// Download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Sliding window for the reported transfer speed, in milliseconds.
    pub speed_window_ms: u64,
    /// TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// User-Agent for artifact downloads.
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            speed_window_ms: 3_000,
            connect_timeout_secs: 15,
            user_agent: format!("TheBoysLauncher/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DownloadConfig {
    /// Speed window as a [`Duration`].
    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms.max(1))
    }
}

/// Game process supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Liveness poll interval, in milliseconds.
    pub poll_interval_ms: u64,
    /// Launcher process names swept by force-kill (case-insensitive, `.exe` optional).
    pub launcher_process_names: Vec<String>,
    /// Java runtime process names swept by force-kill.
    pub java_process_names: Vec<String>,
    /// Output lines that mark an abnormal game exit.
    pub crash_markers: Vec<String>,
    /// Lines of stdout/stderr kept per process.
    pub output_tail_lines: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            launcher_process_names: vec!["PrismLauncher".to_owned(), "prismlauncher".to_owned()],
            java_process_names: vec!["java".to_owned(), "javaw".to_owned()],
            crash_markers: vec![
                "---- Minecraft Crash Report ----".to_owned(),
                "A fatal error has been detected by the Java Runtime Environment".to_owned(),
                "Exception in thread \"main\"".to_owned(),
                "#@!@# Game crashed!".to_owned(),
            ],
            output_tail_lines: 200,
        }
    }
}

impl ProcessConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    /// Every process name the force-kill sweep may target.
    pub fn sweep_allowlist(&self) -> Vec<String> {
        self.launcher_process_names
            .iter()
            .chain(&self.java_process_names)
            .cloned()
            .collect()
    }
}

impl LauncherConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LauncherError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| LauncherError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config_dir>/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::launcher_dirs::config_dir().join("config.toml")
    }
}
