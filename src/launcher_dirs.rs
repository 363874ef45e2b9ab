//! Application directory paths for the launcher.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `LAUNCHER_DATA_DIR`: overrides [`data_dir`]
//! - `LAUNCHER_CONFIG_DIR`: overrides [`config_dir`]
//! - `LAUNCHER_LOG_DIR`: overrides [`logs_dir`]

use std::path::PathBuf;

const APP_DIR_NAME: &str = "theboys-launcher";

/// Application data root directory.
///
/// Resolves to `dirs::data_dir()/theboys-launcher/` by default.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LAUNCHER_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join("theboys-launcher-data"))
}

/// Application config directory (holds `config.toml`).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LAUNCHER_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join("theboys-launcher-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LAUNCHER_LOG_DIR") {
        return PathBuf::from(override_dir);
    }
    data_dir().join("logs")
}

/// Portable Prism Launcher install (`data_dir()/prism/`).
#[must_use]
pub fn prism_dir() -> PathBuf {
    data_dir().join("prism")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_live_under_data_dir_by_default() {
        if std::env::var_os("LAUNCHER_LOG_DIR").is_none() {
            assert!(logs_dir().starts_with(data_dir()));
        }
    }

    #[test]
    fn config_dir_is_absolute() {
        assert!(config_dir().is_absolute());
    }
}
