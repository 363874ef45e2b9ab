//! Launcher core: self-update and game process lifecycle for a modpack launcher.
//!
//! # Architecture
//!
//! Two independent subsystems share one error type and one config file:
//! - **Update**: release index → channel-aware selection → resumable download
//!   → verified atomic binary swap → relaunch into cleanup mode
//! - **Process**: launch an instance → poll liveness → terminate whole
//!   process trees, checking every PID against what was launched
//!
//! [`LauncherService`] exposes both to a front end.

pub mod config;
pub mod error;
pub mod launcher_dirs;
pub mod process;
pub mod service;
pub mod update;

pub use config::LauncherConfig;
pub use error::{LauncherError, Result};
pub use process::{LaunchedProcess, ProcessStatus};
pub use service::LauncherService;
pub use update::{DownloadProgress, DownloadState, InstallOutcome, UpdateCandidate, Version};
