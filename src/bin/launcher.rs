//! Launcher entry point.
//!
//! `launcher --cleanup-after-update <old> <new>` is the private mode the
//! updater relaunches into; it deletes the previous binary and exits.
//! Without it the binary runs a headless update check and, when
//! `update.auto_update` is set, downloads and installs the update.

use anyhow::Context;
use launcher_core::config::LauncherConfig;
use launcher_core::launcher_dirs;
use launcher_core::process::PrismInstanceResolver;
use launcher_core::update::{CLEANUP_FLAG, DownloadState, installer};
use launcher_core::LauncherService;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some(CLEANUP_FLAG) {
        return cleanup_after_update(&args[1..]);
    }

    let _guard = init_logging();
    match run_headless() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("launcher failed: {e:#}");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn cleanup_after_update(paths: &[String]) -> ExitCode {
    let [old, new] = paths else {
        println!("Failed to cleanup after update: expected {CLEANUP_FLAG} <old> <new>");
        return ExitCode::FAILURE;
    };
    match installer::run_cleanup(Path::new(old), Path::new(new)) {
        Ok(()) => {
            println!("Update cleanup completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("Failed to cleanup after update: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr and to a daily file under the log directory.
///
/// Falls back to stderr only when the log directory cannot be created.
fn init_logging() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("launcher_core=info,launcher=info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let log_dir = launcher_dirs::logs_dir();
    if std::fs::create_dir_all(&log_dir).is_err() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "launcher.log"));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}

#[tokio::main]
async fn run_headless() -> anyhow::Result<()> {
    let config_path = LauncherConfig::default_config_path();
    let config = LauncherConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let check_on_startup = config.update.check_on_startup;
    let auto_update = config.update.auto_update;

    let instances = Arc::new(PrismInstanceResolver::new(launcher_dirs::prism_dir()));
    let service = LauncherService::for_running_launcher(config, instances)
        .context("initialising launcher service")?;
    tracing::info!(version = %service.current_version(), "launcher starting");

    if !check_on_startup {
        tracing::info!("update check disabled");
        return Ok(());
    }

    let Some(candidate) = service
        .check_for_updates()
        .await
        .context("checking for updates")?
    else {
        println!("TheBoysLauncher {} is up to date", service.current_version());
        return Ok(());
    };
    println!(
        "Update available: {} -> {} ({})",
        service.current_version(),
        candidate.version(),
        candidate.channel()
    );
    if !auto_update {
        return Ok(());
    }

    let session = service
        .download_update(&candidate)
        .context("starting update download")?;
    loop {
        tokio::time::sleep(PROGRESS_INTERVAL).await;
        let progress = service.get_update_progress(&session.id)?;
        tracing::debug!(
            downloaded = progress.downloaded_bytes,
            total = ?progress.total_bytes,
            percent = ?progress.percent,
            "update download progress"
        );
        match progress.state {
            DownloadState::Completed => break,
            DownloadState::Failed | DownloadState::Cancelled => {
                anyhow::bail!(
                    "update download {}: {}",
                    progress.state,
                    progress.error.unwrap_or_default()
                );
            }
            _ => {}
        }
    }

    let outcome = service
        .apply_update(&session.id)
        .context("installing update")?;
    println!(
        "Updated to {}; restarting (pid {})",
        candidate.version(),
        outcome.relaunched_pid
    );
    Ok(())
}
