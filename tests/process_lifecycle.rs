//! Process supervision and termination with real child processes.
//!
//! Unix only: the children are `sh` and `sleep`.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use launcher_core::LauncherError;
use launcher_core::config::ProcessConfig;
use launcher_core::process::{
    LaunchSpec, LaunchedProcess, ProcessInspector, ProcessReaper, ProcessStatus,
    ProcessSupervisor, create_inspector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> ProcessConfig {
    ProcessConfig {
        poll_interval_ms: 50,
        ..ProcessConfig::default()
    }
}

fn spec(instance: &str, program: &str, args: &[&str]) -> LaunchSpec {
    LaunchSpec {
        instance_id: instance.to_owned(),
        executable: PathBuf::from(program),
        args: args.iter().map(|a| a.to_string()).collect(),
        working_dir: std::env::temp_dir(),
        env: vec![("THEBOYS_TEST".to_owned(), "1".to_owned())],
    }
}

fn reaper(supervisor: &ProcessSupervisor) -> (ProcessReaper, Arc<dyn ProcessInspector>) {
    let inspector = create_inspector();
    let reaper = ProcessReaper::new(
        supervisor.clone(),
        Arc::clone(&inspector),
        config().sweep_allowlist(),
    );
    (reaper, inspector)
}

/// Poll until the record is terminal.
async fn wait_terminal(supervisor: &ProcessSupervisor, id: &str) -> LaunchedProcess {
    for _ in 0..200 {
        supervisor.poll_once();
        let record = supervisor.get(id).unwrap();
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("process {id} never ended");
}

#[tokio::test]
async fn clean_exit_runs_then_finishes() {
    let supervisor = ProcessSupervisor::new(&config());
    let launched = supervisor
        .launch(spec("pack", "sh", &["-c", "sleep 1; exit 0"]))
        .unwrap();
    assert_eq!(launched.status, ProcessStatus::Starting);
    assert!(launched.pid > 0);
    assert!(launched.executable_path.is_absolute());

    supervisor.poll_once();
    assert_eq!(supervisor.status(&launched.id), Some(ProcessStatus::Running));
    assert_eq!(supervisor.active().len(), 1);

    let done = wait_terminal(&supervisor, &launched.id).await;
    assert_eq!(done.status, ProcessStatus::Finished);
    assert_eq!(done.exit_code, Some(0));
    assert!(supervisor.active().is_empty());
}

#[tokio::test]
async fn nonzero_exit_crashes() {
    let supervisor = ProcessSupervisor::new(&config());
    let launched = supervisor
        .launch(spec("pack", "sh", &["-c", "exit 3"]))
        .unwrap();
    let done = wait_terminal(&supervisor, &launched.id).await;
    assert_eq!(done.status, ProcessStatus::Crashed);
    assert_eq!(done.exit_code, Some(3));
    assert!(done.status_reason.unwrap().contains('3'));
}

#[tokio::test]
async fn crash_report_in_output_crashes() {
    let supervisor = ProcessSupervisor::new(&config());
    let launched = supervisor
        .launch(spec(
            "pack",
            "sh",
            &["-c", "echo 'loading'; echo '#@!@# Game crashed! Crash report saved'; sleep 0.3; exit 0"],
        ))
        .unwrap();
    let done = wait_terminal(&supervisor, &launched.id).await;
    assert_eq!(done.status, ProcessStatus::Crashed);
    assert_eq!(done.exit_code, Some(0));
    let tail = supervisor.output_tail(&launched.id);
    assert!(tail.iter().any(|l| l == "loading"), "{tail:?}");
}

#[tokio::test]
async fn crash_report_followed_by_long_output_crashes() {
    let supervisor = ProcessSupervisor::new(&config());
    let launched = supervisor
        .launch(spec(
            "pack",
            "sh",
            &["-c", "echo '---- Minecraft Crash Report ----'; seq 1 300; exit 0"],
        ))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let done = wait_terminal(&supervisor, &launched.id).await;
    assert_eq!(done.status, ProcessStatus::Crashed);
    assert!(done.status_reason.unwrap().contains("Minecraft Crash Report"));
    let tail = supervisor.output_tail(&launched.id);
    assert!(!tail.iter().any(|l| l.contains("Crash Report")), "marker left the tail");
}

#[tokio::test]
async fn terminate_kills_launcher_script() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("PrismLauncher");
    std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let supervisor = ProcessSupervisor::new(&config());
    let (reaper, inspector) = reaper(&supervisor);
    let launched = supervisor
        .launch(spec("pack", script.to_str().unwrap(), &[]))
        .unwrap();
    supervisor.poll_once();
    assert_eq!(supervisor.status(&launched.id), Some(ProcessStatus::Running));

    reaper.terminate(&launched.id).unwrap();
    assert_eq!(supervisor.status(&launched.id), Some(ProcessStatus::Killed));
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.poll_once();
    assert!(inspector.resolve_identity(launched.pid).is_none());
}

#[tokio::test]
async fn duplicate_launch_is_rejected_until_exit() {
    let supervisor = ProcessSupervisor::new(&config());
    let (reaper, _) = reaper(&supervisor);
    let first = supervisor.launch(spec("pack", "sleep", &["30"])).unwrap();

    assert!(matches!(
        supervisor.launch(spec("pack", "sleep", &["30"])),
        Err(LauncherError::AlreadyInProgress(_))
    ));
    let other = supervisor.launch(spec("other", "sleep", &["30"])).unwrap();

    reaper.terminate(&first.id).unwrap();
    reaper.terminate(&other.id).unwrap();
    let again = supervisor.launch(spec("pack", "sh", &["-c", "exit 0"])).unwrap();
    wait_terminal(&supervisor, &again.id).await;
}

#[tokio::test]
async fn missing_executable_fails_launch() {
    let supervisor = ProcessSupervisor::new(&config());
    let err = supervisor
        .launch(spec("pack", "/nonexistent/PrismLauncher", &[]))
        .unwrap_err();
    assert!(matches!(err, LauncherError::LaunchFailed { .. }), "{err}");
    assert!(supervisor.list().is_empty());

    // The failed attempt does not block the instance.
    let ok = supervisor.launch(spec("pack", "sh", &["-c", "exit 0"])).unwrap();
    wait_terminal(&supervisor, &ok.id).await;
}

#[tokio::test]
async fn terminate_kills_and_is_idempotent() {
    let supervisor = ProcessSupervisor::new(&config());
    let (reaper, inspector) = reaper(&supervisor);
    let launched = supervisor.launch(spec("pack", "sleep", &["30"])).unwrap();
    supervisor.poll_once();

    reaper.terminate(&launched.id).unwrap();
    let record = supervisor.get(&launched.id).unwrap();
    assert_eq!(record.status, ProcessStatus::Killed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.poll_once();
    assert!(inspector.resolve_identity(launched.pid).is_none());
    assert_eq!(supervisor.status(&launched.id), Some(ProcessStatus::Killed));

    reaper.terminate(&launched.id).unwrap();
    assert!(matches!(
        reaper.terminate("proc-unknown"),
        Err(LauncherError::UnknownProcess(_))
    ));
}

#[tokio::test]
async fn terminate_takes_down_children() {
    let supervisor = ProcessSupervisor::new(&config());
    let (reaper, inspector) = reaper(&supervisor);
    let launched = supervisor
        .launch(spec("pack", "sh", &["-c", "sleep 300 & wait"]))
        .unwrap();

    let mut children = Vec::new();
    for _ in 0..40 {
        children = inspector.children(launched.pid);
        if !children.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!children.is_empty(), "shell never forked");

    reaper.terminate(&launched.id).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for child in children {
        assert!(inspector.resolve_identity(child).is_none(), "child {child} survived");
    }
    assert_eq!(supervisor.status(&launched.id), Some(ProcessStatus::Killed));
}

#[tokio::test]
async fn cleanup_drops_only_ended_records() {
    let supervisor = ProcessSupervisor::new(&config());
    let (reaper, _) = reaper(&supervisor);
    let done = supervisor.launch(spec("a", "sh", &["-c", "exit 0"])).unwrap();
    let live = supervisor.launch(spec("b", "sleep", &["30"])).unwrap();
    wait_terminal(&supervisor, &done.id).await;

    assert_eq!(supervisor.cleanup_finished(), 1);
    assert!(supervisor.get(&done.id).is_none());
    assert!(supervisor.get(&live.id).is_some());
    assert_eq!(supervisor.cleanup_finished(), 0);

    reaper.terminate(&live.id).unwrap();
    assert_eq!(supervisor.cleanup_finished(), 1);
    assert!(supervisor.list().is_empty());
}

#[tokio::test]
async fn background_poller_observes_exit() {
    let supervisor = ProcessSupervisor::new(&config());
    let cancel = CancellationToken::new();
    let poller = supervisor.spawn_poller(cancel.clone());

    let launched = supervisor
        .launch(spec("pack", "sh", &["-c", "sleep 0.2; exit 0"]))
        .unwrap();
    let mut status = ProcessStatus::Starting;
    for _ in 0..100 {
        status = supervisor.status(&launched.id).unwrap();
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, ProcessStatus::Finished);

    cancel.cancel();
    poller.await.unwrap();
}

#[tokio::test]
async fn force_kill_by_instance_ends_tracked_processes() {
    let supervisor = ProcessSupervisor::new(&config());
    let (reaper, _) = reaper(&supervisor);
    let mine = supervisor.launch(spec("pack", "sleep", &["30"])).unwrap();
    let theirs = supervisor.launch(spec("other", "sleep", &["30"])).unwrap();

    let killed = reaper.force_kill_by_instance("pack", None);
    assert!(killed >= 1);
    assert_eq!(supervisor.status(&mine.id), Some(ProcessStatus::Killed));
    assert!(!supervisor.status(&theirs.id).unwrap().is_terminal());

    reaper.terminate(&theirs.id).unwrap();
}
