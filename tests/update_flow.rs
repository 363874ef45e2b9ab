//! End-to-end self-update through `LauncherService`.
//!
//! A mock GitHub releases API serves the index, the artifact and its
//! checksum side-car. The installer swaps a fake executable in a temp
//! directory and records the relaunch instead of spawning it.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use launcher_core::config::LauncherConfig;
use launcher_core::process::{PrismInstanceResolver, create_inspector};
use launcher_core::update::{
    CLEANUP_FLAG, DownloadState, GitHubReleaseFeed, ReleaseChannel, UpdateInstaller, Version,
    installer,
};
use launcher_core::{LauncherError, LauncherService};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ASSET: &str = "TheBoysLauncher-linux";

fn artifact() -> Vec<u8> {
    b"#!/bin/sh\necho 'TheBoysLauncher 0.5.0'\n".repeat(64)
}

type Relaunches = Arc<Mutex<Vec<(PathBuf, Vec<OsString>)>>>;

struct Fixture {
    server: MockServer,
    _dir: tempfile::TempDir,
    exe: PathBuf,
    relaunches: Relaunches,
    service: LauncherService,
}

async fn fixture(checksum: Option<String>) -> Fixture {
    let server = MockServer::start().await;
    let body = artifact();
    let base = server.uri();

    let mut assets = vec![json!({
        "name": ASSET,
        "browser_download_url": format!("{base}/dl/v0.5.0/{ASSET}"),
        "size": body.len(),
    })];
    if let Some(digest) = &checksum {
        assets.push(json!({
            "name": format!("{ASSET}.sha256"),
            "browser_download_url": format!("{base}/dl/v0.5.0/{ASSET}.sha256"),
            "size": 64,
        }));
        Mock::given(method("GET"))
            .and(path(format!("/dl/v0.5.0/{ASSET}.sha256")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("{digest}  {ASSET}\n")))
            .mount(&server)
            .await;
    }
    let releases = json!([
        {
            "tag_name": "v0.5.0",
            "body": "Faster modpack sync",
            "prerelease": false,
            "draft": false,
            "published_at": "2026-09-01T12:00:00Z",
            "assets": assets,
        },
        {
            "tag_name": "v0.6.0-beta.1",
            "prerelease": true,
            "draft": false,
            "published_at": "2026-09-20T12:00:00Z",
            "assets": [{
                "name": ASSET,
                "browser_download_url": format!("{base}/dl/v0.6.0-beta.1/{ASSET}"),
                "size": 1,
            }],
        },
        {
            "tag_name": "v0.4.0",
            "prerelease": false,
            "draft": false,
            "published_at": "2026-06-01T12:00:00Z",
            "assets": [],
        },
    ]);
    Mock::given(method("GET"))
        .and(path("/repos/dilllxd/theboys-launcher/releases"))
        .respond_with(ResponseTemplate::new(200).set_body_json(releases))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/dl/v0.5.0/{ASSET}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("TheBoysLauncher");
    std::fs::write(&exe, b"old launcher").unwrap();

    let relaunches: Relaunches = Arc::default();
    let recorder = Arc::clone(&relaunches);
    let installer = UpdateInstaller::new(exe.clone()).with_relauncher(Box::new(
        move |program: &Path, args: &[OsString]| {
            recorder
                .lock()
                .unwrap()
                .push((program.to_owned(), args.to_vec()));
            Ok(4242)
        },
    ));

    let mut config = LauncherConfig::default();
    config.update.api_base_url = base;
    config.update.asset_name = Some(ASSET.to_owned());
    let feed = Arc::new(GitHubReleaseFeed::new(&config.update).unwrap());
    let instances = Arc::new(PrismInstanceResolver::new(dir.path().join("prism")));
    let service = LauncherService::new(
        config,
        Version::parse("0.4.0").unwrap(),
        feed,
        installer,
        instances,
        create_inspector(),
    )
    .unwrap();

    Fixture {
        server,
        _dir: dir,
        exe,
        relaunches,
        service,
    }
}

fn sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

async fn wait_for_download(service: &LauncherService, id: &str) -> DownloadState {
    for _ in 0..400 {
        let progress = service.get_update_progress(id).unwrap();
        if progress.state.is_terminal() {
            return progress.state;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("download {id} did not finish");
}

#[tokio::test]
async fn stable_channel_update_installs_and_relaunches() {
    let fx = fixture(Some(sha256(&artifact()))).await;

    let candidate = fx.service.check_for_updates().await.unwrap().unwrap();
    assert_eq!(candidate.version(), &Version::parse("0.5.0").unwrap());
    assert_eq!(candidate.channel(), ReleaseChannel::Stable);
    assert!(!candidate.is_prerelease());
    assert_eq!(candidate.checksum_sha256(), Some(sha256(&artifact()).as_str()));

    let session = fx.service.download_update(&candidate).unwrap();
    assert_eq!(
        wait_for_download(&fx.service, &session.id).await,
        DownloadState::Completed
    );
    let progress = fx.service.get_update_progress(&session.id).unwrap();
    assert_eq!(progress.percent, Some(100.0));

    let outcome = fx.service.apply_update(&session.id).unwrap();
    assert_eq!(outcome.installed, fx.exe);
    assert_eq!(outcome.relaunched_pid, 4242);
    assert_eq!(std::fs::read(&fx.exe).unwrap(), artifact());
    assert_eq!(std::fs::read(&outcome.backup).unwrap(), b"old launcher");

    let relaunches = fx.relaunches.lock().unwrap().clone();
    assert_eq!(relaunches.len(), 1);
    let (program, args) = &relaunches[0];
    assert_eq!(program, &fx.exe);
    assert_eq!(
        args,
        &vec![
            OsString::from(CLEANUP_FLAG),
            outcome.backup.clone().into_os_string(),
            fx.exe.clone().into_os_string(),
        ]
    );

    // What the relaunched binary does first.
    installer::run_cleanup(&outcome.backup, &fx.exe).unwrap();
    assert!(!outcome.backup.exists());
    assert!(fx.exe.exists());

    // The session is finalized by the install.
    assert!(matches!(
        fx.service.get_update_progress(&session.id),
        Err(LauncherError::UnknownSession(_))
    ));
    drop(fx.server);
}

#[tokio::test]
async fn beta_channel_sees_prerelease() {
    let mut fx = fixture(None).await;
    let mut config = fx.service.config().clone();
    config.update.channel = ReleaseChannel::Beta;
    let feed = Arc::new(GitHubReleaseFeed::new(&config.update).unwrap());
    fx.service = LauncherService::new(
        config,
        Version::parse("0.4.0").unwrap(),
        feed,
        UpdateInstaller::new(fx.exe.clone()),
        Arc::new(PrismInstanceResolver::new("/nonexistent")),
        create_inspector(),
    )
    .unwrap();

    let candidate = fx.service.check_for_updates().await.unwrap().unwrap();
    assert_eq!(candidate.version(), &Version::parse("0.6.0-beta.1").unwrap());
    assert_eq!(candidate.channel(), ReleaseChannel::Beta);
    assert!(candidate.is_prerelease());
}

#[tokio::test]
async fn checksum_mismatch_blocks_install() {
    let fx = fixture(Some("0".repeat(64))).await;

    let candidate = fx.service.check_for_updates().await.unwrap().unwrap();
    let session = fx.service.download_update(&candidate).unwrap();
    assert_eq!(
        wait_for_download(&fx.service, &session.id).await,
        DownloadState::Completed
    );

    let err = fx.service.apply_update(&session.id).unwrap_err();
    assert!(matches!(err, LauncherError::VerificationFailed(_)), "{err}");
    assert_eq!(std::fs::read(&fx.exe).unwrap(), b"old launcher");
    assert!(fx.relaunches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_checksum_installs_on_size_alone() {
    let fx = fixture(None).await;

    let candidate = fx.service.check_for_updates().await.unwrap().unwrap();
    assert!(candidate.checksum_sha256().is_none());
    let session = fx.service.download_update(&candidate).unwrap();
    wait_for_download(&fx.service, &session.id).await;

    fx.service.apply_update(&session.id).unwrap();
    assert_eq!(std::fs::read(&fx.exe).unwrap(), artifact());
}

#[tokio::test]
async fn apply_requires_completed_download() {
    let fx = fixture(None).await;
    assert!(matches!(
        fx.service.apply_update("dl-missing"),
        Err(LauncherError::UnknownSession(_))
    ));

    let candidate = fx.service.check_for_updates().await.unwrap().unwrap();
    let session = fx.service.download_update(&candidate).unwrap();
    let cancelled = fx.service.cancel_update(&session.id).await.unwrap();
    if cancelled.state == DownloadState::Cancelled {
        assert!(matches!(
            fx.service.apply_update(&session.id),
            Err(LauncherError::InvalidState(_))
        ));
    }
    assert_eq!(std::fs::read(&fx.exe).unwrap(), b"old launcher");
}

#[tokio::test]
async fn up_to_date_launcher_gets_nothing() {
    let fx = fixture(None).await;
    let mut config = fx.service.config().clone();
    config.update.channel = ReleaseChannel::Stable;
    let service = LauncherService::new(
        config.clone(),
        Version::parse("0.5.0").unwrap(),
        Arc::new(GitHubReleaseFeed::new(&config.update).unwrap()),
        UpdateInstaller::new(fx.exe.clone()),
        Arc::new(PrismInstanceResolver::new("/nonexistent")),
        create_inspector(),
    )
    .unwrap();
    assert!(service.check_for_updates().await.unwrap().is_none());
}
