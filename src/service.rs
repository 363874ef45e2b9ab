//! The operations a launcher front end calls.
//!
//! [`LauncherService`] wires release checking, downloading and installing
//! together with the process supervisor and reaper. Every method returns a
//! snapshot or a [`LauncherError`] the caller can show directly.

use crate::config::LauncherConfig;
use crate::error::{LauncherError, Result};
use crate::process::{
    InstanceResolver, LaunchedProcess, ProcessInspector, ProcessReaper, ProcessSupervisor,
    create_inspector,
};
use crate::update::installer;
use crate::update::{
    DownloadId, DownloadProgress, DownloadSession, DownloadState, Downloader, GitHubReleaseFeed,
    InstallOutcome, ReleaseFeed, UpdateCandidate, UpdateInstaller, Version, select_update,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Update and process operations behind one handle.
pub struct LauncherService {
    config: LauncherConfig,
    current_version: Version,
    feed: Arc<dyn ReleaseFeed>,
    downloader: Downloader,
    installer: UpdateInstaller,
    pending: Mutex<HashMap<DownloadId, UpdateCandidate>>,
    supervisor: ProcessSupervisor,
    reaper: ProcessReaper,
    instances: Arc<dyn InstanceResolver>,
}

impl LauncherService {
    /// Service for the running launcher binary: GitHub releases, the real
    /// executable path and the platform process inspector.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP clients cannot be built or the running
    /// executable cannot be located.
    pub fn for_running_launcher(
        config: LauncherConfig,
        instances: Arc<dyn InstanceResolver>,
    ) -> Result<Self> {
        let feed = Arc::new(GitHubReleaseFeed::new(&config.update)?);
        let current_version = Version::parse(env!("CARGO_PKG_VERSION"))?;
        Self::new(
            config,
            current_version,
            feed,
            UpdateInstaller::for_current_exe()?,
            instances,
            create_inspector(),
        )
    }

    /// Assemble a service from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Network`] if the download client cannot be built.
    pub fn new(
        config: LauncherConfig,
        current_version: Version,
        feed: Arc<dyn ReleaseFeed>,
        installer: UpdateInstaller,
        instances: Arc<dyn InstanceResolver>,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Result<Self> {
        let downloader = Downloader::new(&config.download)?;
        let supervisor = ProcessSupervisor::new(&config.process);
        let reaper = ProcessReaper::new(
            supervisor.clone(),
            inspector,
            config.process.sweep_allowlist(),
        );
        Ok(Self {
            config,
            current_version,
            feed,
            downloader,
            installer,
            pending: Mutex::new(HashMap::new()),
            supervisor,
            reaper,
            instances,
        })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<DownloadId, UpdateCandidate>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Version of the running launcher.
    pub fn current_version(&self) -> &Version {
        &self.current_version
    }

    /// Settings the service was built with.
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Ask the release feed for a newer launcher on the configured channel.
    ///
    /// A published checksum is attached when it can be fetched; a failed
    /// checksum fetch only logs.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Network`] if the release index is unreachable.
    pub async fn check_for_updates(&self) -> Result<Option<UpdateCandidate>> {
        let releases = self.feed.fetch_releases().await?;
        let settings = self.config.update.release_settings();
        let Some(candidate) = select_update(&self.current_version, &releases, &settings) else {
            return Ok(None);
        };

        let Some(url) = candidate.checksum_url().map(str::to_owned) else {
            return Ok(Some(candidate));
        };
        match self.feed.fetch_checksum(&url).await {
            Ok(Some(digest)) => Ok(Some(candidate.with_checksum(digest))),
            Ok(None) => Ok(Some(candidate)),
            Err(e) => {
                warn!(version = %candidate.version(), "cannot fetch published checksum: {e}");
                Ok(Some(candidate))
            }
        }
    }

    /// Start downloading a candidate next to the running executable.
    ///
    /// # Errors
    ///
    /// [`LauncherError::AlreadyInProgress`] if the same artifact is already
    /// downloading, or any error from [`Downloader::start`].
    pub fn download_update(&self, candidate: &UpdateCandidate) -> Result<DownloadSession> {
        let session = self.downloader.start(
            candidate.download_url(),
            &self.installer.staging_path(),
            Some(candidate.artifact_size_bytes()),
        )?;
        self.pending()
            .insert(session.id.clone(), candidate.clone());
        Ok(session)
    }

    /// Progress of an update download.
    ///
    /// # Errors
    ///
    /// [`LauncherError::UnknownSession`] for an unknown id.
    pub fn get_update_progress(&self, id: &str) -> Result<DownloadProgress> {
        self.downloader.progress(id)
    }

    /// Pause an update download.
    ///
    /// # Errors
    ///
    /// See [`Downloader::pause`].
    pub async fn pause_update(&self, id: &str) -> Result<DownloadSession> {
        self.downloader.pause(id).await
    }

    /// Resume a paused update download.
    ///
    /// # Errors
    ///
    /// See [`Downloader::resume`].
    pub fn resume_update(&self, id: &str) -> Result<DownloadSession> {
        self.downloader.resume(id)
    }

    /// Verify a completed download and install it over the running binary.
    ///
    /// On success the new binary is already running in cleanup mode and the
    /// caller must exit.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::UnknownSession`] for an unknown id
    /// - [`LauncherError::InvalidState`] unless the download completed
    /// - [`LauncherError::VerificationFailed`] on a size or checksum mismatch
    /// - [`LauncherError::Install`] if the swap or relaunch fails
    pub fn apply_update(&self, id: &str) -> Result<InstallOutcome> {
        let session = self.downloader.session(id)?;
        if session.state != DownloadState::Completed {
            return Err(LauncherError::InvalidState(format!(
                "cannot install a {} download",
                session.state
            )));
        }
        let candidate = self
            .pending()
            .get(id)
            .cloned()
            .ok_or_else(|| LauncherError::UnknownSession(id.to_owned()))?;

        let artifact = &session.destination;
        if !installer::verify(artifact, candidate.artifact_size_bytes()) {
            return Err(LauncherError::VerificationFailed(format!(
                "{} is not {} bytes",
                artifact.display(),
                candidate.artifact_size_bytes()
            )));
        }
        match candidate.checksum_sha256() {
            Some(expected) => {
                if !installer::verify_checksum(artifact, expected)? {
                    return Err(LauncherError::VerificationFailed(format!(
                        "SHA-256 of {} does not match the published checksum",
                        artifact.display()
                    )));
                }
            }
            None => info!(version = %candidate.version(), "no checksum published, size verified only"),
        }

        let outcome = self.installer.install(artifact)?;
        self.pending().remove(id);
        if let Err(e) = self.downloader.remove_session(id) {
            warn!(download = %id, "cannot drop finished session: {e}");
        }
        info!(version = %candidate.version(), "update installed, exit required");
        Ok(outcome)
    }

    /// Cancel an update download and delete its partial file.
    ///
    /// # Errors
    ///
    /// [`LauncherError::UnknownSession`] for an unknown id.
    pub async fn cancel_update(&self, id: &str) -> Result<DownloadSession> {
        let session = self.downloader.cancel(id).await?;
        self.pending().remove(id);
        Ok(session)
    }

    /// Launch a game instance.
    ///
    /// # Errors
    ///
    /// [`LauncherError::LaunchFailed`] if the instance cannot be resolved or
    /// spawned, [`LauncherError::AlreadyInProgress`] if it is already running.
    pub fn launch_instance(&self, instance_id: &str) -> Result<LaunchedProcess> {
        let spec = self.instances.resolve(instance_id)?;
        self.supervisor.launch(spec)
    }

    /// Processes that have not ended yet.
    pub fn get_active_processes(&self) -> Vec<LaunchedProcess> {
        self.supervisor.active()
    }

    /// Every tracked process, including ended ones not yet cleaned up.
    pub fn get_processes(&self) -> Vec<LaunchedProcess> {
        self.supervisor.list()
    }

    /// Terminate a launched process and its descendants.
    ///
    /// # Errors
    ///
    /// See [`ProcessReaper::terminate`].
    pub fn terminate_process(&self, id: &str) -> Result<()> {
        self.reaper.terminate(id)
    }

    /// Kill every process belonging to an instance. Returns how many were killed.
    pub fn force_kill_instance(&self, instance_id: &str) -> usize {
        let root = self.instances.instance_root(instance_id);
        self.reaper.force_kill_by_instance(instance_id, root.as_deref())
    }

    /// Forget ended processes. Returns how many records were dropped.
    pub fn cleanup_finished_processes(&self) -> usize {
        self.supervisor.cleanup_finished()
    }

    /// Start the liveness poller. It stops when `cancel` fires.
    pub fn start_background(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.supervisor.spawn_poller(cancel)
    }
}
