//! Resumable artifact downloads.
//!
//! Each [`DownloadSession`] streams into a `.part` file next to its
//! destination and is renamed into place only after the received length has
//! been checked. Transfers run as background tokio tasks; the [`Downloader`]
//! owns every session and hands out cloned snapshots.
//!
//! Pausing drops the connection but keeps the partial file. Resuming asks the
//! server for the remaining bytes with a `Range` request and falls back to a
//! full restart when the server ignores it.

use crate::config::DownloadConfig;
use crate::error::{LauncherError, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifier of a download session.
pub type DownloadId = String;

/// Lifecycle state of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// Created, transfer not yet started.
    Pending,
    /// Bytes are being received.
    Downloading,
    /// Transfer stopped; partial file kept for resumption.
    Paused,
    /// Artifact verified for length and moved to its destination.
    Completed,
    /// Transfer failed; partial file removed.
    Failed,
    /// Cancelled by the user; partial file removed.
    Cancelled,
}

impl DownloadState {
    /// Returns `true` for states no transition leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if a transition from `self` to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Downloading)
                | (Self::Pending, Self::Cancelled)
                | (Self::Downloading, Self::Paused)
                | (Self::Downloading, Self::Completed)
                | (Self::Downloading, Self::Failed)
                | (Self::Downloading, Self::Cancelled)
                | (Self::Paused, Self::Downloading)
                | (Self::Paused, Self::Cancelled)
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Snapshot of a download session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSession {
    /// Session id.
    pub id: DownloadId,
    /// Source URL.
    pub url: String,
    /// Final artifact path.
    pub destination: PathBuf,
    /// Partial file the transfer writes into.
    pub temp_path: PathBuf,
    /// Total size, once known from the response or the caller.
    pub total_bytes: Option<u64>,
    /// Bytes written to the partial file.
    pub downloaded_bytes: u64,
    /// Current state.
    pub state: DownloadState,
    /// Failure message for [`DownloadState::Failed`].
    pub error: Option<String>,
}

/// Progress report for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    /// Session id.
    pub id: DownloadId,
    /// Current state.
    pub state: DownloadState,
    /// Bytes received so far.
    pub downloaded_bytes: u64,
    /// Total size, if known.
    pub total_bytes: Option<u64>,
    /// Completion percentage, if the total is known.
    pub percent: Option<f64>,
    /// Windowed average transfer speed.
    pub speed_bytes_per_sec: f64,
    /// Estimated time remaining; `None` when stalled or the total is unknown.
    pub eta: Option<Duration>,
    /// Failure message, if any.
    pub error: Option<String>,
}

/// Sliding-window transfer speed estimator.
///
/// Keeps cumulative byte counts sampled over the last `window`, plus one
/// sample just before it as a baseline.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    /// Create an empty meter averaging over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the cumulative byte count observed at `at`.
    pub fn record(&mut self, at: Instant, total_bytes: u64) {
        self.samples.push_back((at, total_bytes));
        if let Some(cutoff) = at.checked_sub(self.window) {
            while self.samples.len() > 2 && self.samples[1].0 <= cutoff {
                self.samples.pop_front();
            }
        }
    }

    /// Forget all samples (after a pause or a restart from zero).
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Average speed in bytes per second as seen at `now`.
    ///
    /// Drops to zero once no sample has arrived for a whole window.
    pub fn bytes_per_sec(&self, now: Instant) -> f64 {
        let (Some(&(first_at, first_bytes)), Some(&(last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        if now.saturating_duration_since(last_at) > self.window {
            return 0.0;
        }
        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        last_bytes.saturating_sub(first_bytes) as f64 / elapsed
    }
}

struct RunningTransfer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionEntry {
    session: DownloadSession,
    meter: SpeedMeter,
    expected_size: Option<u64>,
    transfer: Option<RunningTransfer>,
}

struct Registry {
    sessions: Mutex<HashMap<DownloadId, SessionEntry>>,
    speed_window: Duration,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<DownloadId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owns and drives every download session.
///
/// Cloning is cheap and shares the same session table. Methods that start a
/// transfer must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    registry: Arc<Registry>,
}

impl Downloader {
    /// Build a downloader with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config.speed_window()))
    }

    /// Build a downloader around an existing client.
    pub fn with_client(client: reqwest::Client, speed_window: Duration) -> Self {
        Self {
            client,
            registry: Arc::new(Registry {
                sessions: Mutex::new(HashMap::new()),
                speed_window,
            }),
        }
    }

    /// Start downloading `url` into `destination`.
    ///
    /// `expected_size` is checked against the server's reported length and
    /// the final file length.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::AlreadyInProgress`] if `url` already has a live session
    /// - [`LauncherError::Network`] for an unparsable URL
    /// - [`LauncherError::Download`] if the destination directory cannot be created
    pub fn start(
        &self,
        url: &str,
        destination: &Path,
        expected_size: Option<u64>,
    ) -> Result<DownloadSession> {
        url::Url::parse(url)
            .map_err(|e| LauncherError::Network(format!("invalid download url {url}: {e}")))?;
        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                LauncherError::Download(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let mut sessions = self.registry.lock();
        if let Some(existing) = sessions
            .values()
            .find(|e| e.session.url == url && !e.session.state.is_terminal())
        {
            return Err(LauncherError::AlreadyInProgress(format!(
                "download of {url} ({})",
                existing.session.id
            )));
        }

        let id = format!("dl-{}", uuid::Uuid::new_v4());
        let temp_path = part_path(destination, &id);
        let session = DownloadSession {
            id: id.clone(),
            url: url.to_owned(),
            destination: destination.to_owned(),
            temp_path,
            total_bytes: expected_size,
            downloaded_bytes: 0,
            state: DownloadState::Pending,
            error: None,
        };
        let mut entry = SessionEntry {
            session,
            meter: SpeedMeter::new(self.registry.speed_window),
            expected_size,
            transfer: None,
        };

        entry.transfer = Some(self.spawn_transfer(&entry, 0));
        transition(&mut entry.session, DownloadState::Downloading);
        info!(download = %id, url, dest = %destination.display(), "download started");

        let snapshot = entry.session.clone();
        sessions.insert(id, entry);
        Ok(snapshot)
    }

    /// Stop an active transfer, keeping the partial file.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::UnknownSession`] for an unknown id
    /// - [`LauncherError::InvalidState`] unless the session is downloading
    pub async fn pause(&self, id: &str) -> Result<DownloadSession> {
        let running = {
            let mut sessions = self.registry.lock();
            let entry = lookup(&mut sessions, id)?;
            if entry.session.state != DownloadState::Downloading {
                return Err(LauncherError::InvalidState(format!(
                    "cannot pause a {} download",
                    entry.session.state
                )));
            }
            entry.transfer.take()
        };
        stop(running).await;

        let mut sessions = self.registry.lock();
        let entry = lookup(&mut sessions, id)?;
        if entry.session.state == DownloadState::Downloading {
            transition(&mut entry.session, DownloadState::Paused);
            entry.meter.reset();
            info!(download = %id, bytes = entry.session.downloaded_bytes, "download paused");
        }
        Ok(entry.session.clone())
    }

    /// Continue a paused transfer from the partial file's length.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::UnknownSession`] for an unknown id
    /// - [`LauncherError::InvalidState`] unless the session is paused
    pub fn resume(&self, id: &str) -> Result<DownloadSession> {
        let mut sessions = self.registry.lock();
        let entry = lookup(&mut sessions, id)?;
        if entry.session.state != DownloadState::Paused {
            return Err(LauncherError::InvalidState(format!(
                "cannot resume a {} download",
                entry.session.state
            )));
        }

        let offset = std::fs::metadata(&entry.session.temp_path)
            .map(|m| m.len())
            .unwrap_or(0);
        entry.session.downloaded_bytes = offset;
        entry.transfer = Some(self.spawn_transfer(entry, offset));
        transition(&mut entry.session, DownloadState::Downloading);
        info!(download = %id, offset, "download resumed");
        Ok(entry.session.clone())
    }

    /// Abort a session and delete its partial file.
    ///
    /// Cancelling a session that already reached a terminal state is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::UnknownSession`] for an unknown id.
    pub async fn cancel(&self, id: &str) -> Result<DownloadSession> {
        let running = {
            let mut sessions = self.registry.lock();
            let entry = lookup(&mut sessions, id)?;
            if entry.session.state.is_terminal() {
                debug!(download = %id, state = %entry.session.state, "cancel ignored");
                return Ok(entry.session.clone());
            }
            entry.transfer.take()
        };
        stop(running).await;

        let mut sessions = self.registry.lock();
        let entry = lookup(&mut sessions, id)?;
        if !entry.session.state.is_terminal() {
            remove_partial(&entry.session.temp_path);
            transition(&mut entry.session, DownloadState::Cancelled);
            entry.meter.reset();
            info!(download = %id, "download cancelled");
        }
        Ok(entry.session.clone())
    }

    /// Current progress of a session.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::UnknownSession`] for an unknown id.
    pub fn progress(&self, id: &str) -> Result<DownloadProgress> {
        let mut sessions = self.registry.lock();
        let entry = lookup(&mut sessions, id)?;
        Ok(progress_of(entry, Instant::now()))
    }

    /// Snapshot of a session.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::UnknownSession`] for an unknown id.
    pub fn session(&self, id: &str) -> Result<DownloadSession> {
        let mut sessions = self.registry.lock();
        Ok(lookup(&mut sessions, id)?.session.clone())
    }

    /// Snapshots of every session.
    pub fn sessions(&self) -> Vec<DownloadSession> {
        self.registry
            .lock()
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    /// Drop a finished session from the table.
    ///
    /// # Errors
    ///
    /// - [`LauncherError::UnknownSession`] for an unknown id
    /// - [`LauncherError::InvalidState`] while the session is still live
    pub fn remove_session(&self, id: &str) -> Result<DownloadSession> {
        let mut sessions = self.registry.lock();
        let state = lookup(&mut sessions, id)?.session.state;
        if !state.is_terminal() {
            return Err(LauncherError::InvalidState(format!(
                "cannot remove a {state} download"
            )));
        }
        sessions
            .remove(id)
            .map(|e| e.session)
            .ok_or_else(|| LauncherError::UnknownSession(id.to_owned()))
    }

    /// Remove every terminal session, returning how many were dropped.
    pub fn cleanup_finished(&self) -> usize {
        let mut sessions = self.registry.lock();
        let before = sessions.len();
        sessions.retain(|_, e| !e.session.state.is_terminal());
        before - sessions.len()
    }

    fn spawn_transfer(&self, entry: &SessionEntry, offset: u64) -> RunningTransfer {
        let cancel = CancellationToken::new();
        let transfer = Transfer {
            client: self.client.clone(),
            registry: Arc::clone(&self.registry),
            id: entry.session.id.clone(),
            url: entry.session.url.clone(),
            temp_path: entry.session.temp_path.clone(),
            destination: entry.session.destination.clone(),
            expected_size: entry.expected_size,
        };
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let outcome = transfer.run(&token, offset).await;
            transfer.finish(outcome);
        });
        RunningTransfer { cancel, handle }
    }
}

fn lookup<'a>(
    sessions: &'a mut HashMap<DownloadId, SessionEntry>,
    id: &str,
) -> Result<&'a mut SessionEntry> {
    sessions
        .get_mut(id)
        .ok_or_else(|| LauncherError::UnknownSession(id.to_owned()))
}

fn transition(session: &mut DownloadSession, to: DownloadState) {
    if session.state.can_transition_to(to) {
        debug!(download = %session.id, from = %session.state, to = %to, "download state transition");
        session.state = to;
    } else {
        warn!(download = %session.id, from = %session.state, to = %to, "rejected download state transition");
    }
}

async fn stop(running: Option<RunningTransfer>) {
    if let Some(running) = running {
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            warn!("download task ended abnormally: {e}");
        }
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "cannot remove partial download: {e}"),
    }
}

fn progress_of(entry: &SessionEntry, now: Instant) -> DownloadProgress {
    let session = &entry.session;
    let speed = if session.state == DownloadState::Downloading {
        entry.meter.bytes_per_sec(now)
    } else {
        0.0
    };
    let percent = session.total_bytes.map(|total| {
        if total == 0 {
            100.0
        } else {
            (session.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0)
        }
    });
    let eta = match session.total_bytes {
        Some(total) if speed > 0.0 => {
            let remaining = total.saturating_sub(session.downloaded_bytes) as f64;
            Some(Duration::from_secs_f64(remaining / speed))
        }
        _ => None,
    };
    DownloadProgress {
        id: session.id.clone(),
        state: session.state,
        downloaded_bytes: session.downloaded_bytes,
        total_bytes: session.total_bytes,
        percent,
        speed_bytes_per_sec: speed,
        eta,
        error: session.error.clone(),
    }
}

/// Partial file path for a session: `<destination>.<short id>.part`.
pub fn part_path(destination: &Path, id: &str) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_owned());
    let short: String = id.trim_start_matches("dl-").chars().take(8).collect();
    destination.with_file_name(format!("{name}.{short}.part"))
}

/// Parse `Content-Range: bytes <start>-<end>/<total|*>`.
fn parse_content_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let spec = value.trim().strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

/// Total length from a `416` response's `Content-Range: bytes */N`.
fn unsatisfied_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    value.trim().strip_prefix("bytes */")?.trim().parse().ok()
}

enum TransferOutcome {
    Completed,
    Failed(LauncherError),
    Interrupted,
}

struct Transfer {
    client: reqwest::Client,
    registry: Arc<Registry>,
    id: DownloadId,
    url: String,
    temp_path: PathBuf,
    destination: PathBuf,
    expected_size: Option<u64>,
}

impl Transfer {
    async fn run(&self, cancel: &CancellationToken, offset: u64) -> TransferOutcome {
        match self.transfer(cancel, offset).await {
            Ok(true) => TransferOutcome::Completed,
            Ok(false) => TransferOutcome::Interrupted,
            Err(e) => TransferOutcome::Failed(e),
        }
    }

    /// Returns `Ok(false)` when interrupted by the cancellation token.
    async fn transfer(&self, cancel: &CancellationToken, offset: u64) -> Result<bool> {
        let mut offset = offset;
        let (response, append, start, total) = loop {
            let mut request = self.client.get(&self.url);
            if offset > 0 {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                response = request.send() => response?,
            };

            let status = response.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
                let total = unsatisfied_range_total(response.headers()).or(self.expected_size);
                if total == Some(offset) && self.expected_size.is_none_or(|e| e == offset) {
                    debug!(download = %self.id, offset, "partial file already complete");
                    self.reset_progress(offset, total);
                    self.promote().await?;
                    return Ok(true);
                }
                warn!(download = %self.id, offset, ?total, "range not satisfiable, restarting from zero");
                offset = 0;
                continue;
            }
            if !status.is_success() {
                return Err(LauncherError::Network(format!(
                    "server returned HTTP {status} for {}",
                    self.url
                )));
            }

            if status != StatusCode::PARTIAL_CONTENT {
                if offset > 0 {
                    info!(download = %self.id, offset, "server ignored range request, restarting from zero");
                }
                let total = response.content_length();
                break (response, false, 0, total);
            }
            let range = parse_content_range(response.headers());
            match range {
                Some((start, total)) if offset > 0 && start == offset => {
                    let total = total.or_else(|| response.content_length().map(|len| start + len));
                    break (response, true, start, total);
                }
                other if offset > 0 => {
                    warn!(download = %self.id, offset, range = ?other, "partial response does not match offset, restarting from zero");
                    offset = 0;
                }
                other => {
                    return Err(LauncherError::Network(format!(
                        "unexpected partial response {other:?} for a full request"
                    )));
                }
            }
        };
        let total = total.or(self.expected_size);

        if let (Some(expected), Some(reported)) = (self.expected_size, total)
            && expected != reported
        {
            return Err(LauncherError::VerificationFailed(format!(
                "server reports {reported} bytes, release lists {expected}"
            )));
        }

        self.reset_progress(start, total);

        let open = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.temp_path)
                .await
        } else {
            tokio::fs::File::create(&self.temp_path).await
        };
        let mut file = open.map_err(|e| {
            LauncherError::Download(format!("cannot open {}: {e}", self.temp_path.display()))
        })?;

        let mut downloaded = start;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await.map_err(write_error)?;
                    return Ok(false);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(write_error)?;
            downloaded += chunk.len() as u64;
            self.record_progress(downloaded);
        }

        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        if let Some(total) = total
            && downloaded != total
        {
            return Err(LauncherError::VerificationFailed(format!(
                "expected {total} bytes, received {downloaded}"
            )));
        }

        self.promote().await?;
        Ok(true)
    }

    /// Move the finished partial file to its destination.
    async fn promote(&self) -> Result<()> {
        tokio::fs::rename(&self.temp_path, &self.destination)
            .await
            .map_err(|e| {
                LauncherError::Download(format!(
                    "cannot move download into {}: {e}",
                    self.destination.display()
                ))
            })
    }

    fn reset_progress(&self, start: u64, total: Option<u64>) {
        let mut sessions = self.registry.lock();
        if let Some(entry) = sessions.get_mut(&self.id) {
            entry.session.downloaded_bytes = start;
            entry.session.total_bytes = total;
            entry.meter.reset();
            entry.meter.record(Instant::now(), start);
        }
    }

    fn record_progress(&self, downloaded: u64) {
        let mut sessions = self.registry.lock();
        if let Some(entry) = sessions.get_mut(&self.id) {
            entry.session.downloaded_bytes = downloaded;
            entry.meter.record(Instant::now(), downloaded);
        }
    }

    fn finish(&self, outcome: TransferOutcome) {
        let mut sessions = self.registry.lock();
        let Some(entry) = sessions.get_mut(&self.id) else {
            return;
        };
        match outcome {
            TransferOutcome::Completed => {
                entry.transfer = None;
                transition(&mut entry.session, DownloadState::Completed);
                info!(
                    download = %self.id,
                    bytes = entry.session.downloaded_bytes,
                    dest = %self.destination.display(),
                    "download completed"
                );
            }
            TransferOutcome::Failed(e) => {
                entry.transfer = None;
                remove_partial(&self.temp_path);
                entry.session.error = Some(e.to_string());
                transition(&mut entry.session, DownloadState::Failed);
                warn!(download = %self.id, "download failed: {e}");
            }
            // Whoever cancelled the token owns the next transition.
            TransferOutcome::Interrupted => {}
        }
        entry.meter.reset();
    }
}

fn write_error(e: std::io::Error) -> LauncherError {
    LauncherError::Download(format!("write failed: {e}"))
}
