//! Release metadata, channel derivation and update selection.
//!
//! The release index (GitHub releases JSON) is parsed leniently: entries that
//! are drafts, lack a platform asset, or carry a malformed tag are skipped and
//! logged rather than failing the whole check.

use crate::update::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Release channel a build is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseChannel {
    /// Regular releases.
    #[default]
    Stable,
    /// Feature-complete pre-releases.
    Beta,
    /// Early experimental builds.
    Alpha,
}

impl ReleaseChannel {
    /// Derive the channel from a parsed version and the feed's prerelease flag.
    ///
    /// A label containing `alpha` means Alpha. Any other label, or a bare
    /// version flagged as prerelease by the feed, means Beta.
    pub fn derive(version: &Version, prerelease_flag: bool) -> Self {
        match version.pre.as_deref() {
            Some(label) if label.to_ascii_lowercase().contains("alpha") => Self::Alpha,
            Some(_) => Self::Beta,
            None if prerelease_flag => Self::Beta,
            None => Self::Stable,
        }
    }

    /// Whether a user on `self` gets to see releases from `other`.
    pub fn includes(self, other: Self) -> bool {
        match self {
            Self::Stable => other == Self::Stable,
            Self::Beta => matches!(other, Self::Stable | Self::Beta),
            Self::Alpha => true,
        }
    }
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
        };
        f.write_str(label)
    }
}

/// One entry of the release index with its platform asset already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Tag as published (e.g. `v1.3.0-beta.1`).
    pub tag: String,
    /// The feed's explicit prerelease flag.
    pub prerelease_flag: bool,
    /// Publication timestamp, used to break version ties.
    pub published_at: DateTime<Utc>,
    /// Markdown release notes.
    pub notes: String,
    /// Download URL of the platform asset.
    pub download_url: String,
    /// Size of the platform asset in bytes.
    pub size_bytes: u64,
    /// URL of a `<asset>.sha256` side-car, if published.
    pub checksum_url: Option<String>,
}

/// User policy for which releases are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseSettings {
    /// Channel the user is subscribed to.
    pub channel: ReleaseChannel,
    /// Make every channel visible regardless of subscription.
    pub allow_prerelease: bool,
}

impl ReleaseSettings {
    fn admits(&self, channel: ReleaseChannel) -> bool {
        self.allow_prerelease || self.channel.includes(channel)
    }
}

/// An update chosen by [`select_update`]. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCandidate {
    version: Version,
    channel: ReleaseChannel,
    download_url: String,
    artifact_size_bytes: u64,
    release_notes: String,
    published_at: DateTime<Utc>,
    is_prerelease: bool,
    checksum_url: Option<String>,
    checksum_sha256: Option<String>,
}

impl UpdateCandidate {
    fn from_release(release: &ReleaseInfo, version: Version, channel: ReleaseChannel) -> Self {
        let is_prerelease = channel != ReleaseChannel::Stable || release.prerelease_flag;
        Self {
            version,
            channel,
            download_url: release.download_url.clone(),
            artifact_size_bytes: release.size_bytes,
            release_notes: release.notes.clone(),
            published_at: release.published_at,
            is_prerelease,
            checksum_url: release.checksum_url.clone(),
            checksum_sha256: None,
        }
    }

    /// Attach the published SHA-256 digest (lowercase hex).
    #[must_use]
    pub fn with_checksum(mut self, sha256_hex: String) -> Self {
        self.checksum_sha256 = Some(sha256_hex.trim().to_ascii_lowercase());
        self
    }

    /// The offered version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Channel the release was published on.
    pub fn channel(&self) -> ReleaseChannel {
        self.channel
    }

    /// Platform artifact URL.
    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    /// Expected artifact size in bytes.
    pub fn artifact_size_bytes(&self) -> u64 {
        self.artifact_size_bytes
    }

    /// Markdown release notes.
    pub fn release_notes(&self) -> &str {
        &self.release_notes
    }

    /// Publication timestamp.
    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// `true` for anything not on the stable channel.
    pub fn is_prerelease(&self) -> bool {
        self.is_prerelease
    }

    /// Side-car checksum URL, if the release publishes one.
    pub fn checksum_url(&self) -> Option<&str> {
        self.checksum_url.as_deref()
    }

    /// Published SHA-256 digest, once fetched.
    pub fn checksum_sha256(&self) -> Option<&str> {
        self.checksum_sha256.as_deref()
    }
}

/// Pick the best eligible release strictly newer than `current`.
///
/// The greatest version wins; equal versions are broken by the most recent
/// publication date. Returns `None` for an empty feed, a feed with nothing
/// eligible, or nothing newer than `current`.
pub fn select_update(
    current: &Version,
    releases: &[ReleaseInfo],
    settings: &ReleaseSettings,
) -> Option<UpdateCandidate> {
    if releases.is_empty() {
        tracing::info!("release feed is empty, no update available");
        return None;
    }

    let mut best: Option<(Version, ReleaseChannel, &ReleaseInfo)> = None;
    for release in releases {
        let version = match Version::from_tag(&release.tag) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(tag = %release.tag, "skipping release: {e}");
                continue;
            }
        };
        let channel = ReleaseChannel::derive(&version, release.prerelease_flag);
        if !settings.admits(channel) {
            tracing::debug!(tag = %release.tag, %channel, "release not visible on subscribed channel");
            continue;
        }

        let better = match &best {
            None => true,
            Some((best_version, _, best_release)) => match version.cmp(best_version) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => release.published_at > best_release.published_at,
                std::cmp::Ordering::Less => false,
            },
        };
        if better {
            best = Some((version, channel, release));
        }
    }

    let (version, channel, release) = best?;
    if version <= *current {
        tracing::info!(%current, latest = %version, "launcher is up to date");
        return None;
    }

    tracing::info!(%current, %version, %channel, "update available");
    Some(UpdateCandidate::from_release(release, version, channel))
}

/// Returns the release asset name for the running platform.
pub fn platform_asset_name() -> &'static str {
    match std::env::consts::OS {
        "windows" => "TheBoysLauncher.exe",
        "macos" => "TheBoysLauncher-mac-universal",
        _ => "TheBoysLauncher-linux",
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    size: u64,
}

/// Parse a GitHub releases index into [`ReleaseInfo`] entries for `asset_name`.
///
/// Malformed entries are skipped individually. A body that is not a JSON
/// array yields an empty list.
pub fn parse_github_releases(body: &str, asset_name: &str) -> Vec<ReleaseInfo> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(body) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("malformed release index: {e}");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            let release: GitHubRelease = match serde_json::from_value(entry) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("skipping malformed release entry: {e}");
                    return None;
                }
            };
            release_from_github(release, asset_name)
        })
        .collect()
}

fn release_from_github(release: GitHubRelease, asset_name: &str) -> Option<ReleaseInfo> {
    if release.draft {
        return None;
    }
    let Some(published_at) = release.published_at else {
        tracing::debug!(tag = %release.tag_name, "skipping unpublished release");
        return None;
    };
    let Some(asset) = release.assets.iter().find(|a| a.name == asset_name) else {
        tracing::debug!(tag = %release.tag_name, asset_name, "release has no asset for this platform");
        return None;
    };
    if url::Url::parse(&asset.browser_download_url).is_err() {
        tracing::warn!(tag = %release.tag_name, "asset has an invalid download url");
        return None;
    }

    let checksum_name = format!("{asset_name}.sha256");
    let checksum_url = release
        .assets
        .iter()
        .find(|a| a.name == checksum_name)
        .map(|a| a.browser_download_url.clone());

    Some(ReleaseInfo {
        tag: release.tag_name,
        prerelease_flag: release.prerelease,
        published_at,
        notes: release.body.unwrap_or_default(),
        download_url: asset.browser_download_url.clone(),
        size_bytes: asset.size,
        checksum_url,
    })
}

/// Extract the hex digest from a `.sha256` side-car body.
///
/// Accepts both a bare digest and the `sha256sum` format (`<hex>  <file>`).
pub fn parse_checksum_file(body: &str) -> Option<String> {
    let digest = body.split_whitespace().next()?;
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;

    fn release(tag: &str, prerelease: bool, day: u32) -> ReleaseInfo {
        ReleaseInfo {
            tag: tag.to_owned(),
            prerelease_flag: prerelease,
            published_at: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
            notes: format!("notes for {tag}"),
            download_url: format!("https://example.com/{tag}/TheBoysLauncher-linux"),
            size_bytes: 1024,
            checksum_url: None,
        }
    }

    fn stable() -> ReleaseSettings {
        ReleaseSettings::default()
    }

    // ── channel derivation ───────────────────────────────────────

    #[test]
    fn channel_from_label_and_flag() {
        let v = |s: &str| Version::parse(s).unwrap();
        assert_eq!(ReleaseChannel::derive(&v("1.0.0"), false), ReleaseChannel::Stable);
        assert_eq!(ReleaseChannel::derive(&v("1.0.0"), true), ReleaseChannel::Beta);
        assert_eq!(ReleaseChannel::derive(&v("1.0.0-beta.1"), false), ReleaseChannel::Beta);
        assert_eq!(ReleaseChannel::derive(&v("1.0.0-rc.1"), true), ReleaseChannel::Beta);
        assert_eq!(ReleaseChannel::derive(&v("1.0.0-Alpha.3"), true), ReleaseChannel::Alpha);
    }

    #[test]
    fn channel_visibility() {
        assert!(ReleaseChannel::Stable.includes(ReleaseChannel::Stable));
        assert!(!ReleaseChannel::Stable.includes(ReleaseChannel::Beta));
        assert!(ReleaseChannel::Beta.includes(ReleaseChannel::Stable));
        assert!(!ReleaseChannel::Beta.includes(ReleaseChannel::Alpha));
        assert!(ReleaseChannel::Alpha.includes(ReleaseChannel::Beta));
    }

    // ── selection ────────────────────────────────────────────────

    #[test]
    fn stable_user_skips_newer_beta() {
        let current = Version::new(1, 2, 0);
        let releases = [
            release("v1.1.9", false, 1),
            release("v1.3.0-beta", true, 2),
            release("v1.2.5", false, 3),
        ];
        let candidate = select_update(&current, &releases, &stable()).unwrap();
        assert_eq!(candidate.version(), &Version::new(1, 2, 5));
        assert_eq!(candidate.channel(), ReleaseChannel::Stable);
        assert!(!candidate.is_prerelease());
    }

    #[test]
    fn allow_prerelease_exposes_beta_flagged() {
        let current = Version::new(1, 2, 0);
        let releases = [release("v1.2.5", false, 3), release("v1.3.0-beta", true, 2)];
        let settings = ReleaseSettings {
            channel: ReleaseChannel::Stable,
            allow_prerelease: true,
        };
        let candidate = select_update(&current, &releases, &settings).unwrap();
        assert_eq!(candidate.version().to_string(), "1.3.0-beta");
        assert!(candidate.is_prerelease());
        assert_eq!(candidate.channel(), ReleaseChannel::Beta);
    }

    #[test]
    fn beta_subscriber_does_not_see_alpha() {
        let current = Version::new(1, 0, 0);
        let releases = [release("v1.1.0-beta", true, 1), release("v1.2.0-alpha", true, 2)];
        let settings = ReleaseSettings {
            channel: ReleaseChannel::Beta,
            allow_prerelease: false,
        };
        let candidate = select_update(&current, &releases, &settings).unwrap();
        assert_eq!(candidate.version().to_string(), "1.1.0-beta");
    }

    #[test]
    fn nothing_newer_yields_none() {
        let current = Version::new(2, 0, 0);
        let releases = [release("v1.9.0", false, 1), release("v2.0.0", false, 2)];
        assert!(select_update(&current, &releases, &stable()).is_none());
    }

    #[test]
    fn empty_feed_yields_none() {
        assert!(select_update(&Version::new(1, 0, 0), &[], &stable()).is_none());
    }

    #[test]
    fn malformed_tags_are_skipped() {
        let current = Version::new(1, 0, 0);
        let releases = [release("nightly", false, 5), release("v1.0.1", false, 1)];
        let candidate = select_update(&current, &releases, &stable()).unwrap();
        assert_eq!(candidate.version(), &Version::new(1, 0, 1));

        let only_bad = [release("latest", false, 1)];
        assert!(select_update(&current, &only_bad, &stable()).is_none());
    }

    #[test]
    fn equal_versions_prefer_latest_publication() {
        let current = Version::new(1, 0, 0);
        let mut older = release("v1.1.0", false, 1);
        older.download_url = "https://example.com/old".into();
        let mut newer = release("1.1.0", false, 9);
        newer.download_url = "https://example.com/new".into();
        let candidate = select_update(&current, &[older, newer], &stable()).unwrap();
        assert_eq!(candidate.download_url(), "https://example.com/new");
    }

    // ── parsing ──────────────────────────────────────────────────

    const INDEX: &str = r#"[
        {"tag_name": "v1.3.0", "prerelease": false, "draft": false,
         "published_at": "2025-04-01T10:00:00Z", "body": "Fixes",
         "assets": [
            {"name": "TheBoysLauncher-linux", "browser_download_url": "https://dl.example.com/linux", "size": 2048},
            {"name": "TheBoysLauncher-linux.sha256", "browser_download_url": "https://dl.example.com/linux.sha256", "size": 90}
         ]},
        {"tag_name": "v1.4.0", "prerelease": false, "draft": true,
         "published_at": "2025-04-02T10:00:00Z", "assets": []},
        {"tag_name": "v1.2.0", "prerelease": false,
         "published_at": "2025-03-01T10:00:00Z",
         "assets": [{"name": "TheBoysLauncher.exe", "browser_download_url": "https://dl.example.com/win", "size": 1}]},
        {"tag_name": 12}
    ]"#;

    #[test]
    fn parses_index_and_resolves_assets() {
        let releases = parse_github_releases(INDEX, "TheBoysLauncher-linux");
        assert_eq!(releases.len(), 1);
        let r = &releases[0];
        assert_eq!(r.tag, "v1.3.0");
        assert_eq!(r.size_bytes, 2048);
        assert_eq!(r.notes, "Fixes");
        assert_eq!(r.checksum_url.as_deref(), Some("https://dl.example.com/linux.sha256"));
    }

    #[test]
    fn non_array_index_is_empty() {
        assert!(parse_github_releases("{\"message\":\"rate limited\"}", "x").is_empty());
        assert!(parse_github_releases("not json", "x").is_empty());
    }

    #[test]
    fn checksum_file_formats() {
        let hex = "a".repeat(64);
        assert_eq!(parse_checksum_file(&hex), Some(hex.clone()));
        assert_eq!(
            parse_checksum_file(&format!("{}  TheBoysLauncher-linux\n", hex.to_uppercase())),
            Some(hex)
        );
        assert_eq!(parse_checksum_file("deadbeef"), None);
        assert_eq!(parse_checksum_file(""), None);
    }

    #[test]
    fn platform_asset_name_matches_os() {
        let name = platform_asset_name();
        if cfg!(target_os = "windows") {
            assert!(name.ends_with(".exe"));
        } else {
            assert!(name.starts_with("TheBoysLauncher-"));
        }
    }
}
