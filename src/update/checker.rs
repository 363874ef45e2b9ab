//! Release index fetching.
//!
//! [`ReleaseFeed`] is the seam between update selection and wherever releases
//! are published. [`GitHubReleaseFeed`] queries the GitHub releases API.

use crate::config::UpdateConfig;
use crate::error::{LauncherError, Result};
use crate::update::release::{ReleaseInfo, parse_checksum_file, parse_github_releases};
use async_trait::async_trait;
use std::time::Duration;

/// Source of published launcher releases.
#[async_trait]
pub trait ReleaseFeed: Send + Sync {
    /// Fetch every release visible to the launcher, in any order.
    ///
    /// A reachable feed with unusable content returns an empty list; only
    /// transport failures are errors.
    async fn fetch_releases(&self) -> Result<Vec<ReleaseInfo>>;

    /// Fetch a published SHA-256 side-car and return its hex digest.
    async fn fetch_checksum(&self, url: &str) -> Result<Option<String>>;
}

/// GitHub releases API client.
pub struct GitHubReleaseFeed {
    client: reqwest::Client,
    releases_url: String,
    asset_name: String,
}

impl GitHubReleaseFeed {
    /// Build a feed for the repository named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Network`] if the HTTP client cannot be built.
    pub fn new(config: &UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()?;
        let releases_url = format!(
            "{}/repos/{}/{}/releases",
            config.api_base_url.trim_end_matches('/'),
            config.repo_owner,
            config.repo_name
        );
        Ok(Self {
            client,
            releases_url,
            asset_name: config.resolved_asset_name(),
        })
    }

    /// The URL queried for the release list.
    pub fn releases_url(&self) -> &str {
        &self.releases_url
    }
}

#[async_trait]
impl ReleaseFeed for GitHubReleaseFeed {
    async fn fetch_releases(&self) -> Result<Vec<ReleaseInfo>> {
        tracing::debug!(url = %self.releases_url, "fetching release index");
        let resp = self
            .client
            .get(&self.releases_url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LauncherError::Network(format!(
                "release index returned HTTP {status}"
            )));
        }
        if !status.is_success() {
            tracing::warn!(%status, "release index unavailable, treating as empty");
            return Ok(Vec::new());
        }

        let body = resp.text().await?;
        let releases = parse_github_releases(&body, &self.asset_name);
        tracing::debug!(count = releases.len(), asset = %self.asset_name, "parsed release index");
        Ok(releases)
    }

    async fn fetch_checksum(&self, url: &str) -> Result<Option<String>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(LauncherError::Network(format!(
                "checksum download returned HTTP {}",
                resp.status()
            )));
        }
        let body = resp.text().await?;
        let digest = parse_checksum_file(&body);
        if digest.is_none() {
            tracing::warn!(url, "checksum side-car has no usable digest");
        }
        Ok(digest)
    }
}
