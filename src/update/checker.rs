//! Release feed checker.
//!
//! Fetches the latest release manifest, picks the artifact for this machine
//! and decides whether it is an update. Every failure is reported inside the
//! [`UpdateCheckResult`]; nothing is retried here.

use crate::config::UpdateConfig;
use crate::error::{Result, UpdraftError};
use crate::update::manifest::{ReleaseAsset, UpdateManifest};
use crate::update::platform::HostPlatform;
use crate::update::version::VersionIdentifier;
use serde::Serialize;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on the size of a release document.
const MAX_MANIFEST_BYTES: u64 = 4 * 1024 * 1024;

/// Why a check produced no installable update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    /// Feed unreachable, timed out, or answered with an HTTP error.
    Network(String),
    /// Feed refused the request because of rate limiting.
    RateLimited(String),
    /// Feed answered with something that is not a release document.
    MalformedManifest(String),
    /// A newer release exists but ships nothing for this platform.
    NoCompatibleArtifact {
        /// The platform that was looked for.
        platform: String,
    },
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::RateLimited(msg) => write!(f, "rate limited: {msg}"),
            Self::MalformedManifest(msg) => write!(f, "malformed manifest: {msg}"),
            Self::NoCompatibleArtifact { platform } => {
                write!(f, "no compatible artifact for {platform}")
            }
        }
    }
}

impl From<UpdraftError> for CheckFailure {
    fn from(err: UpdraftError) -> Self {
        match err {
            UpdraftError::RateLimited(msg) => Self::RateLimited(msg),
            UpdraftError::Manifest(msg) => Self::MalformedManifest(msg),
            other => Self::Network(other.to_string()),
        }
    }
}

/// Outcome of one update check.
#[derive(Debug, Clone)]
pub struct UpdateCheckResult {
    /// `true` only when a newer release with a compatible artifact exists.
    pub has_update: bool,
    /// The version that was compared against.
    pub current_version: VersionIdentifier,
    /// The fetched manifest, if the feed could be read.
    pub manifest: Option<Arc<UpdateManifest>>,
    /// The artifact selected for this machine.
    pub asset: Option<ReleaseAsset>,
    /// Soft failure, if any.
    pub error: Option<CheckFailure>,
}

impl UpdateCheckResult {
    fn failed(current_version: VersionIdentifier, error: CheckFailure) -> Self {
        Self {
            has_update: false,
            current_version,
            manifest: None,
            asset: None,
            error: Some(error),
        }
    }

    /// Latest published version, normalised.
    #[must_use]
    pub fn latest_version(&self) -> Option<String> {
        self.manifest.as_ref().map(|m| m.latest_version.to_string())
    }

    /// Download URL of the selected artifact.
    #[must_use]
    pub fn download_url(&self) -> Option<&str> {
        self.asset.as_ref().map(|a| a.download_url.as_str())
    }

    /// Flatten into the wire shape answered to update-check requests.
    #[must_use]
    pub fn to_response(&self) -> UpdateCheckResponse {
        let manifest = self.manifest.as_deref();
        UpdateCheckResponse {
            has_update: self.has_update,
            current_version: self.current_version.to_string(),
            latest_version: self.latest_version().unwrap_or_default(),
            is_prerelease: manifest.is_some_and(|m| m.is_prerelease),
            release_notes: manifest.map(|m| m.release_notes.clone()).unwrap_or_default(),
            download_url: self.download_url().unwrap_or_default().to_owned(),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Wire shape of an update-check answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResponse {
    pub has_update: bool,
    pub current_version: String,
    pub latest_version: String,
    pub is_prerelease: bool,
    pub release_notes: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Queries the release feed.
pub struct UpdateChecker {
    agent: ureq::Agent,
    feed_url: String,
    user_agent: String,
    host: HostPlatform,
    include_prereleases: bool,
}

impl UpdateChecker {
    /// Create a checker for `host` using the feed in `config`.
    #[must_use]
    pub fn new(config: &UpdateConfig, host: HostPlatform) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.check_timeout_secs.max(1)))
            .build();
        Self {
            agent,
            feed_url: config.feed_url.clone(),
            user_agent: config.user_agent.clone(),
            host,
            include_prereleases: config.include_prereleases,
        }
    }

    /// The platform artifacts are selected for.
    #[must_use]
    pub fn host(&self) -> HostPlatform {
        self.host
    }

    /// Fetch and parse the latest release manifest.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Network`], [`UpdraftError::RateLimited`] or
    /// [`UpdraftError::Manifest`].
    pub fn fetch_manifest(&self) -> Result<UpdateManifest> {
        tracing::debug!(url = %self.feed_url, "fetching release manifest");
        let resp = self
            .agent
            .get(&self.feed_url)
            .set("User-Agent", &self.user_agent)
            .set("Accept", "application/vnd.github+json")
            .call()
            .map_err(map_feed_error)?;

        let mut body = Vec::new();
        resp.into_reader()
            .take(MAX_MANIFEST_BYTES)
            .read_to_end(&mut body)
            .map_err(|e| UpdraftError::Network(format!("cannot read release feed: {e}")))?;

        UpdateManifest::from_github_json(&body)
    }

    /// Check whether a newer release than `current` is available here.
    ///
    /// A newer release without an artifact for this platform is reported as
    /// [`CheckFailure::NoCompatibleArtifact`] with `has_update = false`, so
    /// callers never proceed with a foreign artifact.
    #[must_use]
    pub fn check_for_update(&self, current: &VersionIdentifier) -> UpdateCheckResult {
        let manifest = match self.fetch_manifest() {
            Ok(m) => Arc::new(m),
            Err(e) => {
                tracing::warn!(error = %e, "update check failed");
                return UpdateCheckResult::failed(current.clone(), e.into());
            }
        };

        let mut result = UpdateCheckResult {
            has_update: false,
            current_version: current.clone(),
            manifest: Some(Arc::clone(&manifest)),
            asset: None,
            error: None,
        };

        if !manifest.latest_version.is_newer_than(current) {
            tracing::info!(
                current = %current,
                latest = %manifest.latest_version,
                "already running the latest version"
            );
            return result;
        }

        if manifest.is_prerelease && !self.include_prereleases {
            tracing::info!(
                latest = %manifest.latest_version,
                "newer release is a prerelease; skipping"
            );
            return result;
        }

        match manifest.select_asset(&self.host) {
            Some(asset) => {
                tracing::info!(
                    current = %current,
                    latest = %manifest.latest_version,
                    asset = %asset.name,
                    "update available"
                );
                result.has_update = true;
                result.asset = Some(asset.clone());
            }
            None => {
                tracing::warn!(
                    latest = %manifest.latest_version,
                    platform = %self.host,
                    "newer release has no artifact for this platform"
                );
                result.error = Some(CheckFailure::NoCompatibleArtifact {
                    platform: self.host.to_string(),
                });
            }
        }

        result
    }
}

fn map_feed_error(err: ureq::Error) -> UpdraftError {
    match err {
        ureq::Error::Status(code, resp) => {
            let exhausted = resp.header("x-ratelimit-remaining") == Some("0");
            if code == 429 || (code == 403 && exhausted) {
                UpdraftError::RateLimited(format!("release feed returned HTTP {code}"))
            } else {
                UpdraftError::Network(format!("release feed returned HTTP {code}"))
            }
        }
        ureq::Error::Transport(t) => UpdraftError::Network(t.to_string()),
    }
}
