//! Release manifests read from the GitHub releases feed.
//!
//! A manifest is built once per check and never mutated afterwards; the
//! checker hands it out behind an `Arc`.

use crate::error::{Result, UpdraftError};
use crate::update::platform::{Arch, HostPlatform, PlatformTag};
use crate::update::version::VersionIdentifier;
use serde::Deserialize;

/// One installable artifact of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    /// Asset filename (e.g. `"Updraft_0.2.7_universal.dmg"`).
    pub name: String,
    /// Direct download URL.
    pub download_url: String,
    /// Installation model the artifact is packaged for.
    pub platform_tag: PlatformTag,
    /// CPU architecture the artifact targets.
    pub arch: Arch,
    /// Advertised size in bytes, if the feed reports one.
    pub size: Option<u64>,
    /// Lowercase hex SHA-256 digest, if the feed publishes one.
    pub sha256: Option<String>,
}

/// The latest release as described by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    pub latest_version: VersionIdentifier,
    /// Tag exactly as published (e.g. `"v0.2.7"`).
    pub tag_name: String,
    pub is_prerelease: bool,
    pub release_notes: String,
    /// Assets with a recognised platform tag. Other files (checksums,
    /// source archives) are dropped.
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    digest: Option<String>,
}

impl UpdateManifest {
    /// Parse a GitHub "latest release" JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Manifest`] if the document is not valid JSON or
    /// lacks a tag name.
    pub fn from_github_json(bytes: &[u8]) -> Result<Self> {
        let release: GithubRelease = serde_json::from_slice(bytes)
            .map_err(|e| UpdraftError::Manifest(format!("cannot parse release feed: {e}")))?;

        if release.tag_name.trim().is_empty() {
            return Err(UpdraftError::Manifest(
                "release feed has an empty tag_name".to_owned(),
            ));
        }

        let assets = release
            .assets
            .into_iter()
            .filter_map(|asset| {
                let Some(platform_tag) = PlatformTag::from_asset_name(&asset.name) else {
                    tracing::debug!(asset = %asset.name, "skipping asset without a platform tag");
                    return None;
                };
                Some(ReleaseAsset {
                    arch: Arch::from_asset_name(&asset.name),
                    platform_tag,
                    size: (asset.size > 0).then_some(asset.size),
                    sha256: asset.digest.as_deref().and_then(parse_sha256_digest),
                    name: asset.name,
                    download_url: asset.browser_download_url,
                })
            })
            .collect();

        Ok(Self {
            latest_version: VersionIdentifier::parse(&release.tag_name),
            tag_name: release.tag_name,
            is_prerelease: release.prerelease,
            release_notes: release.body.unwrap_or_default(),
            assets,
        })
    }

    /// Pick the asset for `host`, preferring an exact architecture match over
    /// a universal build.
    #[must_use]
    pub fn select_asset(&self, host: &HostPlatform) -> Option<&ReleaseAsset> {
        let mut candidates = self
            .assets
            .iter()
            .filter(|a| host.accepts(a.platform_tag, a.arch));
        let first = candidates.next()?;
        if first.arch == host.arch {
            return Some(first);
        }
        candidates.find(|a| a.arch == host.arch).or(Some(first))
    }

    /// Find the asset published under `url`.
    #[must_use]
    pub fn asset_by_url(&self, url: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.download_url == url)
    }
}

/// Accept `sha256:<hex>` digests as published by GitHub.
fn parse_sha256_digest(raw: &str) -> Option<String> {
    let hex = raw.strip_prefix("sha256:")?;
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| hex.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const FEED: &str = r#"{
        "tag_name": "v0.2.7",
        "name": "Updraft 0.2.7",
        "prerelease": false,
        "body": "Bug fixes",
        "assets": [
            {
                "name": "Updraft_0.2.7_universal.dmg",
                "browser_download_url": "https://example.com/Updraft_0.2.7_universal.dmg",
                "size": 41000000,
                "digest": "sha256:AB8C0F5D1E2A3B4C5D6E7F8091A2B3C4D5E6F708192A3B4C5D6E7F8091A2B3C4"
            },
            {
                "name": "updraft-0.2.7-windows-x64.zip",
                "browser_download_url": "https://example.com/updraft-0.2.7-windows-x64.zip",
                "size": 38000000
            },
            {
                "name": "updraft-0.2.7-linux-x86_64.zip",
                "browser_download_url": "https://example.com/updraft-0.2.7-linux-x86_64.zip",
                "size": 12000000
            },
            {
                "name": "updraft-0.2.7-linux-arm64.zip",
                "browser_download_url": "https://example.com/updraft-0.2.7-linux-arm64.zip",
                "size": 11000000
            },
            {
                "name": "SHA256SUMS",
                "browser_download_url": "https://example.com/SHA256SUMS",
                "size": 400
            }
        ]
    }"#;

    #[test]
    fn parses_github_release() {
        let manifest = UpdateManifest::from_github_json(FEED.as_bytes()).unwrap();
        assert_eq!(manifest.latest_version, VersionIdentifier::release(0, 2, 7));
        assert_eq!(manifest.tag_name, "v0.2.7");
        assert!(!manifest.is_prerelease);
        assert_eq!(manifest.release_notes, "Bug fixes");
        assert_eq!(manifest.assets.len(), 4, "checksum file should be dropped");
    }

    #[test]
    fn digest_is_normalised() {
        let manifest = UpdateManifest::from_github_json(FEED.as_bytes()).unwrap();
        let dmg = &manifest.assets[0];
        assert_eq!(
            dmg.sha256.as_deref(),
            Some("ab8c0f5d1e2a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4")
        );
        assert_eq!(manifest.assets[1].sha256, None);
        assert_eq!(parse_sha256_digest("md5:abc"), None);
    }

    #[test]
    fn selects_matching_arch() {
        let manifest = UpdateManifest::from_github_json(FEED.as_bytes()).unwrap();
        let host = HostPlatform::new(PlatformTag::LinuxZip, Arch::Aarch64);
        let asset = manifest.select_asset(&host).unwrap();
        assert_eq!(asset.name, "updraft-0.2.7-linux-arm64.zip");

        let host = HostPlatform::new(PlatformTag::LinuxZip, Arch::X86_64);
        let asset = manifest.select_asset(&host).unwrap();
        assert_eq!(asset.name, "updraft-0.2.7-linux-x86_64.zip");
    }

    #[test]
    fn universal_dmg_serves_both_macs() {
        let manifest = UpdateManifest::from_github_json(FEED.as_bytes()).unwrap();
        for arch in [Arch::Aarch64, Arch::X86_64] {
            let host = HostPlatform::new(PlatformTag::MacosDmg, arch);
            assert_eq!(
                manifest.select_asset(&host).unwrap().platform_tag,
                PlatformTag::MacosDmg
            );
        }
    }

    #[test]
    fn no_asset_for_foreign_platform() {
        let json = r#"{"tag_name":"v1.0.0","assets":[
            {"name":"Updraft.dmg","browser_download_url":"https://example.com/Updraft.dmg"}
        ]}"#;
        let manifest = UpdateManifest::from_github_json(json.as_bytes()).unwrap();
        let host = HostPlatform::new(PlatformTag::Windows, Arch::X86_64);
        assert!(manifest.select_asset(&host).is_none());
    }

    #[test]
    fn rejects_malformed_feed() {
        assert!(matches!(
            UpdateManifest::from_github_json(b"<html>rate limit</html>"),
            Err(UpdraftError::Manifest(_))
        ));
        assert!(matches!(
            UpdateManifest::from_github_json(br#"{"tag_name":"  "}"#),
            Err(UpdraftError::Manifest(_))
        ));
    }

    #[test]
    fn finds_asset_by_url() {
        let manifest = UpdateManifest::from_github_json(FEED.as_bytes()).unwrap();
        let asset = manifest
            .asset_by_url("https://example.com/updraft-0.2.7-windows-x64.zip")
            .unwrap();
        assert_eq!(asset.platform_tag, PlatformTag::Windows);
        assert!(manifest.asset_by_url("https://example.com/other").is_none());
    }
}
