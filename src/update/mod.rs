//! Self-update engine.
//!
//! Checks a release feed for newer versions, downloads the matching artifact
//! with size and digest checks, and installs it with the model its artifact
//! type calls for: a detached installer on Windows, a disk-image bundle swap
//! on macOS, and in-place file replacement on Linux.

pub mod backup;
pub mod checker;
pub mod fetcher;
pub mod handoff;
pub mod installer;
pub mod manifest;
pub mod platform;
pub mod scratch;
pub mod session;
pub mod version;

pub use checker::{CheckFailure, UpdateCheckResponse, UpdateCheckResult, UpdateChecker};
pub use fetcher::{ArtifactFetcher, DownloadRequest};
pub use handoff::{ProcessHandoff, verify_restarted};
pub use installer::{InstallResult, InstallationTarget, PlatformInstaller};
pub use manifest::{ReleaseAsset, UpdateManifest};
pub use platform::{Arch, HostPlatform, PlatformTag};
pub use session::{DownloadOutcome, RunOutcome, SessionState, UpdateEngine, UpdateSession};
pub use version::VersionIdentifier;
