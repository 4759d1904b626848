//! Updraft: self-update engine for desktop applications.
//!
//! Checks a release feed, downloads the artifact for the running platform
//! and installs it:
//!
//! - **Windows**: hands off to a detached installer, then exits
//! - **macOS**: mounts the disk image and swaps the `.app` bundle, restoring
//!   a backup if the copy fails
//! - **Linux**: extracts the archive and replaces files in place
//!
//! [`UpdateEngine`] runs one update session at a time. The [`host`] module
//! exposes it to a native shell as newline-delimited JSON commands.

pub mod config;
pub mod error;
pub mod host;
pub mod progress;
pub mod update;
pub mod updraft_dirs;

pub use config::UpdraftConfig;
pub use error::{Result, UpdraftError};
pub use progress::{ProgressCallback, ProgressEvent};
pub use update::{
    PlatformTag, UpdateCheckResult, UpdateEngine, UpdateManifest, VersionIdentifier,
};
