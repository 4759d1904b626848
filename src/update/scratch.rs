//! Per-session scratch directories.
//!
//! Each update attempt gets its own directory named
//! `updraft-update-<timestamp>-<token>`. The [`ScratchSpace`] is the only
//! owner of that directory's cleanup: it is removed by [`ScratchSpace::cleanup`]
//! after a confirmed success and left on disk otherwise, so a failed attempt
//! can be diagnosed from what it left behind.

use crate::error::Result;
use crate::updraft_dirs::SCRATCH_PREFIX;
use std::path::{Path, PathBuf};

/// A uniquely named working directory for one update session.
#[derive(Debug)]
#[must_use = "scratch space is kept on disk unless cleaned up"]
pub struct ScratchSpace {
    path: PathBuf,
}

impl ScratchSpace {
    /// Create a fresh scratch directory under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(root: &Path) -> Result<Self> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let path = root.join(format!("{SCRATCH_PREFIX}{stamp}-{}", &token[..12]));
        std::fs::create_dir_all(&path)?;
        tracing::debug!(path = %path.display(), "created scratch space");
        Ok(Self { path })
    }

    /// Root of the scratch directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a named entry inside the scratch directory.
    #[must_use]
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Create a subdirectory and return its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.path.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove the directory after a confirmed success.
    ///
    /// Removal problems are logged, not returned: the update itself already
    /// succeeded.
    pub fn cleanup(self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed scratch space"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove scratch space"
            ),
        }
    }

    /// Leave the directory on disk and give up ownership.
    ///
    /// Used on failure (for diagnosis) and when a detached installer still
    /// runs out of the directory.
    pub fn retain(self, reason: &str) -> PathBuf {
        tracing::info!(path = %self.path.display(), reason, "keeping scratch space");
        self.path
    }
}

/// List scratch directories left behind under `root` by earlier sessions.
///
/// # Errors
///
/// Returns an error if `root` exists but cannot be read.
pub fn leftover_sessions(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let is_session = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
        if is_session && entry.path().is_dir() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}
