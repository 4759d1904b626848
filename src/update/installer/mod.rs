//! Platform installers.
//!
//! One entry point, [`PlatformInstaller::install`], dispatches on the
//! artifact's [`PlatformTag`]:
//!
//! - [`PlatformTag::Windows`]: unpack the installer into scratch space and
//!   verify it. Launching it and exiting is left to the handoff.
//! - [`PlatformTag::MacosDmg`]: mount, back up, swap the `.app` bundle,
//!   unmount, relaunch.
//! - [`PlatformTag::LinuxZip`]: extract to staging and rename each file into
//!   the install directory.

pub mod linux;
pub mod macos;
pub mod windows;

use crate::config::InstallConfig;
use crate::error::{Result, UpdraftError};
use crate::progress::{ProgressCallback, ProgressEvent, emit};
use crate::update::backup::{RecursiveCopy, TreeCopier};
use crate::update::handoff::{DetachedLauncher, Launcher};
use crate::update::platform::PlatformTag;
use crate::update::scratch::ScratchSpace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use macos::{DiskImageTool, Hdiutil};

/// The installation being updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationTarget {
    root: PathBuf,
    executable: PathBuf,
}

impl InstallationTarget {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            executable: executable.into(),
        }
    }

    /// Work out the installation from config or from the running executable.
    ///
    /// For disk-image installs the root is the enclosing `.app` bundle; for
    /// the other models it is the directory holding the executable.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Install`] if the running executable cannot be
    /// located or (for disk images) is not inside an `.app` bundle.
    pub fn detect(config: &InstallConfig, tag: PlatformTag) -> Result<Self> {
        let exe_name = config.executable_name();

        if let Some(root) = &config.install_dir {
            let executable = match tag {
                PlatformTag::MacosDmg => root.join("Contents").join("MacOS").join(&exe_name),
                PlatformTag::Windows | PlatformTag::LinuxZip => root.join(&exe_name),
            };
            return Ok(Self::new(root.clone(), executable));
        }

        let exe = std::env::current_exe().map_err(|e| {
            UpdraftError::Install(format!("cannot determine current executable path: {e}"))
        })?;

        let root = match tag {
            PlatformTag::MacosDmg => app_bundle_of(&exe).ok_or_else(|| {
                UpdraftError::Install(format!(
                    "{} is not inside an .app bundle; set install.install_dir",
                    exe.display()
                ))
            })?,
            PlatformTag::Windows | PlatformTag::LinuxZip => exe
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| UpdraftError::Install("executable has no parent directory".into()))?,
        };
        Ok(Self::new(root, exe))
    }

    /// Install root (directory or `.app` bundle).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Executable inside the installation.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

/// Closest ancestor of `path` with an `.app` extension.
#[must_use]
pub fn app_bundle_of(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("app"))
        })
        .map(Path::to_path_buf)
}

/// What an install attempt did.
#[derive(Debug, Clone)]
pub struct InstallResult {
    /// Installation model that ran.
    pub updater_type: PlatformTag,
    /// Prepared installer (Windows) or the updated installation.
    pub updater_path: PathBuf,
    /// Installer arguments for the detached handoff (Windows only).
    pub updater_args: Vec<String>,
    /// Whether the installation files were replaced by this process.
    pub installed: bool,
    /// Whether the updated app was started.
    pub relaunched: bool,
    /// Why the relaunch failed. The install itself still stands.
    pub launch_error: Option<String>,
}

impl InstallResult {
    fn pending(updater_type: PlatformTag, updater_path: PathBuf, args: Vec<String>) -> Self {
        Self {
            updater_type,
            updater_path,
            updater_args: args,
            installed: false,
            relaunched: false,
            launch_error: None,
        }
    }

    fn installed(updater_type: PlatformTag, updater_path: PathBuf) -> Self {
        Self {
            updater_type,
            updater_path,
            updater_args: Vec::new(),
            installed: true,
            relaunched: false,
            launch_error: None,
        }
    }
}

/// Per-attempt inputs shared by all installers.
pub struct InstallContext<'a> {
    pub target: &'a InstallationTarget,
    pub scratch: &'a ScratchSpace,
    pub config: &'a InstallConfig,
    pub cancel: Option<&'a CancellationToken>,
    pub progress: Option<&'a ProgressCallback>,
}

impl InstallContext<'_> {
    /// Fail with [`UpdraftError::Cancelled`] if cancellation was requested.
    ///
    /// Only called before the first destructive step.
    pub(crate) fn check_cancelled(&self, stage: &str) -> Result<()> {
        if self.cancel.is_some_and(CancellationToken::is_cancelled) {
            tracing::info!(stage, "update cancelled before modifying the installation");
            return Err(UpdraftError::Cancelled(format!("cancelled at {stage}")));
        }
        Ok(())
    }

    pub(crate) fn stage(&self, updater_type: PlatformTag, stage: &str) {
        tracing::info!(updater_type = %updater_type, stage, "install stage");
        emit(
            self.progress,
            ProgressEvent::InstallStage {
                updater_type,
                stage: stage.to_owned(),
            },
        );
    }
}

/// Dispatches installs to the right model.
pub struct PlatformInstaller {
    disk_images: Arc<dyn DiskImageTool>,
    copier: Arc<dyn TreeCopier>,
    launcher: Arc<dyn Launcher>,
}

impl Default for PlatformInstaller {
    fn default() -> Self {
        Self::new(
            Arc::new(Hdiutil),
            Arc::new(RecursiveCopy),
            Arc::new(DetachedLauncher),
        )
    }
}

impl PlatformInstaller {
    #[must_use]
    pub fn new(
        disk_images: Arc<dyn DiskImageTool>,
        copier: Arc<dyn TreeCopier>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            disk_images,
            copier,
            launcher,
        }
    }

    /// Install `artifact` using the model named by `updater_type`.
    ///
    /// # Errors
    ///
    /// Returns the installer's error. In every error case the installation is
    /// either untouched or restored, except [`UpdraftError::Copy`] with
    /// `restored: false`.
    pub fn install(
        &self,
        updater_type: PlatformTag,
        artifact: &Path,
        ctx: &InstallContext<'_>,
    ) -> Result<InstallResult> {
        tracing::info!(
            updater_type = %updater_type,
            artifact = %artifact.display(),
            install_root = %ctx.target.root().display(),
            "installing update"
        );
        match updater_type {
            PlatformTag::Windows => windows::prepare(artifact, ctx),
            PlatformTag::MacosDmg => macos::install(
                artifact,
                ctx,
                self.disk_images.as_ref(),
                self.copier.as_ref(),
                self.launcher.as_ref(),
            ),
            PlatformTag::LinuxZip => linux::install(artifact, ctx, self.launcher.as_ref()),
        }
    }
}

/// Extract every entry of a zip archive under `dest`.
///
/// Entries whose names would escape `dest` are rejected. Unix modes stored in
/// the archive are applied.
pub(crate) fn extract_zip(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| UpdraftError::Install(format!("cannot open archive: {e}")))?;

    let mut written = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| UpdraftError::Install(format!("cannot read archive entry {i}: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(UpdraftError::Install(format!(
                "archive entry escapes extraction dir: {}",
                entry.name()
            )));
        };
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
        written.push(out);
    }
    Ok(written)
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::io::Write;
    use std::path::Path;
    use zip::write::SimpleFileOptions;

    /// Write a zip with `(name, contents, unix mode)` entries.
    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data, mode) in entries {
            let options = SimpleFileOptions::default().unix_permissions(*mode);
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::test_support::write_zip;
    use super::*;

    #[test]
    fn app_bundle_found_from_executable() {
        let exe = Path::new("/Applications/Updraft.app/Contents/MacOS/updraft");
        assert_eq!(
            app_bundle_of(exe),
            Some(PathBuf::from("/Applications/Updraft.app"))
        );
        assert_eq!(app_bundle_of(Path::new("/usr/local/bin/updraft")), None);
    }

    #[test]
    fn configured_install_dir_wins() {
        let config = InstallConfig {
            install_dir: Some(PathBuf::from("/opt/updraft")),
            executable_name: Some("updraft".into()),
            ..Default::default()
        };
        let target = InstallationTarget::detect(&config, PlatformTag::LinuxZip).unwrap();
        assert_eq!(target.root(), Path::new("/opt/updraft"));
        assert_eq!(target.executable(), Path::new("/opt/updraft/updraft"));

        let config = InstallConfig {
            install_dir: Some(PathBuf::from("/Applications/Updraft.app")),
            executable_name: Some("updraft".into()),
            ..Default::default()
        };
        let target = InstallationTarget::detect(&config, PlatformTag::MacosDmg).unwrap();
        assert_eq!(
            target.executable(),
            Path::new("/Applications/Updraft.app/Contents/MacOS/updraft")
        );
    }

    #[test]
    fn detects_from_running_executable() {
        let target =
            InstallationTarget::detect(&InstallConfig::default(), PlatformTag::LinuxZip).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(target.root(), exe.parent().unwrap());
    }

    #[test]
    fn extract_zip_writes_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(
            &archive,
            &[
                ("updraft", b"#!/bin/sh\necho new\n", 0o755),
                ("share/icon.png", b"png", 0o644),
            ],
        );
        let out = dir.path().join("out");
        let written = extract_zip(&archive, &out).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read(out.join("share/icon.png")).unwrap(), b"png");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(out.join("updraft"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn extract_zip_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        assert!(matches!(
            extract_zip(&archive, &dir.path().join("out")),
            Err(UpdraftError::Install(_))
        ));
    }
}
