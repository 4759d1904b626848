//! macOS disk-image install.
//!
//! ```text
//! downloaded -> mounted -> app_located -> backed_up -> copied -> unmounted
//!            -> launched -> cleaned_up
//! ```
//!
//! A failure at `copied` or earlier restores the backup and fails the
//! session. The image is detached on every path once it was mounted. After a
//! failure the artifact and any surviving backup stay in scratch space.

use super::{InstallContext, InstallResult, InstallationTarget};
use crate::error::{Result, UpdraftError};
use crate::update::backup::{BackupSnapshot, TreeCopier, remove_path};
use crate::update::handoff::Launcher;
use crate::update::platform::PlatformTag;
use std::path::{Path, PathBuf};
use std::process::Command;

const TAG: PlatformTag = PlatformTag::MacosDmg;

/// Mounts and detaches disk images.
pub trait DiskImageTool: Send + Sync {
    /// Mount `image` read-only and return its mount point.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Mount`] if the image cannot be mounted or no
    /// mount point appears.
    fn attach(&self, image: &Path) -> Result<PathBuf>;

    /// Detach a mounted image, forcing it if a plain detach is refused.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Unmount`] if even the forced detach fails.
    fn detach(&self, mount_point: &Path) -> Result<()>;
}

/// `hdiutil`-backed [`DiskImageTool`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdiutil;

impl DiskImageTool for Hdiutil {
    fn attach(&self, image: &Path) -> Result<PathBuf> {
        let output = Command::new("hdiutil")
            .args(["attach", "-nobrowse", "-readonly", "-noautoopen"])
            .arg(image)
            .output()
            .map_err(|e| UpdraftError::Mount(format!("cannot run hdiutil: {e}")))?;

        if !output.status.success() {
            return Err(UpdraftError::Mount(format!(
                "hdiutil attach failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mount_point = parse_mount_point(&stdout).ok_or_else(|| {
            UpdraftError::Mount("no /Volumes mount point in hdiutil output".into())
        })?;
        if !mount_point.is_dir() {
            return Err(UpdraftError::Mount(format!(
                "mount point {} did not appear",
                mount_point.display()
            )));
        }

        tracing::info!(mount_point = %mount_point.display(), "disk image mounted");
        Ok(mount_point)
    }

    fn detach(&self, mount_point: &Path) -> Result<()> {
        let plain = Command::new("hdiutil").arg("detach").arg(mount_point).output();
        if let Ok(output) = &plain
            && output.status.success()
        {
            tracing::info!(mount_point = %mount_point.display(), "disk image detached");
            return Ok(());
        }
        tracing::warn!(mount_point = %mount_point.display(), "plain detach refused; forcing");

        let forced = Command::new("hdiutil")
            .args(["detach", "-force"])
            .arg(mount_point)
            .output()
            .map_err(|e| UpdraftError::Unmount(format!("cannot run hdiutil: {e}")))?;
        if forced.status.success() {
            tracing::info!(mount_point = %mount_point.display(), "disk image force-detached");
            Ok(())
        } else {
            Err(UpdraftError::Unmount(format!(
                "hdiutil detach -force failed: {}",
                String::from_utf8_lossy(&forced.stderr).trim()
            )))
        }
    }
}

/// Find the `/Volumes/...` mount point in `hdiutil attach` output.
///
/// The mount point is the last tab-separated column and may contain spaces.
#[must_use]
pub fn parse_mount_point(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.find("/Volumes/").map(|i| line[i..].trim_end()))
        .find(|path| path.len() > "/Volumes/".len())
        .map(PathBuf::from)
}

/// Locate the app bundle at the top of a mounted volume.
///
/// Exact names in `preferred` win; otherwise the first `.app` directory in
/// name order.
///
/// # Errors
///
/// Returns [`UpdraftError::Mount`] if the volume holds no app bundle.
pub fn locate_bundle(volume: &Path, preferred: &[String]) -> Result<PathBuf> {
    for name in preferred {
        let candidate = volume.join(name);
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }

    let mut bundles: Vec<PathBuf> = std::fs::read_dir(volume)
        .map_err(|e| UpdraftError::Mount(format!("cannot read {}: {e}", volume.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_dir()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("app"))
        })
        .collect();
    bundles.sort();
    bundles.into_iter().next().ok_or_else(|| {
        UpdraftError::Mount(format!("no .app bundle in {}", volume.display()))
    })
}

pub(crate) fn install(
    artifact: &Path,
    ctx: &InstallContext<'_>,
    images: &dyn DiskImageTool,
    copier: &dyn TreeCopier,
    launcher: &dyn Launcher,
) -> Result<InstallResult> {
    ctx.check_cancelled("mount")?;
    let mount_point = images.attach(artifact)?;
    ctx.stage(TAG, "mounted");

    let swapped = swap_bundle(&mount_point, ctx, copier);
    let detached = images.detach(&mount_point);

    let backup = match swapped {
        Ok(backup) => backup,
        Err(e) => {
            if let Err(unmount) = detached {
                tracing::error!(error = %unmount, "disk image left mounted after failed install");
            }
            tracing::error!(
                error = %e,
                artifact = %artifact.display(),
                "macOS install failed; artifact kept for diagnosis"
            );
            return Err(e);
        }
    };

    match detached {
        Ok(()) => ctx.stage(TAG, "unmounted"),
        Err(e) => tracing::warn!(error = %e, "disk image left mounted; new bundle already in place"),
    }

    clear_quarantine(ctx.target.root());

    let mut result = InstallResult::installed(TAG, ctx.target.root().to_path_buf());
    if ctx.config.relaunch {
        match relaunch(launcher, ctx.target) {
            Ok(pid) => {
                result.relaunched = true;
                tracing::info!(pid, "updated app relaunched");
                ctx.stage(TAG, "launched");
            }
            Err(e) => {
                tracing::warn!(error = %e, "relaunch failed; update is installed");
                result.launch_error = Some(e.to_string());
            }
        }
    }

    if let Some(backup) = backup {
        backup.discard();
    }
    if let Err(e) = std::fs::remove_file(artifact) {
        tracing::warn!(artifact = %artifact.display(), error = %e, "failed to remove disk image");
    }
    ctx.stage(TAG, "cleaned_up");
    Ok(result)
}

/// Locate, back up and replace the bundle. Restores the backup if the
/// replacement fails.
fn swap_bundle(
    volume: &Path,
    ctx: &InstallContext<'_>,
    copier: &dyn TreeCopier,
) -> Result<Option<BackupSnapshot>> {
    let root = ctx.target.root();

    let mut preferred = Vec::new();
    if let Some(name) = root.file_name().and_then(|n| n.to_str()) {
        preferred.push(name.to_owned());
    }
    preferred.push(format!("{}.app", ctx.config.app_name));
    let source = locate_bundle(volume, &preferred)?;
    ctx.stage(TAG, "app_located");

    ctx.check_cancelled("backup")?;

    let backup = if root.exists() {
        match BackupSnapshot::take(root, ctx.scratch.path()) {
            Ok(snapshot) => {
                ctx.stage(TAG, "backed_up");
                Some(snapshot)
            }
            Err(e) => {
                tracing::warn!(error = %e, "backup failed; continuing without one");
                None
            }
        }
    } else {
        None
    };

    let replaced = remove_path(root).and_then(|()| copier.copy_tree(&source, root));
    match replaced {
        Ok(()) => {
            ctx.stage(TAG, "copied");
            Ok(backup)
        }
        Err(e) => Err(roll_back(e, backup)),
    }
}

fn roll_back(err: UpdraftError, backup: Option<BackupSnapshot>) -> UpdraftError {
    let message = err.to_string();
    let Some(backup) = backup else {
        tracing::error!(error = %message, "copy failed and no backup exists; installation needs manual repair");
        return UpdraftError::Copy {
            restored: false,
            message,
        };
    };

    match backup.restore() {
        Ok(()) => {
            tracing::error!(error = %message, "copy failed; previous installation restored");
            UpdraftError::Copy {
                restored: true,
                message,
            }
        }
        Err(restore_err) => {
            backup.orphan();
            UpdraftError::Copy {
                restored: false,
                message: format!("{message}; restore failed: {restore_err}"),
            }
        }
    }
}

fn relaunch(launcher: &dyn Launcher, target: &InstallationTarget) -> Result<u32> {
    let args = vec!["-n".to_owned(), target.root().to_string_lossy().to_string()];
    launcher.launch(Path::new("/usr/bin/open"), &args)
}

/// Drop the quarantine attribute the download left on the bundle.
#[cfg(target_os = "macos")]
fn clear_quarantine(bundle: &Path) {
    let status = Command::new("xattr")
        .arg("-cr")
        .arg(bundle)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    if !status.is_ok_and(|s| s.success()) {
        tracing::warn!(bundle = %bundle.display(), "could not clear quarantine attributes");
    }
}

#[cfg(not(target_os = "macos"))]
fn clear_quarantine(_bundle: &Path) {}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn parses_mount_point_from_hdiutil_output() {
        let out = "/dev/disk4          \tGUID_partition_scheme          \t\n\
                   /dev/disk4s1        \tApple_HFS                      \t/Volumes/Updraft 0.2.7\n";
        assert_eq!(
            parse_mount_point(out),
            Some(PathBuf::from("/Volumes/Updraft 0.2.7"))
        );
    }

    #[test]
    fn missing_mount_point_is_none() {
        assert_eq!(parse_mount_point("/dev/disk4\tGUID_partition_scheme\n"), None);
        assert_eq!(parse_mount_point("weird /Volumes/\n"), None);
    }

    #[test]
    fn locates_preferred_then_any_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Other.app")).unwrap();
        std::fs::create_dir(dir.path().join("Updraft.app")).unwrap();
        std::fs::write(dir.path().join("README.txt"), b"hi").unwrap();

        let found = locate_bundle(dir.path(), &["Updraft.app".to_owned()]).unwrap();
        assert_eq!(found, dir.path().join("Updraft.app"));

        let found = locate_bundle(dir.path(), &["Missing.app".to_owned()]).unwrap();
        assert_eq!(found, dir.path().join("Other.app"));
    }

    #[test]
    fn empty_volume_is_mount_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            locate_bundle(dir.path(), &[]),
            Err(UpdraftError::Mount(_))
        ));
    }

    #[test]
    fn roll_back_without_backup_is_unrestored() {
        let err = roll_back(UpdraftError::Install("disk full".into()), None);
        assert!(matches!(err, UpdraftError::Copy { restored: false, .. }));
    }
}
