//! Backup snapshots of the installation target.
//!
//! A [`BackupSnapshot`] is a full copy of the installation taken right before
//! it is removed. It is restored if the replacement fails, discarded after a
//! confirmed success, and left on disk (and logged) if restoring fails too.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Copies a directory tree.
///
/// The installers copy through this trait so tests can inject failures
/// midway through a copy.
pub trait TreeCopier: Send + Sync {
    /// Copy `from` (file or directory) to `to`, which must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be copied. `to` may then be
    /// partially written.
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Plain recursive copy keeping permissions and symlinks.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecursiveCopy;

impl TreeCopier for RecursiveCopy {
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        copy_tree(from, to)
    }
}

/// Recursively copy `from` to `to`.
///
/// Symlinks are recreated as symlinks on Unix (app bundles rely on them for
/// framework versioning) and followed elsewhere.
///
/// # Errors
///
/// Returns an error on the first entry that cannot be copied.
pub fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        #[cfg(unix)]
        {
            let link = std::fs::read_link(from)?;
            std::os::unix::fs::symlink(link, to)?;
            return Ok(());
        }
        #[cfg(not(unix))]
        {
            if std::fs::metadata(from)?.is_dir() {
                return copy_dir(from, to);
            }
            std::fs::copy(from, to)?;
            return Ok(());
        }
    }

    if file_type.is_dir() {
        copy_dir(from, to)?;
        std::fs::set_permissions(to, meta.permissions())?;
        return Ok(());
    }

    std::fs::copy(from, to)?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        copy_tree(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
///
/// # Errors
///
/// Returns an error if an existing path cannot be removed.
pub fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// A full pre-update copy of the installation.
#[derive(Debug)]
pub struct BackupSnapshot {
    source: PathBuf,
    path: PathBuf,
}

impl BackupSnapshot {
    /// Copy `source` into a new timestamped directory under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails. Any partial copy is removed.
    pub fn take(source: &Path, root: &Path) -> Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let dir = root.join(format!("backup-{stamp}"));
        std::fs::create_dir_all(&dir)?;

        let name = source
            .file_name()
            .map_or_else(|| PathBuf::from("installation"), PathBuf::from);
        let path = dir.join(name);

        if let Err(e) = copy_tree(source, &path) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }

        tracing::info!(
            source = %source.display(),
            backup = %path.display(),
            "backup snapshot taken"
        );
        Ok(Self {
            source: source.to_path_buf(),
            path,
        })
    }

    /// Location of the copy.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Put the snapshot back in place of the installation.
    ///
    /// Whatever is at the installation path is removed first. The snapshot
    /// is moved when possible and copied otherwise; a copied snapshot stays
    /// on disk until [`BackupSnapshot::discard`].
    ///
    /// # Errors
    ///
    /// Returns an error if the installation path cannot be cleared or the
    /// snapshot cannot be moved or copied back.
    pub fn restore(&self) -> Result<()> {
        remove_path(&self.source)?;
        if let Some(parent) = self.source.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if std::fs::rename(&self.path, &self.source).is_ok() {
            if let Some(dir) = self.path.parent() {
                let _ = std::fs::remove_dir(dir);
            }
        } else if let Err(e) = copy_tree(&self.path, &self.source) {
            let _ = remove_path(&self.source);
            return Err(e);
        }

        tracing::info!(install = %self.source.display(), "installation restored from backup");
        Ok(())
    }

    /// Delete the snapshot after a confirmed success.
    pub fn discard(self) {
        self.remove_dir();
        tracing::debug!(backup = %self.path.display(), "backup snapshot discarded");
    }

    /// Leave the snapshot on disk and return its location.
    pub fn orphan(self) -> PathBuf {
        tracing::error!(
            backup = %self.path.display(),
            install = %self.source.display(),
            "backup snapshot left on disk"
        );
        self.path
    }

    fn remove_dir(&self) {
        let dir = self.path.parent().unwrap_or(&self.path);
        if !dir.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(backup = %dir.display(), error = %e, "failed to remove backup");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn make_bundle(root: &Path) -> PathBuf {
        let app = root.join("Updraft.app");
        std::fs::create_dir_all(app.join("Contents/MacOS")).unwrap();
        std::fs::write(app.join("Contents/Info.plist"), b"<plist>old</plist>").unwrap();
        std::fs::write(app.join("Contents/MacOS/updraft"), b"\x7fELF old binary").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                app.join("Contents/MacOS/updraft"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
            std::os::unix::fs::symlink("MacOS/updraft", app.join("Contents/current")).unwrap();
        }
        app
    }

    #[test]
    fn copy_tree_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_bundle(dir.path());
        let copy = dir.path().join("copy.app");
        copy_tree(&app, &copy).unwrap();

        assert_eq!(
            std::fs::read(copy.join("Contents/MacOS/updraft")).unwrap(),
            b"\x7fELF old binary"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(copy.join("Contents/MacOS/updraft"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
            let link = std::fs::read_link(copy.join("Contents/current")).unwrap();
            assert_eq!(link, PathBuf::from("MacOS/updraft"));
        }
    }

    #[test]
    fn restore_replaces_damaged_install() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_bundle(dir.path());
        let backups = dir.path().join("backups");

        let snapshot = BackupSnapshot::take(&app, &backups).unwrap();
        assert!(snapshot.path().starts_with(&backups));

        std::fs::remove_dir_all(&app).unwrap();
        std::fs::create_dir_all(app.join("Contents")).unwrap();
        std::fs::write(app.join("Contents/partial"), b"half").unwrap();

        snapshot.restore().unwrap();
        assert!(!app.join("Contents/partial").exists());
        assert_eq!(
            std::fs::read(app.join("Contents/Info.plist")).unwrap(),
            b"<plist>old</plist>"
        );
        assert_eq!(std::fs::read_dir(&backups).unwrap().count(), 0);
    }

    #[test]
    fn discard_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_bundle(dir.path());
        let snapshot = BackupSnapshot::take(&app, &dir.path().join("backups")).unwrap();
        let path = snapshot.path().to_path_buf();
        snapshot.discard();
        assert!(!path.exists());
        assert!(app.exists());
    }

    #[test]
    fn take_of_missing_source_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        assert!(BackupSnapshot::take(&dir.path().join("Missing.app"), &backups).is_err());
        assert_eq!(std::fs::read_dir(&backups).unwrap().count(), 0);
    }

    #[test]
    fn remove_path_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_path(&dir.path().join("nothing")).unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        remove_path(&file).unwrap();
        assert!(!file.exists());
    }
}
