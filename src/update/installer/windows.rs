//! Windows installer handoff.
//!
//! The artifact is an installer (bare `.exe`/`.msi`, or a `.zip` holding
//! one). It is placed in scratch space and checked here; the detached
//! launch and the exit happen in the handoff, after which the installer
//! overwrites the install directory and starts the app again on its own.

use super::{InstallContext, InstallResult, extract_zip};
use crate::error::{Result, UpdraftError};
use crate::update::handoff::is_executable;
use crate::update::platform::PlatformTag;
use std::path::{Path, PathBuf};

/// Unpack or copy the installer into scratch space and verify it.
pub(crate) fn prepare(artifact: &Path, ctx: &InstallContext<'_>) -> Result<InstallResult> {
    ctx.check_cancelled("prepare")?;
    let dir = ctx.scratch.subdir("installer")?;

    let installer = if has_ext(artifact, "zip") {
        let files = extract_zip(artifact, &dir)?;
        ctx.stage(PlatformTag::Windows, "extracted");
        find_installer(&files, &ctx.config.executable_name()).ok_or_else(|| {
            UpdraftError::Install(format!(
                "no installer executable in {}",
                artifact.display()
            ))
        })?
    } else if has_ext(artifact, "exe") || has_ext(artifact, "msi") {
        let name = artifact
            .file_name()
            .ok_or_else(|| UpdraftError::Install("installer has no file name".into()))?;
        let dest = dir.join(name);
        std::fs::copy(artifact, &dest)?;
        dest
    } else {
        return Err(UpdraftError::Install(format!(
            "unsupported installer artifact: {}",
            artifact.display()
        )));
    };

    if !is_executable(&installer) {
        return Err(UpdraftError::Install(format!(
            "installer is not an executable file: {}",
            installer.display()
        )));
    }

    let args = ctx.config.installer_args(ctx.target.root());
    ctx.stage(PlatformTag::Windows, "prepared");
    tracing::info!(installer = %installer.display(), ?args, "installer ready for handoff");
    Ok(InstallResult::pending(PlatformTag::Windows, installer, args))
}

/// Pick the installer among extracted files.
///
/// Preference: a name containing `setup` or `install`, then the only `.exe`
/// that is not the app itself, then an `.msi`.
fn find_installer(files: &[PathBuf], app_exe: &str) -> Option<PathBuf> {
    let name_of = |p: &PathBuf| {
        p.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    };

    let exes: Vec<&PathBuf> = files.iter().filter(|p| has_ext(p, "exe")).collect();

    if let Some(found) = exes.iter().find(|p| {
        let name = name_of(p);
        name.contains("setup") || name.contains("install")
    }) {
        return Some((*found).clone());
    }

    let app_exe = app_exe.to_ascii_lowercase();
    let others: Vec<&&PathBuf> = exes.iter().filter(|p| name_of(p) != app_exe).collect();
    if let [only] = others.as_slice() {
        return Some((**only).clone());
    }
    if let [only] = exes.as_slice() {
        return Some((*only).clone());
    }

    files.iter().find(|p| has_ext(p, "msi")).cloned()
}

fn has_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}
