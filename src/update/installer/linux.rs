//! Linux archive install.
//!
//! The archive is only opened once it is fully downloaded. It is extracted
//! into scratch space first; each file is then copied next to its
//! destination and renamed over it, so a running executable is replaced
//! rather than rewritten in place.

use super::{InstallContext, InstallResult, extract_zip};
use crate::error::{Result, UpdraftError};
use crate::update::handoff::Launcher;
use crate::update::platform::PlatformTag;
use std::path::{Path, PathBuf};

const TAG: PlatformTag = PlatformTag::LinuxZip;

pub(crate) fn install(
    artifact: &Path,
    ctx: &InstallContext<'_>,
    launcher: &dyn Launcher,
) -> Result<InstallResult> {
    ctx.check_cancelled("extract")?;
    let staging = ctx.scratch.subdir("staging")?;
    let files = extract_zip(artifact, &staging)?;
    ctx.stage(TAG, "extracted");

    let exe_name = ctx.config.executable_name();
    let payload = payload_root(&staging, &exe_name)?;

    ctx.check_cancelled("replace")?;
    let root = ctx.target.root();
    std::fs::create_dir_all(root)?;

    let mut replaced = 0_usize;
    for file in &files {
        let Ok(relative) = file.strip_prefix(&payload) else {
            continue;
        };
        let dest = root.join(relative);
        replace_file(file, &dest).map_err(|e| UpdraftError::Copy {
            restored: false,
            message: format!("cannot replace {}: {e}", dest.display()),
        })?;
        replaced += 1;
    }
    tracing::info!(files = replaced, install_dir = %root.display(), "archive installed");
    ctx.stage(TAG, "replaced");

    let mut result = InstallResult::installed(TAG, root.to_path_buf());
    if ctx.config.relaunch {
        let exe = root.join(&exe_name);
        match launcher.launch(&exe, &[]) {
            Ok(pid) => {
                tracing::info!(pid, "updated app relaunched");
                result.relaunched = true;
                ctx.stage(TAG, "launched");
            }
            Err(e) => {
                tracing::warn!(error = %e, "relaunch failed; update is installed");
                result.launch_error = Some(e.to_string());
            }
        }
    }
    Ok(result)
}

/// Directory in `staging` that holds the executable: the staging dir itself,
/// or a single wrapping directory.
fn payload_root(staging: &Path, exe_name: &str) -> Result<PathBuf> {
    if staging.join(exe_name).is_file() {
        return Ok(staging.to_path_buf());
    }

    let entries: Vec<PathBuf> = std::fs::read_dir(staging)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    if let [only] = entries.as_slice()
        && only.is_dir()
        && only.join(exe_name).is_file()
    {
        return Ok(only.clone());
    }

    Err(UpdraftError::Install(format!(
        "archive does not contain the executable {exe_name}"
    )))
}

/// Copy `src` beside `dest`, then rename it over `dest`.
fn replace_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let incoming = dir.join(format!(".{name}.updraft-new"));

    std::fs::copy(src, &incoming)?;
    if let Err(e) = std::fs::rename(&incoming, dest) {
        let _ = std::fs::remove_file(&incoming);
        return Err(e);
    }
    Ok(())
}
