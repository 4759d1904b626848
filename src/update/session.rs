//! Update sessions.
//!
//! [`UpdateEngine`] runs at most one update attempt at a time. A second
//! request while one is in flight is rejected with
//! [`UpdraftError::SessionBusy`]. Every step is blocking and strictly
//! sequential; callers on an async runtime should move calls onto a blocking
//! thread.

use crate::config::UpdraftConfig;
use crate::error::{Result, UpdraftError};
use crate::progress::ProgressCallback;
use crate::update::checker::{UpdateCheckResult, UpdateChecker};
use crate::update::fetcher::{ArtifactFetcher, DownloadRequest};
use crate::update::handoff::ProcessHandoff;
use crate::update::installer::{
    InstallContext, InstallResult, InstallationTarget, PlatformInstaller,
};
use crate::update::manifest::{ReleaseAsset, UpdateManifest};
use crate::update::platform::{Arch, HostPlatform, PlatformTag};
use crate::update::scratch::ScratchSpace;
use crate::update::version::VersionIdentifier;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where an update attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Downloading,
    Downloaded,
    Installing,
    /// Files replaced by this process.
    Installed,
    /// Installer or deferred install waiting for a run-updater request.
    AwaitingHandoff,
    /// Detached installer started; this process is exiting.
    HandedOff,
    Failed,
}

/// One update attempt.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    /// Manifest the artifact was selected from, if a check ran first.
    pub manifest: Option<Arc<UpdateManifest>>,
    pub artifact_path: PathBuf,
    /// Backup left on disk by a failed install.
    pub backup_path: Option<PathBuf>,
    pub state: SessionState,
}

/// Result of a download request.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub updater_type: PlatformTag,
    /// Prepared installer (Windows), artifact awaiting install, or the
    /// updated installation.
    pub updater_path: PathBuf,
    pub session: UpdateSession,
    /// Present when this request also installed.
    pub install: Option<InstallResult>,
}

impl DownloadOutcome {
    /// Wire shape answered to download requests.
    #[must_use]
    pub fn to_response(&self) -> DownloadResponse {
        DownloadResponse {
            success: true,
            data: DownloadData {
                updater_type: self.updater_type,
                updater_path: self.updater_path.to_string_lossy().to_string(),
                installed: self.install.as_ref().is_some_and(|r| r.installed),
            },
        }
    }
}

/// `{success, data: {updaterType, updaterPath}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub data: DownloadData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadData {
    pub updater_type: PlatformTag,
    pub updater_path: String,
    pub installed: bool,
}

/// Result of a run-updater request.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub updater_type: PlatformTag,
    /// Pid of the detached installer, when one was started.
    pub installer_pid: Option<u32>,
    /// Present when the install ran in this process.
    pub install: Option<InstallResult>,
    /// Whether this process is going to exit.
    pub exiting: bool,
}

/// A downloaded artifact waiting for a run-updater request.
struct PendingUpdater {
    updater_type: PlatformTag,
    path: PathBuf,
    args: Vec<String>,
    scratch: ScratchSpace,
    session: UpdateSession,
}

/// Clears the single-session flag on drop.
struct SessionGuard<'a>(&'a AtomicBool);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Checks, downloads and installs updates.
pub struct UpdateEngine {
    config: UpdraftConfig,
    current_version: VersionIdentifier,
    checker: UpdateChecker,
    fetcher: ArtifactFetcher,
    installer: PlatformInstaller,
    handoff: Arc<ProcessHandoff>,
    last_manifest: Mutex<Option<Arc<UpdateManifest>>>,
    pending: Mutex<Option<PendingUpdater>>,
}

impl UpdateEngine {
    /// Engine using the real platform tools.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Config`] if the host platform cannot be
    /// determined.
    pub fn new(config: UpdraftConfig) -> Result<Self> {
        let handoff = Arc::new(ProcessHandoff::system(
            Duration::from_millis(config.host.exit_delay_ms),
            config.current_version(),
        ));
        let host = config.host_platform()?;
        Ok(Self::with_parts(config, host, PlatformInstaller::default(), handoff))
    }

    /// Engine with injected installer tools and handoff.
    #[must_use]
    pub fn with_parts(
        config: UpdraftConfig,
        host: HostPlatform,
        installer: PlatformInstaller,
        handoff: Arc<ProcessHandoff>,
    ) -> Self {
        let checker = UpdateChecker::new(&config.update, host);
        let fetcher = ArtifactFetcher::new(&config.download, config.update.user_agent.clone());
        Self {
            current_version: config.current_version(),
            config,
            checker,
            fetcher,
            installer,
            handoff,
            last_manifest: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn current_version(&self) -> &VersionIdentifier {
        &self.current_version
    }

    #[must_use]
    pub fn host(&self) -> HostPlatform {
        self.checker.host()
    }

    #[must_use]
    pub fn config(&self) -> &UpdraftConfig {
        &self.config
    }

    #[must_use]
    pub fn handoff(&self) -> &ProcessHandoff {
        &self.handoff
    }

    /// Whether an update session is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.handoff.session_flag().load(Ordering::SeqCst)
    }

    /// Check the feed for a newer release.
    ///
    /// The manifest is remembered so a following download can take the
    /// artifact type, size and digest from it.
    #[must_use]
    pub fn check_for_update(&self) -> UpdateCheckResult {
        let result = self.checker.check_for_update(&self.current_version);
        if let Some(manifest) = &result.manifest
            && let Ok(mut last) = self.last_manifest.lock()
        {
            *last = Some(Arc::clone(manifest));
        }
        result
    }

    /// Download the artifact at `url` and, when `auto_install` is set, install
    /// it (or on Windows, start the installer and exit).
    ///
    /// Without `auto_install` the artifact is kept ready for
    /// [`UpdateEngine::run_updater`].
    ///
    /// # Errors
    ///
    /// - [`UpdraftError::SessionBusy`] if another session is running
    /// - [`UpdraftError::NoCompatibleArtifact`] if the artifact is not for
    ///   this machine
    /// - any download or install error
    pub fn download_and_install(
        &self,
        url: &str,
        auto_install: bool,
        cancel: Option<&CancellationToken>,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let _guard = self.begin_session()?;
        let manifest = self.last_manifest.lock().ok().and_then(|m| m.clone());
        let (updater_type, asset) = self.resolve_artifact(url, manifest.as_deref())?;

        let scratch = ScratchSpace::create(&self.config.scratch_root())?;
        let artifact_path = scratch.join(artifact_file_name(url, asset.as_ref())?);
        let mut session = UpdateSession {
            manifest,
            artifact_path: artifact_path.clone(),
            backup_path: None,
            state: SessionState::Downloading,
        };

        let request = DownloadRequest {
            url,
            dest: &artifact_path,
            expected_size: asset.as_ref().and_then(|a| a.size),
            sha256: asset.as_ref().and_then(|a| a.sha256.as_deref()),
        };
        if let Err(e) = self.fetcher.fetch(&request, progress, cancel) {
            session.state = SessionState::Failed;
            tracing::error!(error = %e, url, "artifact download failed");
            scratch.retain("download failed");
            return Err(e);
        }
        session.state = SessionState::Downloaded;
        self.discard_pending();

        match updater_type {
            PlatformTag::Windows => {
                self.prepare_windows(artifact_path, auto_install, scratch, session, cancel, progress)
            }
            PlatformTag::MacosDmg | PlatformTag::LinuxZip if auto_install => {
                let install = self.install_now(
                    updater_type,
                    &artifact_path,
                    scratch,
                    &mut session,
                    cancel,
                    progress,
                )?;
                Ok(DownloadOutcome {
                    updater_type,
                    updater_path: install.updater_path.clone(),
                    session,
                    install: Some(install),
                })
            }
            PlatformTag::MacosDmg | PlatformTag::LinuxZip => {
                session.state = SessionState::AwaitingHandoff;
                let outcome = DownloadOutcome {
                    updater_type,
                    updater_path: artifact_path.clone(),
                    session: session.clone(),
                    install: None,
                };
                self.set_pending(PendingUpdater {
                    updater_type,
                    path: artifact_path,
                    args: Vec::new(),
                    scratch,
                    session,
                });
                Ok(outcome)
            }
        }
    }

    /// Run the updater prepared by an earlier download.
    ///
    /// Windows: start the installer detached, then exit. Other models: install
    /// the downloaded artifact now.
    ///
    /// # Errors
    ///
    /// - [`UpdraftError::SessionBusy`] if another session is running
    /// - [`UpdraftError::Install`] if `updater_path` is not the prepared updater
    /// - [`UpdraftError::Launch`] if the installer cannot be started (the
    ///   updater stays prepared)
    /// - any install error
    pub fn run_updater(&self, updater_path: &Path) -> Result<RunOutcome> {
        let _guard = self.begin_session()?;

        let pending = self
            .take_pending(updater_path)
            .ok_or_else(|| {
                UpdraftError::Install(format!(
                    "no prepared updater at {}",
                    updater_path.display()
                ))
            })?;

        match pending.updater_type {
            PlatformTag::Windows => {
                let pid = match self.handoff.launch_installer(&pending.path, &pending.args) {
                    Ok(pid) => pid,
                    Err(e) => {
                        tracing::error!(error = %e, "installer launch failed");
                        self.set_pending(pending);
                        return Err(e);
                    }
                };
                pending.scratch.retain("installer runs from scratch space");
                self.handoff.request_exit();
                Ok(RunOutcome {
                    updater_type: PlatformTag::Windows,
                    installer_pid: Some(pid),
                    install: None,
                    exiting: true,
                })
            }
            updater_type @ (PlatformTag::MacosDmg | PlatformTag::LinuxZip) => {
                let PendingUpdater {
                    path,
                    scratch,
                    mut session,
                    ..
                } = pending;
                let install =
                    self.install_now(updater_type, &path, scratch, &mut session, None, None)?;
                Ok(RunOutcome {
                    updater_type,
                    installer_pid: None,
                    exiting: self.handoff.exit_requested(),
                    install: Some(install),
                })
            }
        }
    }

    /// Schedule termination of this process.
    ///
    /// A session in progress is allowed to finish first; once files are
    /// being replaced the attempt runs to completion or restore.
    pub fn request_exit(&self) -> bool {
        self.handoff.request_exit()
    }

    fn begin_session(&self) -> Result<SessionGuard<'_>> {
        let busy = self.handoff.session_flag();
        if busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("update request rejected: session already in progress");
            return Err(UpdraftError::SessionBusy);
        }
        Ok(SessionGuard(busy))
    }

    /// Work out the installation model for `url`.
    ///
    /// The artifact's own tag decides: from the manifest when the URL is one
    /// of its assets, otherwise from the file name. The host OS alone never
    /// picks the model.
    fn resolve_artifact(
        &self,
        url: &str,
        manifest: Option<&UpdateManifest>,
    ) -> Result<(PlatformTag, Option<ReleaseAsset>)> {
        let host = self.host();

        if let Some(asset) = manifest.and_then(|m| m.asset_by_url(url)) {
            if !host.accepts(asset.platform_tag, asset.arch) {
                return Err(UpdraftError::NoCompatibleArtifact(format!(
                    "{} is a {}/{:?} artifact; this machine is {host}",
                    asset.name, asset.platform_tag, asset.arch
                )));
            }
            return Ok((asset.platform_tag, Some(asset.clone())));
        }

        let name = url_file_name(url)?;
        let tag = PlatformTag::from_asset_name(&name).ok_or_else(|| {
            UpdraftError::NoCompatibleArtifact(format!("cannot tell the artifact type of {name}"))
        })?;
        let arch = Arch::from_asset_name(&name);
        if !host.accepts(tag, arch) {
            return Err(UpdraftError::NoCompatibleArtifact(format!(
                "{name} is a {tag}/{arch:?} artifact; this machine is {host}"
            )));
        }
        Ok((tag, None))
    }

    fn prepare_windows(
        &self,
        artifact: PathBuf,
        auto_install: bool,
        scratch: ScratchSpace,
        mut session: UpdateSession,
        cancel: Option<&CancellationToken>,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadOutcome> {
        let target = InstallationTarget::detect(&self.config.install, PlatformTag::Windows)?;
        let prepared = {
            let ctx = InstallContext {
                target: &target,
                scratch: &scratch,
                config: &self.config.install,
                cancel,
                progress,
            };
            self.installer.install(PlatformTag::Windows, &artifact, &ctx)
        };
        let prepared = match prepared {
            Ok(p) => p,
            Err(e) => {
                session.state = SessionState::Failed;
                scratch.retain("installer preparation failed");
                return Err(e);
            }
        };

        if auto_install {
            if let Err(e) = self
                .handoff
                .launch_installer(&prepared.updater_path, &prepared.updater_args)
            {
                tracing::error!(
                    error = %e,
                    installer = %prepared.updater_path.display(),
                    "installer launch failed; updater stays prepared"
                );
                session.state = SessionState::AwaitingHandoff;
                self.set_pending(PendingUpdater {
                    updater_type: PlatformTag::Windows,
                    path: prepared.updater_path,
                    args: prepared.updater_args,
                    scratch,
                    session,
                });
                return Err(e);
            }
            session.state = SessionState::HandedOff;
            scratch.retain("installer runs from scratch space");
            self.handoff.request_exit();
            return Ok(DownloadOutcome {
                updater_type: PlatformTag::Windows,
                updater_path: prepared.updater_path.clone(),
                session,
                install: Some(prepared),
            });
        }

        session.state = SessionState::AwaitingHandoff;
        let outcome = DownloadOutcome {
            updater_type: PlatformTag::Windows,
            updater_path: prepared.updater_path.clone(),
            session: session.clone(),
            install: Some(prepared.clone()),
        };
        self.set_pending(PendingUpdater {
            updater_type: PlatformTag::Windows,
            path: prepared.updater_path,
            args: prepared.updater_args,
            scratch,
            session,
        });
        Ok(outcome)
    }

    /// Install in this process. Scratch space is removed on success and kept
    /// on failure.
    fn install_now(
        &self,
        updater_type: PlatformTag,
        artifact: &Path,
        scratch: ScratchSpace,
        session: &mut UpdateSession,
        cancel: Option<&CancellationToken>,
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallResult> {
        session.state = SessionState::Installing;
        let target = match InstallationTarget::detect(&self.config.install, updater_type) {
            Ok(t) => t,
            Err(e) => {
                session.state = SessionState::Failed;
                scratch.retain("installation target not found");
                return Err(e);
            }
        };

        let result = {
            let ctx = InstallContext {
                target: &target,
                scratch: &scratch,
                config: &self.config.install,
                cancel,
                progress,
            };
            self.installer.install(updater_type, artifact, &ctx)
        };

        match result {
            Ok(install) => {
                session.state = SessionState::Installed;
                scratch.cleanup();
                if install.relaunched && self.config.install.exit_after_install {
                    self.handoff.request_exit();
                }
                Ok(install)
            }
            Err(e) => {
                session.state = SessionState::Failed;
                session.backup_path = find_backup(scratch.path());
                let kept = scratch.retain("install failed");
                tracing::error!(
                    error = %e,
                    updater_type = %updater_type,
                    scratch = %kept.display(),
                    backup = ?session.backup_path,
                    "update session failed"
                );
                Err(e)
            }
        }
    }

    fn set_pending(&self, pending: PendingUpdater) {
        tracing::info!(
            updater_type = %pending.updater_type,
            path = %pending.path.display(),
            "updater ready"
        );
        match self.pending.lock() {
            Ok(mut slot) => *slot = Some(pending),
            Err(poisoned) => *poisoned.into_inner() = Some(pending),
        }
    }

    fn take_pending(&self, path: &Path) -> Option<PendingUpdater> {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|p| p.path == path) {
            slot.take()
        } else {
            None
        }
    }

    /// Drop an updater prepared by an earlier download. Its scratch space
    /// stays on disk.
    fn discard_pending(&self) {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.take() {
            tracing::debug!(state = ?old.session.state, "superseding prepared updater");
            old.scratch.retain("superseded by a newer download");
        }
    }
}

fn url_file_name(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url)
        .map_err(|e| UpdraftError::Network(format!("invalid download URL {url}: {e}")))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| UpdraftError::Network(format!("download URL has no file name: {url}")))
}

fn artifact_file_name(url: &str, asset: Option<&ReleaseAsset>) -> Result<String> {
    let name = match asset {
        Some(asset) => asset.name.clone(),
        None => url_file_name(url)?,
    };
    let safe = Path::new(&name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "..")
        .ok_or_else(|| UpdraftError::Install(format!("unusable artifact name: {name}")))?;
    Ok(safe)
}

fn find_backup(scratch: &Path) -> Option<PathBuf> {
    std::fs::read_dir(scratch)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("backup-"))
        })
}
