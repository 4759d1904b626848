//! Process handoff: detached launches, self-exit and restart verification.
//!
//! The running process never supervises its replacement. It starts the
//! installer (or the updated app) as a detached process, answers whoever
//! asked, and then exits on its own.

use crate::error::{Result, UpdraftError};
use crate::update::version::VersionIdentifier;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const SESSION_POLL: Duration = Duration::from_millis(25);

/// Starts processes that outlive the caller.
pub trait Launcher: Send + Sync {
    /// Start `program` with `args`, detached from this process.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Launch`] if the process cannot be started.
    fn launch(&self, program: &Path, args: &[String]) -> Result<u32>;
}

/// Launches with null stdio in a new process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

impl Launcher for DetachedLauncher {
    fn launch(&self, program: &Path, args: &[String]) -> Result<u32> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = program.parent()
            && dir.is_dir()
        {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|e| {
            UpdraftError::Launch(format!("cannot start {}: {e}", program.display()))
        })?;
        let pid = child.id();
        tracing::info!(program = %program.display(), pid, "launched detached process");

        // Reap the child if it finishes before we do.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(pid)
    }
}

/// Terminates the current process.
pub trait ExitHook: Send + Sync {
    fn exit(&self, code: i32);
}

/// Calls [`std::process::exit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl ExitHook for ProcessExit {
    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Coordinates the exit of the running process with the start of its
/// successor.
pub struct ProcessHandoff {
    launcher: Arc<dyn Launcher>,
    exit_hook: Arc<dyn ExitHook>,
    exit_delay: Duration,
    reported_version: VersionIdentifier,
    exit_requested: AtomicBool,
    session_active: Arc<AtomicBool>,
}

impl ProcessHandoff {
    #[must_use]
    pub fn new(
        launcher: Arc<dyn Launcher>,
        exit_hook: Arc<dyn ExitHook>,
        exit_delay: Duration,
        reported_version: VersionIdentifier,
    ) -> Self {
        Self {
            launcher,
            exit_hook,
            exit_delay,
            reported_version,
            exit_requested: AtomicBool::new(false),
            session_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handoff using real detached launches and [`std::process::exit`].
    #[must_use]
    pub fn system(exit_delay: Duration, reported_version: VersionIdentifier) -> Self {
        Self::new(
            Arc::new(DetachedLauncher),
            Arc::new(ProcessExit),
            exit_delay,
            reported_version,
        )
    }

    /// The version this process reports to liveness probes.
    #[must_use]
    pub fn reported_version(&self) -> &VersionIdentifier {
        &self.reported_version
    }

    /// Set while an update session runs. A scheduled exit waits for it to
    /// clear, so the process never goes down in the middle of replacing files.
    pub(crate) fn session_flag(&self) -> &AtomicBool {
        &self.session_active
    }

    /// Whether an exit has already been scheduled.
    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Schedule termination of this process after the configured delay.
    ///
    /// The delay gives the caller time to deliver its response before the
    /// process goes down. If an update session is still running when the
    /// delay ends, the exit waits until that session finishes. Returns
    /// `false` if an exit was already scheduled.
    pub fn request_exit(&self) -> bool {
        if self.exit_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!("exit already requested");
            return false;
        }

        tracing::info!(delay_ms = self.exit_delay.as_millis() as u64, "exiting for update handoff");
        let hook = Arc::clone(&self.exit_hook);
        let delay = self.exit_delay;
        let session_active = Arc::clone(&self.session_active);
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if session_active.load(Ordering::SeqCst) {
                tracing::info!("exit deferred until the update session finishes");
                while session_active.load(Ordering::SeqCst) {
                    std::thread::sleep(SESSION_POLL);
                }
            }
            hook.exit(0);
        });
        true
    }

    /// Start a prepared installer detached, passing it `args`.
    ///
    /// The installer is started before this process exits; it is expected to
    /// wait for file locks to be released.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Install`] if `installer` is not an executable
    /// file, or [`UpdraftError::Launch`] if it cannot be started.
    pub fn launch_installer(&self, installer: &Path, args: &[String]) -> Result<u32> {
        if !is_executable(installer) {
            return Err(UpdraftError::Install(format!(
                "installer is not an executable file: {}",
                installer.display()
            )));
        }

        if has_extension(installer, "msi") {
            let mut msi_args = vec!["/i".to_owned(), installer.to_string_lossy().to_string()];
            msi_args.extend(args.iter().cloned());
            return self.launcher.launch(&PathBuf::from("msiexec"), &msi_args);
        }
        self.launcher.launch(installer, args)
    }
}

/// Whether `path` is a regular file that can be started directly.
#[must_use]
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    if has_extension(path, "exe") || has_extension(path, "msi") {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Poll `probe` until it reports `expected` or `timeout` elapses.
///
/// `probe` returns the version string a running instance reports, or `None`
/// while nothing answers. Returns `true` once the reported version parses
/// equal to `expected`.
pub fn verify_restarted<F>(
    mut probe: F,
    expected: &VersionIdentifier,
    timeout: Duration,
    interval: Duration,
) -> bool
where
    F: FnMut() -> Option<String>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(reported) = probe() {
            let reported = VersionIdentifier::parse(&reported);
            if &reported == expected {
                tracing::info!(version = %reported, "restarted instance verified");
                return true;
            }
            tracing::debug!(reported = %reported, expected = %expected, "old instance still answering");
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(expected = %expected, "restart not verified before timeout");
            return false;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicI32;

    #[derive(Default)]
    struct RecordingLauncher {
        calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, program: &Path, args: &[String]) -> Result<u32> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(4242)
        }
    }

    struct RecordingExit(Arc<AtomicI32>);

    impl ExitHook for RecordingExit {
        fn exit(&self, code: i32) {
            self.0.store(code + 100, Ordering::SeqCst);
        }
    }

    fn handoff(launcher: Arc<RecordingLauncher>, exit: Arc<AtomicI32>) -> ProcessHandoff {
        ProcessHandoff::new(
            launcher,
            Arc::new(RecordingExit(exit)),
            Duration::from_millis(10),
            VersionIdentifier::parse("0.2.7"),
        )
    }

    #[test]
    fn request_exit_fires_once_after_delay() {
        let code = Arc::new(AtomicI32::new(-1));
        let handoff = handoff(Arc::new(RecordingLauncher::default()), Arc::clone(&code));

        assert!(handoff.request_exit());
        assert!(!handoff.request_exit());
        assert!(handoff.exit_requested());

        let deadline = Instant::now() + Duration::from_secs(5);
        while code.load(Ordering::SeqCst) == -1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(code.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn exit_waits_for_running_session() {
        let code = Arc::new(AtomicI32::new(-1));
        let handoff = handoff(Arc::new(RecordingLauncher::default()), Arc::clone(&code));

        handoff.session_flag().store(true, Ordering::SeqCst);
        assert!(handoff.request_exit());
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(code.load(Ordering::SeqCst), -1, "exited during a session");

        handoff.session_flag().store(false, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while code.load(Ordering::SeqCst) == -1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(code.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn launch_installer_requires_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let handoff = handoff(Arc::clone(&launcher), Arc::new(AtomicI32::new(-1)));

        let missing = dir.path().join("setup.exe");
        assert!(matches!(
            handoff.launch_installer(&missing, &[]),
            Err(UpdraftError::Install(_))
        ));

        std::fs::write(&missing, b"MZ").unwrap();
        let args = vec!["--target".to_owned(), "C:\\Updraft".to_owned()];
        assert_eq!(handoff.launch_installer(&missing, &args).unwrap(), 4242);

        let calls = launcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, missing);
        assert_eq!(calls[0].1, args);
    }

    #[test]
    fn msi_goes_through_msiexec() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(RecordingLauncher::default());
        let handoff = handoff(Arc::clone(&launcher), Arc::new(AtomicI32::new(-1)));
        let msi = dir.path().join("Updraft.msi");
        std::fs::write(&msi, b"msi").unwrap();

        handoff.launch_installer(&msi, &[]).unwrap();
        let calls = launcher.calls.lock().unwrap();
        assert_eq!(calls[0].0, PathBuf::from("msiexec"));
        assert_eq!(calls[0].1[0], "/i");
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_is_checked_on_unix() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("install.sh");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        assert!(!is_executable(&bin));
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&bin));
        assert!(!is_executable(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn detached_launcher_starts_process() {
        let pid = DetachedLauncher
            .launch(Path::new("/bin/sh"), &["-c".to_owned(), "exit 0".to_owned()])
            .unwrap();
        assert!(pid > 0);
    }

    #[test]
    fn detached_launcher_reports_missing_program() {
        let err = DetachedLauncher
            .launch(Path::new("/definitely/not/here/updraft"), &[])
            .unwrap_err();
        assert!(matches!(err, UpdraftError::Launch(_)));
    }

    #[test]
    fn verify_restarted_waits_for_new_version() {
        let mut answers = vec![None, Some("0.0.1".to_owned()), Some("v0.2.7".to_owned())].into_iter();
        let ok = verify_restarted(
            || answers.next().flatten(),
            &VersionIdentifier::parse("0.2.7"),
            Duration::from_secs(5),
            Duration::from_millis(1),
        );
        assert!(ok);
    }

    #[test]
    fn verify_restarted_times_out() {
        let ok = verify_restarted(
            || Some("0.0.1".to_owned()),
            &VersionIdentifier::parse("0.2.7"),
            Duration::from_millis(30),
            Duration::from_millis(5),
        );
        assert!(!ok);
    }
}
