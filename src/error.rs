//! Error types for the update engine.

/// Top-level error type for update checks, downloads and installs.
#[derive(Debug, thiserror::Error)]
pub enum UpdraftError {
    /// Release feed or artifact transfer failed. Retryable by the caller.
    #[error("network error: {0}")]
    Network(String),

    /// The release feed refused the request because of rate limiting.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The release feed answered with something that is not a usable manifest.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// No artifact in the manifest can be installed on this machine.
    #[error("no compatible artifact: {0}")]
    NoCompatibleArtifact(String),

    /// Downloaded bytes do not match the advertised size or digest.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Disk image could not be mounted or its contents could not be located.
    #[error("mount error: {0}")]
    Mount(String),

    /// Disk image could not be detached, even with force.
    #[error("unmount error: {0}")]
    Unmount(String),

    /// Replacing the installation failed.
    ///
    /// `restored` is `true` when the previous installation was put back from
    /// its backup snapshot. When `false` the target may be partially written
    /// and needs manual attention.
    #[error("copy error (restored: {restored}): {message}")]
    Copy {
        /// Whether the installation was restored from backup.
        restored: bool,
        /// Description of the failure.
        message: String,
    },

    /// A detached process (installer or relaunched app) could not be started.
    #[error("launch error: {0}")]
    Launch(String),

    /// Installer payload is unusable (missing executable, bad archive).
    #[error("install error: {0}")]
    Install(String),

    /// Another update session is already running in this process.
    #[error("an update session is already in progress")]
    SessionBusy,

    /// The session was cancelled before any destructive step.
    #[error("update cancelled: {0}")]
    Cancelled(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdraftError {
    /// Returns `true` if the caller may simply retry the whole attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited(_) | Self::Integrity(_) | Self::Cancelled(_)
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdraftError>;
