//! Configuration types for the update engine.

use crate::error::{Result, UpdraftError};
use crate::update::platform::{Arch, HostPlatform, PlatformTag};
use crate::update::version::VersionIdentifier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the installation path in installer arguments.
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdraftConfig {
    /// Release feed and version check settings.
    pub update: UpdateConfig,
    /// Artifact download settings.
    pub download: DownloadConfig,
    /// Installation target and platform settings.
    pub install: InstallConfig,
    /// Host bridge settings.
    pub host: HostConfig,
}

/// Release feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// URL of the "latest release" document.
    pub feed_url: String,
    /// User-Agent header sent with every request.
    pub user_agent: String,
    /// Timeout for the whole manifest request, in seconds.
    pub check_timeout_secs: u64,
    /// Offer prerelease builds as updates.
    pub include_prereleases: bool,
    /// Override for the running version (defaults to the crate version).
    pub current_version: Option<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://api.github.com/repos/saorsa-labs/updraft/releases/latest".to_owned(),
            user_agent: format!("updraft/{} (self-update)", env!("CARGO_PKG_VERSION")),
            check_timeout_secs: 10,
            include_prereleases: false,
            current_version: None,
        }
    }
}

/// Artifact download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Connection timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Lower bound of the overall transfer timeout, in seconds.
    pub min_timeout_secs: u64,
    /// Upper bound of the overall transfer timeout, in seconds.
    pub max_timeout_secs: u64,
    /// Slowest transfer rate still considered healthy. The overall timeout
    /// grows with the expected artifact size at this rate.
    pub min_throughput_bytes_per_sec: u64,
    /// Free space required on top of the artifact size.
    pub disk_headroom_bytes: u64,
    /// Root for per-session scratch directories (defaults to the cache dir).
    pub scratch_dir: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            min_timeout_secs: 120,
            max_timeout_secs: 1800,
            min_throughput_bytes_per_sec: 256 * 1024,
            disk_headroom_bytes: 64 * 1024 * 1024,
            scratch_dir: None,
        }
    }
}

impl DownloadConfig {
    /// Overall transfer timeout for an artifact of `expected_bytes`.
    #[must_use]
    pub fn timeout_for(&self, expected_bytes: Option<u64>) -> Duration {
        let min = self.min_timeout_secs;
        let max = self.max_timeout_secs.max(min);
        let secs = match expected_bytes {
            Some(bytes) => {
                let rate = self.min_throughput_bytes_per_sec.max(1);
                min.saturating_add(bytes / rate).min(max)
            }
            None => max,
        };
        Duration::from_secs(secs)
    }
}

/// Installation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Application name; the macOS bundle is expected at `<app_name>.app`.
    pub app_name: String,
    /// Executable file name inside the install directory.
    pub executable_name: Option<String>,
    /// Install location override. Detected from the running executable when
    /// unset.
    pub install_dir: Option<PathBuf>,
    /// Platform tag override (`windows`, `macos_dmg`, `linux_zip`).
    pub platform: Option<String>,
    /// Architecture override (`x86_64`, `aarch64`).
    pub arch: Option<String>,
    /// Relaunch the application after a macOS or Linux install.
    pub relaunch: bool,
    /// Exit the running process after a completed install.
    pub exit_after_install: bool,
    /// Arguments passed to the Windows installer; `{target}` is replaced by
    /// the installation directory.
    pub windows_installer_args: Vec<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            app_name: "Updraft".to_owned(),
            executable_name: None,
            install_dir: None,
            platform: None,
            arch: None,
            relaunch: true,
            exit_after_install: true,
            windows_installer_args: vec!["--target".to_owned(), TARGET_PLACEHOLDER.to_owned()],
        }
    }
}

impl InstallConfig {
    /// Executable file name, defaulting to the lowercased app name.
    #[must_use]
    pub fn executable_name(&self) -> String {
        self.executable_name.clone().unwrap_or_else(|| {
            let base = self.app_name.to_ascii_lowercase();
            if cfg!(target_os = "windows") {
                format!("{base}.exe")
            } else {
                base
            }
        })
    }

    /// Installer arguments with the target path substituted.
    #[must_use]
    pub fn installer_args(&self, target: &Path) -> Vec<String> {
        let target = target.to_string_lossy();
        self.windows_installer_args
            .iter()
            .map(|arg| arg.replace(TARGET_PLACEHOLDER, &target))
            .collect()
    }
}

/// Host bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Delay between answering an exit request and terminating, in ms.
    pub exit_delay_ms: u64,
    /// Request channel capacity.
    pub request_capacity: usize,
    /// Event broadcast capacity.
    pub event_capacity: usize,
    /// Also write logs to a daily file in the logs directory.
    pub log_to_file: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            exit_delay_ms: 300,
            request_capacity: 64,
            event_capacity: 128,
            log_to_file: true,
        }
    }
}

impl UpdraftConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| UpdraftError::Config(e.to_string()))
    }

    /// Load `path` if it exists, otherwise return the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.is_file() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdraftError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The version this process reports and compares against.
    #[must_use]
    pub fn current_version(&self) -> VersionIdentifier {
        let raw = self
            .update
            .current_version
            .as_deref()
            .unwrap_or(env!("CARGO_PKG_VERSION"));
        VersionIdentifier::parse(raw)
    }

    /// The platform updates are installed for, honouring overrides.
    ///
    /// # Errors
    ///
    /// Returns [`UpdraftError::Config`] for an unknown override value or an
    /// unsupported OS.
    pub fn host_platform(&self) -> Result<HostPlatform> {
        let tag = match self.install.platform.as_deref() {
            Some(raw) => PlatformTag::parse(raw)
                .ok_or_else(|| UpdraftError::Config(format!("unknown platform override: {raw}")))?,
            None => PlatformTag::current().ok_or_else(|| {
                UpdraftError::Config(format!(
                    "self-update is not supported on {}",
                    std::env::consts::OS
                ))
            })?,
        };
        let arch = match self.install.arch.as_deref() {
            Some(raw) => Arch::parse(raw)
                .ok_or_else(|| UpdraftError::Config(format!("unknown arch override: {raw}")))?,
            None => Arch::current(),
        };
        Ok(HostPlatform::new(tag, arch))
    }

    /// Root directory for per-session scratch space.
    #[must_use]
    pub fn scratch_root(&self) -> PathBuf {
        self.download
            .scratch_dir
            .clone()
            .unwrap_or_else(crate::updraft_dirs::scratch_dir)
    }
}
