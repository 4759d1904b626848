//! Centralized application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux | Windows |
//! |---------|-------|-------|---------|
//! | App data | `~/Library/Application Support/updraft/` | `~/.local/share/updraft/` | `%APPDATA%\updraft\` |
//! | Config | `~/Library/Application Support/updraft/` | `~/.config/updraft/` | `%APPDATA%\updraft\` |
//! | Cache | `~/Library/Caches/updraft/` | `~/.cache/updraft/` | `%LOCALAPPDATA%\updraft\` |
//!
//! # Environment Overrides
//!
//! - `UPDRAFT_DATA_DIR`: overrides [`data_dir`]
//! - `UPDRAFT_CONFIG_DIR`: overrides [`config_dir`]
//! - `UPDRAFT_CACHE_DIR`: overrides [`cache_dir`]

use std::path::PathBuf;

/// Prefix of every per-session scratch directory.
pub const SCRATCH_PREFIX: &str = "updraft-update-";

/// Application data root directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| std::env::temp_dir().join("updraft-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| std::env::temp_dir().join("updraft-config"))
}

/// Application cache directory.
///
/// Downloads and scratch space live here; everything in it is expendable.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| std::env::temp_dir().join("updraft-cache"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Root of per-session scratch directories (`cache_dir()/updates/`).
#[must_use]
pub fn scratch_dir() -> PathBuf {
    cache_dir().join("updates")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_is_nonempty() {
        assert!(!data_dir().as_os_str().is_empty());
    }

    #[test]
    fn config_file_is_toml() {
        let path = config_file();
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("config.toml")
        );
    }

    #[test]
    fn logs_dir_under_data_dir() {
        assert!(logs_dir().starts_with(data_dir()));
    }

    #[test]
    fn scratch_dir_under_cache_dir() {
        let dir = scratch_dir();
        assert!(dir.starts_with(cache_dir()));
        assert!(dir.ends_with("updates"));
    }
}
