//! Platform tags for release artifacts and the machine we run on.
//!
//! The installer is always chosen from the tag of the artifact itself. The
//! host platform is only used to decide which artifacts are compatible.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The installation model an artifact is packaged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformTag {
    /// Installer payload that replaces the install directory on its own.
    Windows,
    /// Disk image holding an `.app` bundle.
    MacosDmg,
    /// Archive holding the executable and optional extras.
    LinuxZip,
}

impl PlatformTag {
    /// Wire name, as reported in `updaterType`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::MacosDmg => "macos_dmg",
            Self::LinuxZip => "linux_zip",
        }
    }

    /// Parse a wire name or a plain OS name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "windows" | "win" | "win32" | "win64" => Some(Self::Windows),
            "macos_dmg" | "macos" | "darwin" | "mac" | "osx" => Some(Self::MacosDmg),
            "linux_zip" | "linux" => Some(Self::LinuxZip),
            _ => None,
        }
    }

    /// Tag expected by the OS this binary was compiled for.
    #[must_use]
    pub fn current() -> Option<Self> {
        Self::for_os(std::env::consts::OS)
    }

    /// Tag expected by an OS name as reported by `std::env::consts::OS`.
    #[must_use]
    pub fn for_os(os: &str) -> Option<Self> {
        match os {
            "windows" => Some(Self::Windows),
            "macos" => Some(Self::MacosDmg),
            "linux" => Some(Self::LinuxZip),
            _ => None,
        }
    }

    /// Classify a release asset by its file name.
    ///
    /// - `*.dmg` → macOS disk image
    /// - `*.exe`, `*.msi`, or a `.zip` naming windows → Windows installer
    /// - a `.zip` naming linux → Linux archive
    #[must_use]
    pub fn from_asset_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let is_archive = lower.ends_with(".zip");

        if lower.ends_with(".dmg") {
            return Some(Self::MacosDmg);
        }
        if lower.ends_with(".exe") || lower.ends_with(".msi") {
            return Some(Self::Windows);
        }
        if is_archive
            && (lower.contains("windows") || lower.contains("win64") || lower.contains("win32"))
        {
            return Some(Self::Windows);
        }
        if is_archive && lower.contains("linux") {
            return Some(Self::LinuxZip);
        }
        None
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture an artifact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
    /// Fat/universal artifact or one whose name carries no architecture.
    Universal,
}

impl Arch {
    /// Architecture this binary was compiled for.
    #[must_use]
    pub fn current() -> Self {
        Self::for_arch(std::env::consts::ARCH)
    }

    /// Map `std::env::consts::ARCH` values.
    #[must_use]
    pub fn for_arch(arch: &str) -> Self {
        match arch {
            "x86_64" => Self::X86_64,
            "aarch64" => Self::Aarch64,
            _ => Self::Universal,
        }
    }

    /// Parse a config value.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "x64" | "amd64" => Some(Self::X86_64),
            "aarch64" | "arm64" => Some(Self::Aarch64),
            "universal" => Some(Self::Universal),
            _ => None,
        }
    }

    /// Read the architecture out of an asset file name.
    #[must_use]
    pub fn from_asset_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("aarch64") || lower.contains("arm64") {
            Self::Aarch64
        } else if lower.contains("x86_64")
            || lower.contains("x64")
            || lower.contains("amd64")
            || lower.contains("win64")
        {
            Self::X86_64
        } else {
            Self::Universal
        }
    }

    /// Whether an artifact built for `self` runs on a `host` CPU.
    #[must_use]
    pub fn runs_on(self, host: Self) -> bool {
        self == Self::Universal || self == host
    }
}

/// The platform an update is being installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPlatform {
    pub tag: PlatformTag,
    pub arch: Arch,
}

impl HostPlatform {
    #[must_use]
    pub fn new(tag: PlatformTag, arch: Arch) -> Self {
        Self { tag, arch }
    }

    /// Whether an artifact with the given tag and architecture can be
    /// installed here.
    #[must_use]
    pub fn accepts(&self, tag: PlatformTag, arch: Arch) -> bool {
        tag == self.tag && arch.runs_on(self.arch)
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.tag, self.arch)
    }
}
