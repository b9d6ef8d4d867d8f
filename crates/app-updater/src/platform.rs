//! Host platform identification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating system family an artifact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Win,
    Mac,
    LinuxGeneric,
}

impl Platform {
    /// Parse the platform spellings found in feeds.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "win" | "win32" | "windows" => Some(Self::Win),
            "mac" | "macos" | "darwin" | "osx" => Some(Self::Mac),
            "linux" | "linux-generic" => Some(Self::LinuxGeneric),
            _ => None,
        }
    }

    /// Suffix appended to channel feed files (`latest-mac.yml`).
    pub fn feed_suffix(&self) -> &'static str {
        match self {
            Self::Win => "",
            Self::Mac => "-mac",
            Self::LinuxGeneric => "-linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Win => "win",
            Self::Mac => "mac",
            Self::LinuxGeneric => "linux-generic",
        })
    }
}

/// CPU architecture an artifact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
    Ia32,
    /// Runs on every architecture of its platform (fat binaries)
    Universal,
}

impl Arch {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Some(Self::X64),
            "arm64" | "aarch64" => Some(Self::Arm64),
            "ia32" | "x86" | "i686" => Some(Self::Ia32),
            "universal" => Some(Self::Universal),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
            Self::Ia32 => "ia32",
            Self::Universal => "universal",
        })
    }
}

/// The platform the client is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPlatform {
    pub platform: Platform,
    pub arch: Arch,
}

impl HostPlatform {
    pub fn new(platform: Platform, arch: Arch) -> Self {
        Self { platform, arch }
    }

    /// Detect the platform this binary was compiled for.
    ///
    /// Unknown operating systems are treated as generic Linux-like hosts.
    pub fn current() -> Self {
        let platform = if cfg!(target_os = "windows") {
            Platform::Win
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::LinuxGeneric
        };

        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "x86") {
            Arch::Ia32
        } else {
            Arch::X64
        };

        Self { platform, arch }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.platform, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_aliases() {
        assert_eq!(Platform::from_name("win32"), Some(Platform::Win));
        assert_eq!(Platform::from_name("darwin"), Some(Platform::Mac));
        assert_eq!(Platform::from_name("linux"), Some(Platform::LinuxGeneric));
        assert_eq!(Platform::from_name("amiga"), None);
    }

    #[test]
    fn test_arch_aliases() {
        assert_eq!(Arch::from_name("amd64"), Some(Arch::X64));
        assert_eq!(Arch::from_name("aarch64"), Some(Arch::Arm64));
        assert_eq!(Arch::from_name("sparc"), None);
    }

    #[test]
    fn test_current_platform() {
        let host = HostPlatform::current();

        #[cfg(target_os = "windows")]
        assert_eq!(host.platform, Platform::Win);

        #[cfg(target_os = "macos")]
        assert_eq!(host.platform, Platform::Mac);

        #[cfg(target_os = "linux")]
        assert_eq!(host.platform, Platform::LinuxGeneric);

        #[cfg(target_arch = "x86_64")]
        assert_eq!(host.arch, Arch::X64);

        #[cfg(target_arch = "aarch64")]
        assert_eq!(host.arch, Arch::Arm64);
    }

    #[test]
    fn test_feed_suffix() {
        assert_eq!(Platform::Win.feed_suffix(), "");
        assert_eq!(Platform::Mac.feed_suffix(), "-mac");
        assert_eq!(Platform::LinuxGeneric.feed_suffix(), "-linux");
    }
}
