//! Release channels.
//!
//! The updater supports these release tracks:
//! - **Stable**: production releases
//! - **Beta**: pre-release testing, may have bugs
//! - **Alpha**: early builds, least mature
//! - **Custom**: a named track (e.g. an enterprise ring) that sees its own
//!   releases plus stable ones
//!
//! A client only considers releases whose channel is at or below its own
//! maturity: stable clients never see beta releases, beta clients see both.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::version::AppVersion;

/// Release maturity tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReleaseChannel {
    /// Production releases
    #[default]
    Stable,
    /// Pre-release testing
    Beta,
    /// Early development builds
    Alpha,
    /// Named custom track
    Custom(String),
}

impl ReleaseChannel {
    /// Parse a channel name. Unknown names become [`ReleaseChannel::Custom`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "stable" | "latest" => Self::Stable,
            "beta" => Self::Beta,
            "alpha" => Self::Alpha,
            _ => Self::Custom(name.trim().to_string()),
        }
    }

    /// Infer the channel of a release from its prerelease tag.
    ///
    /// `1.4.0-beta.2` is beta, `1.4.0-alpha` is alpha, `1.4.0-rc.1` is a
    /// custom `rc` channel, plain releases are stable.
    pub fn from_version(version: &AppVersion) -> Self {
        match version.prerelease_channel_hint() {
            None => {
                if version.is_prerelease() {
                    Self::Alpha
                } else {
                    Self::Stable
                }
            }
            Some(hint) => Self::from_name(hint),
        }
    }

    /// Maturity rank (0 = most mature). Custom channels share a rank with
    /// alpha but are only matched by name.
    pub fn maturity_rank(&self) -> u8 {
        match self {
            Self::Stable => 0,
            Self::Beta => 1,
            Self::Alpha | Self::Custom(_) => 2,
        }
    }

    /// Whether a client configured for `self` may consider a release
    /// published on `release`.
    pub fn accepts(&self, release: &ReleaseChannel) -> bool {
        match (self, release) {
            (_, Self::Stable) => true,
            (Self::Custom(mine), Self::Custom(theirs)) => mine.eq_ignore_ascii_case(theirs),
            (Self::Custom(_), _) | (_, Self::Custom(_)) => false,
            (mine, theirs) => theirs.maturity_rank() <= mine.maturity_rank(),
        }
    }

    /// Stem of the feed file published for this channel.
    pub fn feed_file_stem(&self) -> &str {
        match self {
            Self::Stable => "latest",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
            Self::Custom(name) => name,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ReleaseChannel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReleaseChannel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_name(&raw))
    }
}
