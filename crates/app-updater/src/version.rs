//! Application version values.
//!
//! Wraps [`semver::Version`] with the ordering the updater needs: build
//! metadata is ignored entirely, and a prerelease always ranks below the
//! release with the same numeric fields.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EligibilityError;

/// A parsed semantic version of the application.
#[derive(Debug, Clone)]
pub struct AppVersion(semver::Version);

impl AppVersion {
    /// Parse a version string.
    ///
    /// Accepts an optional leading `v` (as used by release tags). Anything
    /// without three numeric dot-separated components is rejected.
    pub fn parse(input: &str) -> Result<Self, EligibilityError> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        semver::Version::parse(body)
            .map(Self)
            .map_err(|e| EligibilityError::InvalidVersion {
                value: input.to_string(),
                reason: e.to_string(),
            })
    }

    /// Build a plain release version.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Prerelease tag, if any (e.g. `beta.2`).
    pub fn prerelease(&self) -> Option<&str> {
        if self.0.pre.is_empty() {
            None
        } else {
            Some(self.0.pre.as_str())
        }
    }

    /// Build metadata, if any. Never affects ordering.
    pub fn build_metadata(&self) -> Option<&str> {
        if self.0.build.is_empty() {
            None
        } else {
            Some(self.0.build.as_str())
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// Leading alphabetic identifier of the prerelease tag (`beta` for `beta.2`).
    pub fn prerelease_channel_hint(&self) -> Option<&str> {
        let pre = self.prerelease()?;
        let head = pre.split('.').next().unwrap_or(pre);
        let end = head
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(head.len());
        let word = &head[..end];
        if word.is_empty() {
            None
        } else {
            Some(word)
        }
    }

    /// Compare precedence, ignoring build metadata.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.0
            .major
            .cmp(&other.0.major)
            .then(self.0.minor.cmp(&other.0.minor))
            .then(self.0.patch.cmp(&other.0.patch))
            .then_with(|| match (self.0.pre.is_empty(), other.0.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.0.pre.cmp(&other.0.pre),
            })
    }

    /// Whether `self` should replace `current`.
    pub fn is_newer_than(&self, current: &Self) -> bool {
        self.compare(current) == Ordering::Greater
    }
}

impl PartialEq for AppVersion {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for AppVersion {}

impl PartialOrd for AppVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AppVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for AppVersion {
    type Err = EligibilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<semver::Version> for AppVersion {
    fn from(v: semver::Version) -> Self {
        Self(v)
    }
}

impl Serialize for AppVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AppVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
